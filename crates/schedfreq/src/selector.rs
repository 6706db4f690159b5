//! Frequency selection: aggregate per-CPU demand and map it to a target
//! operating point.

use crate::policy::{Limits, OperatingPoint, CAPACITY_SCALE};

/// One CPU's utilization record as seen by an aggregation scan.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordView {
    pub util: u64,
    pub max: u64,
    pub last_update_ns: u64,
}

/// Aggregated demand of a frequency domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Demand {
    /// Some CPU reported more utilization than its capacity ceiling; the
    /// domain goes straight to its maximum frequency.
    Saturated,
    /// The dominating (utilization, ceiling) pair across the domain.
    Peak { util: u64, max: u64 },
}

/// Scan a shared domain's records and find the CPU with the highest
/// utilization-to-capacity ratio.
///
/// `seed` is the invoking CPU's just-written record and always counts.
/// Records whose timestamp predates `now_ns` by more than `stale_window_ns`
/// belong to CPUs that are probably idle now and are excluded, so an idle
/// CPU's last high-water mark cannot pin the domain at a high frequency.
///
/// Ratios are compared by cross-multiplication; on a tie the incumbent
/// (first seen) record wins, biasing toward the CPU already holding the
/// domain's maximum.
pub(crate) fn aggregate(
    seed: RecordView,
    others: impl Iterator<Item = RecordView>,
    now_ns: u64,
    stale_window_ns: u64,
) -> Demand {
    if seed.max == 0 || seed.util > seed.max {
        return Demand::Saturated;
    }
    let (mut util, mut max) = (seed.util, seed.max);

    for r in others {
        if now_ns.saturating_sub(r.last_update_ns) > stale_window_ns {
            continue;
        }
        if r.max == 0 || r.util > r.max {
            return Demand::Saturated;
        }
        if (r.util as u128) * (max as u128) > (util as u128) * (r.max as u128) {
            util = r.util;
            max = r.max;
        }
    }
    Demand::Peak { util, max }
}

/// Selector configuration for one decision.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SelectorInput<'a> {
    pub limits: Limits,
    /// Discrete operating points, ascending; `None` for continuous ranges.
    pub table: Option<&'a [OperatingPoint]>,
    /// Capacity margin as a fraction of [`CAPACITY_SCALE`].
    pub margin: u64,
}

/// Map aggregated demand to a target frequency.
///
/// Returns `None` when the result equals `requested_khz`, the domain's last
/// requested frequency; redundant commits are suppressed at this point.
pub(crate) fn select(input: &SelectorInput<'_>, demand: Demand, requested_khz: u32) -> Option<u32> {
    let target = input.limits.clamp(raw_target(input, demand));
    (target != requested_khz).then_some(target)
}

fn raw_target(input: &SelectorInput<'_>, demand: Demand) -> u32 {
    let min_f = input.limits.min_khz;
    let max_f = input.limits.max_khz;

    // Degenerate single-point domain.
    if min_f >= max_f {
        return max_f;
    }

    let (util, max) = match demand {
        Demand::Saturated => return round_up(input.table, max_f),
        Demand::Peak { util, max } => (util, max),
    };

    // Fold the headroom margin in before mapping, so the domain ramps ahead
    // of continued load growth.
    let u_sel = ((util as u128) * (input.margin as u128) / (CAPACITY_SCALE as u128))
        .min(u64::MAX as u128) as u64;
    if u_sel >= max {
        return round_up(input.table, max_f);
    }

    let target = match input.table {
        Some(table) => {
            let span = (max_f - min_f) as u128;
            let cont = min_f + (span * u_sel as u128 / max as u128) as u32;
            round_up(Some(table), cont)
        }
        None => {
            // Continuous ranges get a tenth of extra proportionality so a
            // narrow top-most bin is still reachable under real load.
            let top = max_f as u128 + (max_f / 10) as u128;
            let cont = (min_f as u128 + (top - min_f as u128) * u_sel as u128 / max as u128)
                .min(max_f as u128) as u32;
            cont
        }
    };
    target
}

/// Smallest table entry at or above `target_khz`; never rounds down, since
/// under-provisioning causes thrashing. A target above the whole table takes
/// the highest entry.
fn round_up(table: Option<&[OperatingPoint]>, target_khz: u32) -> u32 {
    let Some(table) = table else {
        return target_khz;
    };
    table
        .iter()
        .find(|op| op.freq_khz >= target_khz)
        .or_else(|| table.last())
        .map(|op| op.freq_khz)
        .unwrap_or(target_khz)
}
