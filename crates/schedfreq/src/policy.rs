//! Domain model: frequency domains, operating points and the actuator seam.

use error_stack::Result;
use serde::{Deserialize, Serialize};

use crate::GovernorError;

/// Full normalized capacity of the fastest CPU in the system.
///
/// Utilization samples and capacity ceilings are expressed on this scale, as
/// are per-CPU capacity factors and the capacity margin tunable.
pub const CAPACITY_SCALE: u64 = 1024;

/// One hardware-supported (frequency, derived capacity) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingPoint {
    pub freq_khz: u32,
    /// Normalized compute capacity delivered at this point, on
    /// [`CAPACITY_SCALE`].
    pub capacity: u64,
}

/// Static description of a frequency domain: the set of CPUs that share one
/// frequency/voltage operating point and the hardware constraints on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    pub id: u32,
    /// CPUs belonging to this domain. Every listed CPU must be unclaimed.
    pub cpus: Vec<usize>,
    /// Hardware minimum frequency.
    pub min_khz: u32,
    /// Hardware maximum frequency.
    pub max_khz: u32,
    /// Discrete operating points in ascending frequency order, or `None` when
    /// the hardware accepts any frequency in `[min_khz, max_khz]`.
    #[serde(default)]
    pub table: Option<Vec<OperatingPoint>>,
    /// Hardware transition latency hint in nanoseconds, zero if unknown.
    /// Seeds the default throttle interval.
    #[serde(default)]
    pub transition_latency_ns: u64,
    /// Whether the actuator's non-blocking fast switch path may be used for
    /// this domain. When false, a dedicated slow-path worker is spawned.
    #[serde(default)]
    pub fast_switch: bool,
    /// A CPU whose last utilization report is older than the previous
    /// frequency evaluation by more than this window is treated as idle and
    /// excluded from shared-domain aggregation.
    #[serde(default = "default_stale_window")]
    pub stale_window_ns: u64,
}

/// One scheduling-period analog; matches a 100 Hz tick.
fn default_stale_window() -> u64 {
    10_000_000
}

impl DomainConfig {
    pub(crate) fn validate(&self) -> Result<(), GovernorError> {
        if self.cpus.is_empty() {
            return Err(error_stack::report!(GovernorError::invalid_config(
                "domain has no CPUs"
            )));
        }
        let mut seen = self.cpus.clone();
        seen.sort_unstable();
        seen.dedup();
        if seen.len() != self.cpus.len() {
            return Err(error_stack::report!(GovernorError::invalid_config(
                "domain CPU list contains duplicates"
            )));
        }
        if self.min_khz == 0 || self.max_khz == 0 {
            return Err(error_stack::report!(GovernorError::invalid_config(
                "frequency bounds must be non-zero"
            )));
        }
        if let Some(table) = &self.table {
            if table.is_empty() {
                return Err(error_stack::report!(GovernorError::invalid_config(
                    "operating-point table is empty"
                )));
            }
            if table.windows(2).any(|w| w[0].freq_khz >= w[1].freq_khz) {
                return Err(error_stack::report!(GovernorError::invalid_config(
                    "operating points must be in strictly ascending frequency order"
                )));
            }
            if table.iter().any(|op| op.capacity == 0) {
                return Err(error_stack::report!(GovernorError::invalid_config(
                    "operating points must have non-zero capacity"
                )));
            }
        }
        Ok(())
    }
}

/// Currently effective frequency bounds of a domain. Starts at the hardware
/// bounds and is narrowed or widened by `limits_changed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub min_khz: u32,
    pub max_khz: u32,
}

impl Limits {
    pub fn clamp(&self, freq_khz: u32) -> u32 {
        // min > max means a degenerate single-point domain pinned at max.
        freq_khz.min(self.max_khz).max(self.min_khz.min(self.max_khz))
    }

    pub fn contains(&self, freq_khz: u32) -> bool {
        self.clamp(freq_khz) == freq_khz
    }
}

/// Outcome of a non-blocking fast switch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastSwitch {
    /// The hardware accepted the request; the frequency actually granted may
    /// differ from the requested target.
    Applied(u32),
    /// The requested entry is invalid for this domain. The decision is
    /// discarded; the next utilization sample re-attempts independently.
    Rejected,
}

/// Hardware frequency-change actuator supplied by the platform layer.
///
/// The governor never talks to clock trees or regulators itself; everything
/// below the operating-point request boundary lives behind this trait.
pub trait FreqActuator: Send + Sync {
    /// Apply `target_khz` without blocking. Called from the utilization
    /// update hot path, only for domains started with `fast_switch` set.
    /// Implementations must not sleep, allocate, or take blocking locks.
    fn fast_switch(&self, domain: u32, target_khz: u32) -> FastSwitch;

    /// Apply `target_khz`, possibly sleeping while the transition completes.
    /// Only ever invoked from the domain's slow-path worker thread.
    fn set_target(&self, domain: u32, target_khz: u32) -> Result<u32, GovernorError>;
}
