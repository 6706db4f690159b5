//! User-adjustable governor parameters.
//!
//! A [`TunableSet`] is shared by every domain using it (one per domain, or
//! one for the whole governor, depending on [`TunableScope`]). Values are
//! atomic cells: readers on the hot path load them without locks and changes
//! take effect on the next evaluation.

use std::sync::atomic::{AtomicU64, Ordering};

use error_stack::Result;
use serde::{Deserialize, Serialize};

use crate::GovernorError;

/// Default headroom factor applied to utilization before frequency mapping,
/// as a fraction of [`crate::CAPACITY_SCALE`]: 1280/1024 = 1.25x.
pub const DEFAULT_CAPACITY_MARGIN: u64 = 1280;

/// Throttle interval defaults to this multiple of the hardware transition
/// latency when the latency is known.
pub const LATENCY_MULTIPLIER: u64 = 1000;

/// Fallback throttle interval for hardware with no latency hint.
pub const DEFAULT_RATE_LIMIT_NS: u64 = 10_000_000;

/// How tunable sets are shared across domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TunableScope {
    /// All domains observe one shared tunable set; the first domain to start
    /// seeds its defaults.
    Global,
    /// Each domain gets its own set, seeded from its own transition latency.
    #[default]
    PerDomain,
}

#[derive(Debug)]
pub struct TunableSet {
    rate_limit_ns: AtomicU64,
    capacity_margin: AtomicU64,
}

impl TunableSet {
    pub fn new(rate_limit_ns: u64, capacity_margin: u64) -> Self {
        Self {
            rate_limit_ns: AtomicU64::new(rate_limit_ns),
            capacity_margin: AtomicU64::new(capacity_margin),
        }
    }

    /// Defaults derived from a domain's hardware transition latency.
    pub fn for_latency(transition_latency_ns: u64) -> Self {
        let rate_limit_ns = if transition_latency_ns > 0 {
            transition_latency_ns.saturating_mul(LATENCY_MULTIPLIER)
        } else {
            DEFAULT_RATE_LIMIT_NS
        };
        Self::new(rate_limit_ns, DEFAULT_CAPACITY_MARGIN)
    }

    pub fn rate_limit_ns(&self) -> u64 {
        self.rate_limit_ns.load(Ordering::Relaxed)
    }

    pub fn capacity_margin(&self) -> u64 {
        self.capacity_margin.load(Ordering::Relaxed)
    }

    pub fn set_rate_limit_us(&self, us: u64) {
        self.rate_limit_ns
            .store(us.saturating_mul(1000), Ordering::Relaxed);
    }

    pub fn set_capacity_margin(&self, margin: u64) {
        self.capacity_margin.store(margin, Ordering::Relaxed);
    }

    /// String-typed store for the administrative boundary. Invalid input is
    /// rejected without mutating any value.
    pub fn store(&self, name: &str, value: &str) -> Result<(), GovernorError> {
        let parsed: u64 = value.trim().parse().map_err(|_| {
            error_stack::report!(GovernorError::invalid_tunable(format!(
                "{name}: expected a non-negative integer, got {value:?}"
            )))
        })?;
        match name {
            "rate_limit_us" => self.set_rate_limit_us(parsed),
            "capacity_margin" => self.set_capacity_margin(parsed),
            _ => {
                return Err(error_stack::report!(GovernorError::invalid_tunable(
                    format!("unknown tunable {name:?}")
                )))
            }
        }
        tracing::info!(tunable = name, value = parsed, "tunable updated");
        Ok(())
    }

    /// String-typed read for the administrative boundary.
    pub fn show(&self, name: &str) -> Result<String, GovernorError> {
        match name {
            "rate_limit_us" => Ok((self.rate_limit_ns() / 1000).to_string()),
            "capacity_margin" => Ok(self.capacity_margin().to_string()),
            _ => Err(error_stack::report!(GovernorError::invalid_tunable(
                format!("unknown tunable {name:?}")
            ))),
        }
    }
}
