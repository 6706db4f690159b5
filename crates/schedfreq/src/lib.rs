//! Scheduler-driven CPU frequency governor core.
//!
//! The governor turns per-CPU utilization samples into frequency requests
//! for the hardware's frequency domains. The scheduler side calls
//! [`Governor::update_util`] (or [`Governor::tick`]) from its hot path; the
//! governor aggregates demand across the CPUs sharing a domain, applies a
//! headroom margin, rate-limits commits, and hands the chosen target to a
//! platform-supplied [`FreqActuator`] over one of two paths:
//!
//! - fast switch: a non-blocking actuator call made directly from the
//!   utilization update, for hardware that can reprogram without sleeping;
//! - slow path: a per-domain worker thread that may block in the actuator,
//!   fed through a coalescing single-slot channel.
//!
//! All entry points take explicit nanosecond timestamps, so behavior is
//! deterministic under test and the embedder decides the clock.
//!
//! ```no_run
//! use std::sync::Arc;
//! use schedfreq::{DomainConfig, Governor, GovernorOptions, UtilClass};
//! # fn actuator() -> Arc<dyn schedfreq::FreqActuator> { unimplemented!() }
//!
//! # fn main() -> schedfreq::Result<(), schedfreq::GovernorError> {
//! let gov = Governor::new(GovernorOptions {
//!     nr_cpus: 4,
//!     tunable_scope: Default::default(),
//! })?;
//! gov.start(
//!     DomainConfig {
//!         id: 0,
//!         cpus: vec![0, 1, 2, 3],
//!         min_khz: 200_000,
//!         max_khz: 1_000_000,
//!         table: None,
//!         transition_latency_ns: 50_000,
//!         fast_switch: true,
//!         stale_window_ns: 10_000_000,
//!     },
//!     actuator(),
//! )?;
//! gov.update_util(0, UtilClass::Cfs, 1_000_000, 300, 1024);
//! # Ok(())
//! # }
//! ```

mod capacity;
mod domain;
mod error;
mod governor;
mod hook;
mod policy;
mod selector;
mod throttle;
mod tunables;
mod worker;

pub use capacity::{CapacityModel, CpuDesc, EfficiencyClass};
pub use domain::{CommitPhase, UtilClass};
pub use error::GovernorError;
pub use governor::{DomainStatus, Governor, GovernorOptions};
pub use policy::{
    DomainConfig, FastSwitch, FreqActuator, Limits, OperatingPoint, CAPACITY_SCALE,
};
pub use tunables::{
    TunableScope, TunableSet, DEFAULT_CAPACITY_MARGIN, DEFAULT_RATE_LIMIT_NS, LATENCY_MULTIPLIER,
};

/// Crate-wide result alias carrying an [`error_stack::Report`] context.
pub type Result<T, C> = error_stack::Result<T, C>;
