//! Per-domain governor state and the fast decision path.
//!
//! Everything a running frequency domain needs lives in one [`DomainState`]
//! shared between the per-CPU update hooks, the administrative side, and
//! (for slow-switching hardware) the worker thread. The decision lock is the
//! single serialization point for commits; the per-CPU utilization records
//! next to it are written lock-free by their owning CPU.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::policy::{DomainConfig, FastSwitch, FreqActuator, Limits};
use crate::selector::{self, RecordView, SelectorInput};
use crate::throttle::ThrottleGate;
use crate::tunables::TunableSet;
use crate::worker::{SlowPath, SlowRequest};

/// Scheduling class a utilization sample is accounted to. A CPU's effective
/// utilization is the sum over all classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtilClass {
    Cfs,
    Rt,
    Dl,
}

pub(crate) const NR_UTIL_CLASSES: usize = 3;

impl UtilClass {
    fn lane(self) -> usize {
        match self {
            UtilClass::Cfs => 0,
            UtilClass::Rt => 1,
            UtilClass::Dl => 2,
        }
    }
}

/// One CPU's last-reported utilization, single-writer (the owning CPU),
/// multi-reader (aggregation scans). Readers tolerate torn class/ceiling
/// combinations; staleness checks on the timestamp bound the damage.
#[derive(Debug, Default)]
pub(crate) struct CpuRecord {
    class_util: [AtomicU64; NR_UTIL_CLASSES],
    total: AtomicU64,
    max: AtomicU64,
    last_update_ns: AtomicU64,
}

impl CpuRecord {
    /// Record a sample for one class and return the new total utilization.
    fn store(&self, class: UtilClass, now_ns: u64, util: u64, max: u64) -> u64 {
        self.class_util[class.lane()].store(util, Ordering::Relaxed);
        let total: u64 = self
            .class_util
            .iter()
            .map(|l| l.load(Ordering::Relaxed))
            .fold(0, u64::saturating_add);
        self.total.store(total, Ordering::Relaxed);
        self.max.store(max, Ordering::Relaxed);
        self.last_update_ns.store(now_ns, Ordering::Relaxed);
        total
    }

    pub(crate) fn view(&self) -> RecordView {
        RecordView {
            util: self.total.load(Ordering::Relaxed),
            max: self.max.load(Ordering::Relaxed),
            last_update_ns: self.last_update_ns.load(Ordering::Relaxed),
        }
    }
}

/// Where a domain stands in the commit cycle.
///
/// The phase records the outcome of the most recent commit attempt; it is
/// not decayed by the passage of time. In particular `Throttled` persists
/// after the throttle interval elapses, until a later decision replaces it —
/// admission of new evaluations is governed by the throttle gate alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPhase {
    Idle,
    /// A target is computed and waiting for the slow-path worker.
    Pending,
    /// An actuator call is in flight.
    Applying,
    /// The last commit succeeded and armed the throttle.
    Throttled,
}

/// Mutable decision state, guarded by the domain lock.
#[derive(Debug)]
pub(crate) struct DecisionState {
    pub gate: ThrottleGate,
    pub limits: Limits,
    pub last_eval_ns: u64,
    /// Last frequency requested from the actuator (0 = none yet).
    pub requested_khz: u32,
    /// Last frequency the actuator confirmed (0 = inherited/unknown).
    pub current_khz: u32,
    pub phase: CommitPhase,
}

pub(crate) struct DomainState {
    pub cfg: DomainConfig,
    pub tunables: Arc<TunableSet>,
    pub actuator: Arc<dyn FreqActuator>,
    pub enabled: AtomicBool,
    /// One-shot throttle bypass, set when limits change.
    pub force_update: AtomicBool,
    pub decision: Mutex<DecisionState>,
    /// Indexed by position in `cfg.cpus`.
    pub records: Vec<CpuRecord>,
    /// Present when the actuator needs the blocking path.
    pub slow: Option<SlowPath>,
}

impl DomainState {
    pub(crate) fn new(
        cfg: DomainConfig,
        tunables: Arc<TunableSet>,
        actuator: Arc<dyn FreqActuator>,
    ) -> Self {
        let limits = Limits {
            min_khz: cfg.min_khz,
            max_khz: cfg.max_khz,
        };
        let records = (0..cfg.cpus.len()).map(|_| CpuRecord::default()).collect();
        let slow = (!cfg.fast_switch).then(SlowPath::new);
        Self {
            cfg,
            tunables,
            actuator,
            enabled: AtomicBool::new(false),
            force_update: AtomicBool::new(false),
            decision: Mutex::new(DecisionState {
                gate: ThrottleGate::new(),
                limits,
                last_eval_ns: 0,
                requested_khz: 0,
                current_khz: 0,
                phase: CommitPhase::Idle,
            }),
            records,
            slow,
        }
    }

    pub(crate) fn shared(&self) -> bool {
        self.cfg.cpus.len() > 1
    }

    /// A holder that panicked mid-commit leaves nothing worse than a stale
    /// decision, so poison is recoverable.
    pub(crate) fn lock_decision(&self) -> MutexGuard<'_, DecisionState> {
        self.decision.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a selected target. Caller holds the decision lock; the target
    /// is clamped into the current limits before anything touches hardware.
    pub(crate) fn commit(&self, ds: &mut DecisionState, now_ns: u64, target_khz: u32) {
        let target = ds.limits.clamp(target_khz);
        ds.last_eval_ns = now_ns;
        if target == ds.requested_khz {
            return;
        }
        ds.requested_khz = target;

        if !self.cfg.fast_switch {
            ds.phase = CommitPhase::Pending;
            if let Some(slow) = &self.slow {
                slow.submit(SlowRequest {
                    target_khz: target,
                    time_ns: now_ns,
                });
            }
            return;
        }

        ds.phase = CommitPhase::Applying;
        match self.actuator.fast_switch(self.cfg.id, target) {
            FastSwitch::Applied(applied) => {
                ds.current_khz = applied;
                ds.gate.mark_committed(now_ns, self.tunables.rate_limit_ns());
                ds.phase = CommitPhase::Throttled;
                tracing::trace!(
                    domain = self.cfg.id,
                    freq_khz = applied,
                    "fast switch applied"
                );
            }
            FastSwitch::Rejected => {
                // Discard; the next utilization sample re-attempts.
                ds.requested_khz = ds.current_khz;
                ds.phase = CommitPhase::Idle;
                tracing::debug!(
                    domain = self.cfg.id,
                    freq_khz = target,
                    "fast switch rejected, keeping current frequency"
                );
            }
        }
    }
}

/// Per-CPU registration binding a CPU to its domain. Published through the
/// hook registry; dispatched on every utilization update for that CPU.
pub(crate) struct UpdateHook {
    pub domain: Arc<DomainState>,
    /// This CPU's index into the domain's record table.
    pub idx: usize,
}

impl UpdateHook {
    /// The utilization-update hot path. Never blocks: a contended decision
    /// lock means another CPU of the domain (or the worker) is already
    /// deciding, and this sample simply doesn't propose.
    pub(crate) fn update(&self, class: UtilClass, now_ns: u64, util: u64, max: u64) {
        let d = &*self.domain;
        if !d.enabled.load(Ordering::Acquire) {
            return;
        }
        let total = d.records[self.idx].store(class, now_ns, util, max);
        self.evaluate(
            now_ns,
            RecordView {
                util: total,
                max,
                last_update_ns: now_ns,
            },
        );
    }

    /// Out-of-band evaluation used when no class-tagged sample is available
    /// (e.g. RT/DL-only phases): acts as a saturated report without touching
    /// the CPU's record.
    pub(crate) fn trigger(&self, now_ns: u64) {
        if !self.domain.enabled.load(Ordering::Acquire) {
            return;
        }
        self.evaluate(
            now_ns,
            RecordView {
                util: u64::MAX,
                max: 0,
                last_update_ns: now_ns,
            },
        );
    }

    fn evaluate(&self, now_ns: u64, seed: RecordView) {
        let d = &*self.domain;
        let Ok(mut ds) = d.decision.try_lock() else {
            return;
        };
        if matches!(ds.phase, CommitPhase::Pending | CommitPhase::Applying) {
            return;
        }
        if !ds.gate.should_update(now_ns, &d.force_update) {
            return;
        }

        let demand = if d.shared() {
            let others = d
                .records
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != self.idx)
                .map(|(_, r)| r.view());
            selector::aggregate(seed, others, now_ns, d.cfg.stale_window_ns)
        } else {
            selector::aggregate(seed, std::iter::empty(), now_ns, d.cfg.stale_window_ns)
        };

        let input = SelectorInput {
            limits: ds.limits,
            table: d.cfg.table.as_deref(),
            margin: d.tunables.capacity_margin(),
        };
        match selector::select(&input, demand, ds.requested_khz) {
            Some(target) => d.commit(&mut ds, now_ns, target),
            None => ds.last_eval_ns = now_ns,
        }
    }
}
