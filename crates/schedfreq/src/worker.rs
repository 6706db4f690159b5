//! Slow-path worker: the only context allowed to block while applying a
//! frequency change.
//!
//! Each slow-switching domain owns one worker thread parked on a condition
//! variable. The fast path hands off a target by overwriting a single
//! request slot and signalling the worker, so superseded requests are
//! dropped rather than queued: the worker always acts on the latest target.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::domain::{CommitPhase, DomainState};

/// A target handed to the worker, stamped with its proposal time so the
/// throttle is re-armed in the caller's time domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlowRequest {
    pub target_khz: u32,
    pub time_ns: u64,
}

/// Wake-channel shared between the fast path and the worker thread.
#[derive(Debug)]
pub(crate) struct SlowPath {
    slot: Mutex<Option<SlowRequest>>,
    cv: Condvar,
    stop: AtomicBool,
}

fn lock_slot<'a>(slot: &'a Mutex<Option<SlowRequest>>) -> MutexGuard<'a, Option<SlowRequest>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SlowPath {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            cv: Condvar::new(),
            stop: AtomicBool::new(false),
        }
    }

    /// Replace any pending request with `req` and wake the worker. Called
    /// from the hot path; the slot lock is only ever held for a few loads.
    pub(crate) fn submit(&self, req: SlowRequest) {
        *lock_slot(&self.slot) = Some(req);
        self.cv.notify_one();
    }

    pub(crate) fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.cv.notify_one();
    }

    #[cfg(test)]
    fn take(&self) -> Option<SlowRequest> {
        lock_slot(&self.slot).take()
    }
}

/// Worker thread main loop. Parks until a request or shutdown arrives;
/// teardown joins deterministically because `shutdown` is observed with the
/// slot lock cycle.
pub(crate) fn run(domain: Arc<DomainState>) {
    let Some(sp) = domain.slow.as_ref() else {
        return;
    };
    tracing::debug!(domain = domain.cfg.id, "slow-path worker started");

    let mut slot = lock_slot(&sp.slot);
    loop {
        if sp.stop.load(Ordering::Acquire) {
            break;
        }
        match slot.take() {
            Some(req) => {
                // Release the wake channel while actuating so newer requests
                // can coalesce into the slot meanwhile.
                drop(slot);
                apply(&domain, req);
                slot = lock_slot(&sp.slot);
            }
            None => {
                slot = match sp.cv.wait(slot) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
        }
    }
    tracing::debug!(domain = domain.cfg.id, "slow-path worker stopped");
}

fn apply(domain: &DomainState, req: SlowRequest) {
    // Serialize with the fast path and with limit changes for the whole
    // actuator call; concurrent proposals see Applying and back off.
    let mut ds = domain.lock_decision();
    if !domain.enabled.load(Ordering::Acquire) {
        ds.phase = CommitPhase::Idle;
        return;
    }
    // The limits may have changed while the request sat in the slot; the
    // committed frequency must honor the bounds in force now, not the ones
    // at proposal time.
    let target = ds.limits.clamp(req.target_khz);
    ds.requested_khz = target;
    ds.phase = CommitPhase::Applying;
    match domain.actuator.set_target(domain.cfg.id, target) {
        Ok(applied) => {
            ds.current_khz = applied;
            ds.gate
                .mark_committed(req.time_ns, domain.tunables.rate_limit_ns());
            ds.phase = CommitPhase::Throttled;
            tracing::trace!(
                domain = domain.cfg.id,
                freq_khz = applied,
                "slow path applied"
            );
        }
        Err(report) => {
            // Not fatal: the decision is dropped and the next sample retries.
            ds.requested_khz = ds.current_khz;
            ds.phase = CommitPhase::Idle;
            tracing::warn!(
                domain = domain.cfg.id,
                freq_khz = target,
                error = ?report,
                "slow path actuation failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{DomainConfig, FastSwitch, FreqActuator, Limits};
    use crate::tunables::TunableSet;
    use crate::GovernorError;

    const MS: u64 = 1_000_000;

    #[derive(Default)]
    struct RecordingActuator {
        calls: Mutex<Vec<u32>>,
    }

    impl RecordingActuator {
        fn calls(&self) -> Vec<u32> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl FreqActuator for RecordingActuator {
        fn fast_switch(&self, _domain: u32, _target_khz: u32) -> FastSwitch {
            FastSwitch::Rejected
        }

        fn set_target(
            &self,
            _domain: u32,
            target_khz: u32,
        ) -> error_stack::Result<u32, GovernorError> {
            self.calls.lock().unwrap().push(target_khz);
            Ok(target_khz)
        }
    }

    fn slow_domain(actuator: Arc<RecordingActuator>) -> Arc<DomainState> {
        let cfg = DomainConfig {
            id: 0,
            cpus: vec![0],
            min_khz: 200_000,
            max_khz: 1_000_000,
            table: None,
            transition_latency_ns: 0,
            fast_switch: false,
            stale_window_ns: 10 * MS,
        };
        let state = Arc::new(DomainState::new(
            cfg,
            Arc::new(TunableSet::for_latency(0)),
            actuator,
        ));
        state.enabled.store(true, Ordering::Release);
        state
    }

    #[test]
    fn submissions_coalesce_to_the_latest() {
        let sp = SlowPath::new();
        for (i, khz) in [300_000u32, 500_000, 700_000].iter().enumerate() {
            sp.submit(SlowRequest {
                target_khz: *khz,
                time_ns: i as u64,
            });
        }
        assert_eq!(
            sp.take(),
            Some(SlowRequest {
                target_khz: 700_000,
                time_ns: 2,
            })
        );
        assert_eq!(sp.take(), None, "superseded requests are dropped, not queued");
    }

    #[test]
    fn late_limit_narrowing_clamps_a_queued_request() {
        let actuator = Arc::new(RecordingActuator::default());
        let state = slow_domain(Arc::clone(&actuator));
        let sp = state.slow.as_ref().unwrap();

        // A saturated sample proposes max while the worker has not woken yet.
        sp.submit(SlowRequest {
            target_khz: 1_000_000,
            time_ns: 1 * MS,
        });
        {
            let mut ds = state.lock_decision();
            ds.requested_khz = 1_000_000;
            ds.phase = CommitPhase::Pending;
            // The bounds narrow before the request is consumed.
            ds.limits = Limits {
                min_khz: 200_000,
                max_khz: 600_000,
            };
        }

        let req = sp.take().unwrap();
        apply(&state, req);

        let ds = state.lock_decision();
        assert_eq!(ds.current_khz, 600_000, "commit must honor the new ceiling");
        assert_eq!(ds.requested_khz, 600_000);
        assert_eq!(ds.phase, CommitPhase::Throttled);
        assert_eq!(actuator.calls(), vec![600_000]);
    }
}
