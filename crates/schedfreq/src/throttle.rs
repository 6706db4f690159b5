//! Minimum inter-decision interval enforcement per frequency domain.

use std::sync::atomic::{AtomicBool, Ordering};

/// Throttle gate state. Lives inside the domain's decision lock; the force
/// flag is a relaxed atomic set from outside the lock by `limits_changed`.
#[derive(Debug, Default)]
pub(crate) struct ThrottleGate {
    next_allowed_ns: u64,
}

impl ThrottleGate {
    pub(crate) fn new() -> Self {
        Self { next_allowed_ns: 0 }
    }

    /// Whether a decision may be evaluated at `now_ns`.
    ///
    /// A pending force request (limits changed) bypasses the interval check
    /// exactly once; the flag is consumed here.
    pub(crate) fn should_update(&self, now_ns: u64, force: &AtomicBool) -> bool {
        if force.swap(false, Ordering::Relaxed) {
            return true;
        }
        now_ns >= self.next_allowed_ns
    }

    /// Re-arm the gate after a committed frequency change. The interval is
    /// re-read on every commit, so tunable changes apply from the next
    /// evaluation without adjusting an in-flight decision.
    pub(crate) fn mark_committed(&mut self, now_ns: u64, interval_ns: u64) {
        self.next_allowed_ns = now_ns.saturating_add(interval_ns);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    #[test]
    fn blocks_until_interval_elapses() {
        let mut gate = ThrottleGate::new();
        let force = AtomicBool::new(false);

        assert!(gate.should_update(0, &force));
        gate.mark_committed(0, 50 * MS);

        assert!(!gate.should_update(10 * MS, &force));
        assert!(!gate.should_update(49 * MS, &force));
        assert!(gate.should_update(50 * MS, &force));
    }

    #[test]
    fn force_bypasses_exactly_once() {
        let mut gate = ThrottleGate::new();
        let force = AtomicBool::new(false);

        gate.mark_committed(0, 50 * MS);
        force.store(true, Ordering::Relaxed);

        assert!(gate.should_update(10 * MS, &force));
        assert!(
            !gate.should_update(11 * MS, &force),
            "force flag must be consumed by the first evaluation"
        );
    }

    #[test]
    fn interval_change_applies_on_next_commit() {
        let mut gate = ThrottleGate::new();
        let force = AtomicBool::new(false);

        gate.mark_committed(0, 50 * MS);
        // Widening the interval does not retroactively move the expiry.
        assert!(gate.should_update(50 * MS, &force));
        gate.mark_committed(50 * MS, 100 * MS);
        assert!(!gate.should_update(120 * MS, &force));
        assert!(gate.should_update(150 * MS, &force));
    }
}
