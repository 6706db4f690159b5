//! Per-CPU update-hook registry.
//!
//! One slot per CPU holds an atomically published pointer to the hook that
//! should receive that CPU's utilization callbacks. Dispatch is lock-free:
//! readers bump a per-slot counter, load the pointer with acquire ordering
//! and invoke the hook if one is published. `clear` unpublishes the pointer
//! and then drains the counter, which is the quiescence wait that makes it
//! safe to free the hook's memory afterwards.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

struct Slot<T: Send + Sync> {
    hook: AtomicPtr<T>,
    readers: AtomicUsize,
}

pub(crate) struct HookRegistry<T: Send + Sync> {
    slots: Vec<Slot<T>>,
}

impl<T: Send + Sync> HookRegistry<T> {
    pub(crate) fn new(nr_cpus: usize) -> Self {
        Self {
            slots: (0..nr_cpus)
                .map(|_| Slot {
                    hook: AtomicPtr::new(ptr::null_mut()),
                    readers: AtomicUsize::new(0),
                })
                .collect(),
        }
    }

    pub(crate) fn nr_cpus(&self) -> usize {
        self.slots.len()
    }

    /// Publish a hook for `cpu`. Fails (returning the hook) if the slot is
    /// out of range or already occupied; exactly one hook may be active per
    /// CPU at a time.
    pub(crate) fn register(&self, cpu: usize, hook: Box<T>) -> Result<(), Box<T>> {
        let Some(slot) = self.slots.get(cpu) else {
            return Err(hook);
        };
        let raw = Box::into_raw(hook);
        match slot.hook.compare_exchange(
            ptr::null_mut(),
            raw,
            Ordering::Release,
            Ordering::Relaxed,
        ) {
            Ok(_) => Ok(()),
            // Safety: on failure the pointer was never published; we still
            // own it.
            Err(_) => Err(unsafe { Box::from_raw(raw) }),
        }
    }

    /// Unpublish the hook for `cpu` and wait until no reader still holds the
    /// old pointer before handing its memory back.
    pub(crate) fn clear(&self, cpu: usize) -> Option<Box<T>> {
        let slot = self.slots.get(cpu)?;
        let old = slot.hook.swap(ptr::null_mut(), Ordering::AcqRel);
        if old.is_null() {
            return None;
        }
        // Quiescence drain: a reader that incremented before the swap may
        // still be inside the callback; one that increments after it will
        // observe null and back out.
        let mut spins = 0u32;
        while slot.readers.load(Ordering::Acquire) != 0 {
            spins += 1;
            if spins < 64 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
        // Safety: the pointer is unpublished and all in-flight readers have
        // drained, so we are the sole owner again.
        Some(unsafe { Box::from_raw(old) })
    }

    /// Invoke `f` on the currently published hook for `cpu`, if any. A
    /// cleared or never-registered slot is a cheap no-op.
    pub(crate) fn dispatch<R>(&self, cpu: usize, f: impl FnOnce(&T) -> R) -> Option<R> {
        let slot = self.slots.get(cpu)?;
        slot.readers.fetch_add(1, Ordering::Acquire);
        let raw = slot.hook.load(Ordering::Acquire);
        // Safety: non-null means the hook is published; clear() cannot free
        // it until our reader count drops.
        let out = (!raw.is_null()).then(|| f(unsafe { &*raw }));
        slot.readers.fetch_sub(1, Ordering::Release);
        out
    }
}

impl<T: Send + Sync> Drop for HookRegistry<T> {
    fn drop(&mut self) {
        for cpu in 0..self.slots.len() {
            drop(self.clear(cpu));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    #[test]
    fn dispatch_without_hook_is_a_noop() {
        let reg: HookRegistry<u32> = HookRegistry::new(2);
        assert_eq!(reg.dispatch(0, |v| *v), None);
        assert_eq!(reg.dispatch(7, |v| *v), None, "out of range is a no-op");
    }

    #[test]
    fn register_clear_cycle() {
        let reg: HookRegistry<u32> = HookRegistry::new(2);
        reg.register(1, Box::new(42)).unwrap();
        assert_eq!(reg.dispatch(1, |v| *v), Some(42));

        assert!(
            reg.register(1, Box::new(7)).is_err(),
            "slot must hold at most one hook"
        );

        assert_eq!(reg.clear(1).as_deref(), Some(&42));
        assert_eq!(reg.dispatch(1, |v| *v), None);
        assert!(reg.clear(1).is_none());
    }

    #[test]
    fn concurrent_dispatch_survives_clear() {
        let reg: Arc<HookRegistry<AtomicU64>> = Arc::new(HookRegistry::new(1));
        reg.register(0, Box::new(AtomicU64::new(0))).unwrap();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    let mut hits = 0u64;
                    for _ in 0..20_000 {
                        if reg
                            .dispatch(0, |c| c.fetch_add(1, Ordering::Relaxed))
                            .is_some()
                        {
                            hits += 1;
                        }
                    }
                    hits
                })
            })
            .collect();

        // Tear the hook down while readers are hammering the slot; the
        // drain must guarantee every in-flight callback finished.
        std::thread::sleep(std::time::Duration::from_millis(2));
        let hook = reg.clear(0).expect("hook was registered");
        let at_clear = hook.load(Ordering::Relaxed);

        let total: u64 = readers.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, at_clear, "every hit happened before the drain finished");
        assert_eq!(reg.dispatch(0, |c| c.load(Ordering::Relaxed)), None);
    }
}
