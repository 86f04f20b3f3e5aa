//! Spinlock guarding per-chunk metadata.
//!
//! Critical sections under this lock touch only a handful of fields (free
//! list heads, one folio's metadata, a bitmap word), so a spinlock designed
//! for uncontended use beats a full mutex. `try_lock` fails fast under
//! contention so callers can spin with a pause hint instead of convoying.

use std::sync::atomic::Ordering;

use crate::loom_testing::*;
use crate::world;

/// A spinlock intended for very small, rarely contended critical sections.
pub struct Spinlock {
    locked: AtomicU32,
}

impl Spinlock {
    pub fn new() -> Self {
        Self {
            locked: AtomicU32::new(0),
        }
    }

    /// Initialize a lock living in raw (e.g. freshly mapped) memory.
    ///
    /// # Safety
    /// `self_` must point to writable memory reserved for a `Spinlock`.
    pub unsafe fn init(self_: *mut Self) {
        (*self_).locked = AtomicU32::new(0);
    }

    /// Try to acquire the lock without blocking.
    #[inline]
    pub fn try_lock(&self) -> bool {
        // order: acquire so that the protected data written by the previous
        // holder is visible once we own the lock
        self.locked.swap(1, Ordering::Acquire) == 0
    }

    /// Acquire the lock, spinning until it is available.
    ///
    /// The guard doubles as a suspension checkpoint: while it is held the
    /// thread reports itself as inside an allocator critical section, so
    /// stop-the-world cannot park it mid-update (the collector acquires
    /// these same locks).
    #[inline]
    pub fn lock(&self) -> SpinlockGuard<'_> {
        // enter the critical section before acquiring so a signal cannot
        // land between the two
        let critical = world::enter_critical();
        while !self.try_lock() {
            spin_hint();
        }
        SpinlockGuard {
            lock: self,
            _critical: critical,
        }
    }

    #[inline]
    fn unlock(&self) {
        // order: release so our writes to the protected data are visible to
        // the next holder
        self.locked.store(0, Ordering::Release);
    }

    /// Acquire without a guard, for critical sections that don't nest
    /// lexically (the collector holds a lock across its whole cycle).
    /// Collector-only: no suspension checkpoint is recorded.
    #[inline]
    pub fn raw_lock(&self) {
        while !self.try_lock() {
            spin_hint();
        }
    }

    /// Release a [`raw_lock`](Self::raw_lock) acquisition.
    ///
    /// # Safety
    /// The caller must currently hold the lock via `raw_lock`.
    #[inline]
    pub unsafe fn raw_unlock(&self) {
        self.unlock();
    }
}

/// RAII guard; the lock is released on drop, and any suspension deferred
/// while it was held fires right after.
pub struct SpinlockGuard<'a> {
    lock: &'a Spinlock,
    _critical: world::CriticalSection,
}

impl<'a> Drop for SpinlockGuard<'a> {
    fn drop(&mut self) {
        // release before the critical marker drops: a deferred park must
        // not happen while we still hold the lock
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(loom))]
    #[test]
    fn spinlock_excludes() {
        let lock = Spinlock::new();
        {
            let _g = lock.lock();
            assert!(!lock.try_lock());
        }
        assert!(lock.try_lock());
    }

    #[cfg(not(loom))]
    #[test]
    fn spinlock_threads_count() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static COUNT: AtomicUsize = AtomicUsize::new(0);
        let lock = std::sync::Arc::new(Spinlock::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let _g = lock.lock();
                    // non-atomic rmw protected by the lock
                    let v = COUNT.load(Ordering::Relaxed);
                    COUNT.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(COUNT.load(Ordering::Relaxed), 4000);
    }
}
