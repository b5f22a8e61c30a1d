//! A small futex-backed mutex.
//!
//! `std::sync::Mutex` can only be released by dropping its guard, but the
//! allocator has to take its locks in a `pthread_atfork()` prepare handler
//! and release them in separate parent/child handlers, and `stop()` wants to
//! take the pool lock and never give it back. So the lock state is exposed
//! directly: `lock()`, `try_lock()` and `unlock()`, plus a [`ScopedLock`]
//! guard for everything else.
//!
//! States: `0` unlocked, `1` locked, `2` locked with (possible) waiters.

use std::sync::atomic::Ordering;

use linux_futex::{Futex, Private};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

pub struct RawMutex {
    futex: Futex<Private>,
}

impl RawMutex {
    pub const fn new() -> Self {
        Self {
            futex: Futex::new(UNLOCKED),
        }
    }

    /// Take the lock without blocking. Returns `true` if we now hold it.
    pub fn try_lock(&self) -> bool {
        self.futex
            .value
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn lock(&self) {
        if self.try_lock() {
            return;
        }
        self.lock_contended();
    }

    #[cold]
    fn lock_contended(&self) {
        // Spin a little first, the critical sections here are a handful of
        // index updates.
        for _ in 0..100 {
            if self.futex.value.load(Ordering::Relaxed) == UNLOCKED && self.try_lock() {
                return;
            }
            std::hint::spin_loop();
        }
        while self.futex.value.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            // `WrongValue` and `Interrupted` both just mean "look again"
            let _ = self.futex.wait(CONTENDED);
        }
    }

    /// Release the lock.
    ///
    /// # Safety
    ///
    /// The lock must be held, either by this thread or by a thread whose
    /// ownership was handed over to us (the `fork()` child inherits the
    /// parent's locks this way).
    pub unsafe fn unlock(&self) {
        if self.futex.value.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            self.futex.wake(1);
        }
    }

    pub fn is_locked(&self) -> bool {
        self.futex.value.load(Ordering::Relaxed) != UNLOCKED
    }

    pub fn scoped(&self) -> ScopedLock<'_> {
        self.lock();
        ScopedLock { mutex: self }
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds a [`RawMutex`] until dropped
pub struct ScopedLock<'a> {
    mutex: &'a RawMutex,
}

impl Drop for ScopedLock<'_> {
    fn drop(&mut self) {
        // SAFETY: a `ScopedLock` is only constructed after taking the lock
        unsafe { self.mutex.unlock() }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::UnsafeCell;

    use super::RawMutex;

    struct Counter {
        lock: RawMutex,
        value: UnsafeCell<usize>,
    }

    unsafe impl Sync for Counter {}

    impl Counter {
        fn increment(&self) {
            let _guard = self.lock.scoped();
            unsafe { *self.value.get() += 1 };
        }
    }

    #[test]
    fn try_lock_fails_while_held() {
        let m = RawMutex::new();
        assert!(m.try_lock());
        assert!(m.is_locked());
        assert!(!m.try_lock());
        unsafe { m.unlock() };
        assert!(!m.is_locked());
        assert!(m.try_lock());
        unsafe { m.unlock() };
    }

    #[test]
    fn scoped_lock_releases_on_drop() {
        let m = RawMutex::new();
        {
            let _guard = m.scoped();
            assert!(m.is_locked());
        }
        assert!(!m.is_locked());
    }

    #[test]
    fn contended_increments_are_not_lost() {
        let counter = Counter {
            lock: RawMutex::new(),
            value: UnsafeCell::new(0),
        };
        crossbeam::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|_| {
                    for _ in 0..10_000 {
                        counter.increment();
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(unsafe { *counter.value.get() }, 80_000);
    }
}
