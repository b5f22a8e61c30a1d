use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::atomic::{AtomicU8, Ordering},
};

use crate::util::hint::cold;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LazyLockState {
    /// Signifies this lock is uninitialized
    Uninit,
    /// Signifies this lock is initialized
    Init,
    /// Signifies this lock is mid initialization. An allocator that is asked
    /// for memory by its own initializer sees this.
    Initializing,
}

impl LazyLockState {
    const fn from_u8(n: u8) -> Self {
        match n {
            0 => LazyLockState::Uninit,
            1 => LazyLockState::Init,
            _ => LazyLockState::Initializing,
        }
    }
}

/// A lazily initialized value that lets you poll its initialization state
/// (including mid-init) and never blocks. Whoever loses the race to
/// initialize just doesn't get a value yet, which is the right answer for an
/// allocator: it has somewhere else to go.
pub struct LazyLock<T> {
    cell: UnsafeCell<MaybeUninit<T>>,
    state: AtomicU8,
}

// SAFETY: the value is written once, before `state` is published as `Init`
// with release ordering, and only shared references are handed out after.
unsafe impl<T: Send + Sync> Sync for LazyLock<T> {}
unsafe impl<T: Send> Send for LazyLock<T> {}

impl<T> LazyLock<T> {
    pub const fn new() -> Self {
        Self {
            cell: UnsafeCell::new(MaybeUninit::uninit()),
            state: AtomicU8::new(LazyLockState::Uninit as u8),
        }
    }

    pub fn state(&self) -> LazyLockState {
        LazyLockState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// # Safety
    ///
    /// The state must be [`LazyLockState::Init`]
    pub unsafe fn assume_init(&self) -> &T {
        // This borrow is not needless
        #[allow(clippy::needless_borrow)]
        (&*self.cell.get()).assume_init_ref()
    }

    pub fn get(&self) -> Option<&T> {
        match self.state() {
            // SAFETY: just checked
            LazyLockState::Init => Some(unsafe { self.assume_init() }),
            _ => None,
        }
    }

    /// Run `init` if nobody has started initializing yet. Returns the value
    /// only to the caller whose `init` produced it, so that caller can finish
    /// any setup that needs the value at its final address.
    pub fn initialize_once(&self, init: impl FnOnce() -> T) -> Option<&T> {
        if self.state() != LazyLockState::Uninit {
            return None;
        }
        cold(|| {
            self.state
                .compare_exchange(
                    LazyLockState::Uninit as u8,
                    LazyLockState::Initializing as u8,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .ok()?;
            // SAFETY: we won the race to `Initializing`, nobody else writes
            // the cell and nobody reads it until `Init` is published.
            unsafe { *self.cell.get() = MaybeUninit::new(init()) };
            self.state.store(LazyLockState::Init as u8, Ordering::Release);
            // SAFETY: just published
            Some(unsafe { self.assume_init() })
        })
    }
}

impl<T> Default for LazyLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LazyLock<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == LazyLockState::Init as u8 {
            // SAFETY: initialized, and this is the last use
            unsafe { self.cell.get_mut().assume_init_drop() }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn initializes_exactly_once() {
        let lock = LazyLock::new();
        assert_eq!(lock.state(), LazyLockState::Uninit);
        assert_eq!(lock.get(), None);
        assert_eq!(lock.initialize_once(|| 5), Some(&5));
        assert_eq!(lock.state(), LazyLockState::Init);
        assert_eq!(lock.initialize_once(|| 6), None);
        assert_eq!(lock.get(), Some(&5));
    }

    #[test]
    fn initializer_sees_initializing() {
        let lock: LazyLock<u32> = LazyLock::new();
        let value = lock.initialize_once(|| {
            assert_eq!(lock.state(), LazyLockState::Initializing);
            // A reentrant caller does not get in, and does not block
            assert_eq!(lock.initialize_once(|| unreachable!()), None);
            assert_eq!(lock.get(), None);
            1
        });
        assert_eq!(value, Some(&1));
    }

    #[test]
    fn racing_threads_initialize_once() {
        let lock: LazyLock<usize> = LazyLock::new();
        let runs = AtomicUsize::new(0);
        crossbeam::thread::scope(|s| {
            for i in 0..8 {
                let (lock, runs) = (&lock, &runs);
                s.spawn(move |_| {
                    lock.initialize_once(|| {
                        runs.fetch_add(1, Ordering::SeqCst);
                        i
                    })
                });
            }
        })
        .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(lock.get().is_some());
    }

    #[test]
    fn drops_the_value() {
        let counter = std::rc::Rc::new(());
        {
            let lock = LazyLock::new();
            lock.initialize_once(|| counter.clone());
            assert_eq!(std::rc::Rc::strong_count(&counter), 2);
        }
        assert_eq!(std::rc::Rc::strong_count(&counter), 1);
    }
}
