//! The guarded pool allocator.
//!
//! The pool is one reserved, inaccessible range carved into single-page slots,
//! each with a guard page on either side:
//!
//! ```plaintext
//! +-------+--------+-------+--------+-------+     +--------+-------+
//! | guard | slot 0 | guard | slot 1 | guard | ... | slot N | guard |
//! +-------+--------+-------+--------+-------+     +--------+-------+
//! ^ pool_base                                                      ^ pool_end
//! ```
//!
//! A sampled allocation gets a whole slot. Its pages are made accessible for
//! exactly as long as the allocation is live, so overflows hit a guard page
//! and use-after-frees hit a revoked slot. Double and invalid frees are caught
//! by checking the slot's metadata.
//!
//! Locking: `pool_mutex` guards the slot bookkeeping and the metadata table,
//! `backtrace_mutex` guards the unwinder. They are never held together, and
//! neither is held across the `mmap()`/`mprotect()` calls.

use std::{
    cell::UnsafeCell,
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, Ordering},
};

use crossbeam::utils::CachePadded;
use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use rand::Rng;

use crate::{
    alloc::{
        crash::{self, FailureReport},
        meta::{AllocationMetadata, Trace},
        options::Options,
        placement::{self, Side, DEFAULT_ALIGNMENT},
        sampling::{self, Sampler, ThreadLocals},
        slots::{PoolStats, SlotPool},
        state::{AllocatorState, Error, SlotIndex},
        trap::{self, FaultSink, SegvFault},
    },
    os::{
        mem::{self, MmapArray, MmapRegion, GUARD_PAGE_NAME},
        modules::ModuleWatch,
        thread,
    },
    sync::RawMutex,
    util::{
        hint::cold,
        num::{aligned_to, is_power_of_two},
        print::die,
    },
};

/// Why an allocation was not placed in the pool. None of these are errors:
/// the caller just uses its ordinary allocator instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fallback {
    /// The sampler decided against this allocation
    NotSampled,
    /// The allocator was built disabled
    Disabled,
    /// `stop()` was called
    Stopped,
    /// Bad alignment, or too big for a slot
    Unsupported,
    /// Smaller than the configured minimum sample size
    TooSmall,
    /// Called from inside the allocator on this thread
    Reentrant,
    /// Every slot is live
    PoolExhausted,
}

/// The process-wide allocator that crash handlers and fork handlers talk to
static SINGLETON: OnceCell<&'static GuardedPoolAllocator> = OnceCell::new();

pub struct GuardedPoolAllocator {
    state: AllocatorState,
    sampler: Sampler,
    min_sample_size: usize,
    install_fork_handlers: bool,
    /// The reservation itself, all of `[pool_base, pool_end)`. Only held to be
    /// unmapped on drop.
    _reservation: MmapRegion,
    metadata: MmapArray<AllocationMetadata>,
    slots: UnsafeCell<SlotPool>,
    pool_mutex: CachePadded<RawMutex>,
    /// Some unwinders take the loader lock, so they get their own lock which
    /// is also held across `fork()`.
    backtrace_mutex: CachePadded<RawMutex>,
    stopped: AtomicBool,
    fault_sink: &'static dyn FaultSink,
}

// SAFETY: `slots` and `metadata` are only mutated with `pool_mutex` held, the
// rest is either immutable after construction or atomic.
unsafe impl Sync for GuardedPoolAllocator {}
unsafe impl Send for GuardedPoolAllocator {}

impl GuardedPoolAllocator {
    /// An allocator that owns no memory and never samples. Every entry point
    /// is safe to call on it, which is what allocator hooks that run before
    /// setup see.
    pub const fn disabled() -> Self {
        Self {
            state: AllocatorState::disabled(),
            sampler: Sampler::disabled(),
            min_sample_size: 0,
            install_fork_handlers: false,
            _reservation: MmapRegion::empty(),
            metadata: MmapArray::empty(),
            slots: UnsafeCell::new(SlotPool::empty()),
            pool_mutex: CachePadded::new(RawMutex::new()),
            backtrace_mutex: CachePadded::new(RawMutex::new()),
            stopped: AtomicBool::new(false),
            fault_sink: &SegvFault,
        }
    }

    /// Build the pool described by `options`. Invalid options kill the
    /// process: nothing has been allocated yet, so there is nothing to
    /// recover.
    pub fn new(options: &Options) -> Self {
        // Nothing else is looked at when the pool is switched off
        if !options.is_active() {
            debug!("guarded pool disabled by options");
            return Self::disabled();
        }
        if let Err(e) = options.validate() {
            cold(|| die(&format!("invalid options: {e}")));
        }

        let page_size = mem::page_size();
        if !is_power_of_two(page_size) {
            die("page size is not a power of two");
        }
        let slots = options.max_simultaneous_allocations as usize;
        let pool_size = AllocatorState::new(0, page_size, slots).pool_size();
        let pool = MmapRegion::reserve(pool_size, GUARD_PAGE_NAME);
        let state = AllocatorState::new(pool.addr(), page_size, slots);

        let modules = if options.forced_module_paths.is_empty() {
            None
        } else {
            if options.backtrace.is_none() {
                warn!("forced modules are configured but there is no backtrace function, ignoring them");
            }
            Some(ModuleWatch::new(options.forced_module_paths.clone()))
        };

        info!(
            "guarded pool: {} slots, 1 in {} sampled, {:#x}..{:#x}",
            slots,
            options.sample_rate,
            state.pool_base(),
            state.pool_end()
        );

        Self {
            state,
            sampler: Sampler::new(options.sample_rate as u32, options.backtrace, modules),
            min_sample_size: options.min_sample_size as usize,
            install_fork_handlers: options.install_fork_handlers,
            _reservation: pool,
            metadata: MmapArray::new(slots),
            slots: UnsafeCell::new(SlotPool::new(slots)),
            pool_mutex: CachePadded::new(RawMutex::new()),
            backtrace_mutex: CachePadded::new(RawMutex::new()),
            stopped: AtomicBool::new(false),
            fault_sink: &SegvFault,
        }
    }

    /// Send detected misuse to `sink` instead of faulting
    pub fn with_fault_sink(mut self, sink: &'static dyn FaultSink) -> Self {
        self.fault_sink = sink;
        self
    }

    /// Make this the allocator crash handlers and fork handlers see, and
    /// install the fork handlers if the options asked for them. Only the first
    /// registration in a process wins.
    pub fn register_singleton(&'static self) -> bool {
        if SINGLETON.set(self).is_err() {
            let again = Self::singleton().is_some_and(|registered| ptr::eq(registered, self));
            if !again {
                warn!("a guarded pool is already registered, ignoring another one");
            }
            return again;
        }
        if self.install_fork_handlers && self.state.is_enabled() {
            thread::install_at_fork(fork_prepare, fork_parent, fork_child);
            debug!("guarded pool fork handlers installed");
        }
        true
    }

    pub fn singleton() -> Option<&'static GuardedPoolAllocator> {
        SINGLETON.get().copied()
    }

    pub fn state(&self) -> &AllocatorState {
        &self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.state.is_enabled()
    }

    /// # Safety
    ///
    /// `pool_mutex` must be held
    #[allow(clippy::mut_from_ref)]
    unsafe fn slots_mut(&self) -> &mut SlotPool {
        &mut *self.slots.get()
    }

    /// # Safety
    ///
    /// `pool_mutex` must be held, and `slot` in range
    #[allow(clippy::mut_from_ref)]
    unsafe fn meta_mut(&self, slot: SlotIndex) -> &mut AllocationMetadata {
        &mut self.metadata.as_mut_slice_unchecked()[slot.0]
    }

    #[inline(always)]
    pub fn pointer_is_mine<T>(&self, ptr: *const T) -> bool {
        self.state.pointer_is_mine(ptr as usize)
    }

    /// Should the calling thread's next allocation go into the pool?
    #[inline]
    pub fn should_sample(&self) -> bool {
        sampling::with_current(|tls| self.should_sample_in(tls))
    }

    pub fn should_sample_in(&self, tls: &ThreadLocals) -> bool {
        if self.stopped.load(Ordering::Relaxed) {
            return false;
        }
        if self.state.is_enabled() && !tls.is_recursive() && tls.count_call() {
            cold(|| self.log_occupancy(tls));
        }
        self.sampler.should_sample(tls, &self.backtrace_mutex)
    }

    /// How long slots stay live and how many are free. Skipped if the pool
    /// lock is taken, this runs on the allocation path.
    fn log_occupancy(&self, tls: &ThreadLocals) {
        if !self.pool_mutex.try_lock() {
            return;
        }
        // SAFETY: lock held
        let stats = unsafe { self.slots_mut() }.stats();
        // SAFETY: taken just above
        unsafe { self.pool_mutex.unlock() };
        // The logger may allocate
        let _recursion = tls.enter();
        info!(
            "guarded pool: average lifetime {}us over {} reservations, {} free slots",
            stats.average_lifetime_micros(),
            stats.reservations,
            stats.free
        );
    }

    /// Sample, and if sampled, allocate. `Err` means "use another allocator".
    pub fn try_allocate(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, Fallback> {
        sampling::with_current(|tls| {
            if !self.should_sample_in(tls) {
                return Err(Fallback::NotSampled);
            }
            self.allocate_in(tls, size, alignment)
        })
    }

    /// Allocate in the pool without asking the sampler, null when the pool
    /// can't serve the request. `alignment` of zero means the default.
    pub fn allocate(&self, size: usize, alignment: usize) -> *mut u8 {
        sampling::with_current(|tls| match self.allocate_in(tls, size, alignment) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => ptr::null_mut(),
        })
    }

    pub fn allocate_in(&self, tls: &ThreadLocals, size: usize, alignment: usize) -> Result<NonNull<u8>, Fallback> {
        if !self.state.is_enabled() {
            // Don't come back here for a long time
            self.sampler.defer(tls);
            return Err(Fallback::Disabled);
        }
        if self.stopped.load(Ordering::Relaxed) {
            return Err(Fallback::Stopped);
        }

        let size = size.max(1);
        let alignment = if alignment == 0 { DEFAULT_ALIGNMENT } else { alignment };
        let page_size = self.state.page_size();
        let max_size = self.state.maximum_allocation_size();
        if !placement::fits(size, alignment, page_size, max_size) {
            return Err(Fallback::Unsupported);
        }
        if size < self.min_sample_size {
            return Err(Fallback::TooSmall);
        }

        if tls.is_recursive() {
            return Err(Fallback::Reentrant);
        }
        let _recursion = tls.enter();

        let slot = {
            let _guard = self.pool_mutex.scoped();
            // SAFETY: lock held
            tls.with_rng(|rng| unsafe { self.slots_mut() }.reserve(rng))
        };
        let Some(slot) = slot else {
            return Err(Fallback::PoolExhausted);
        };

        let slot_start = self.state.slot_to_addr(slot);
        let side = tls.with_rng(|rng| Side::from_coin(rng.gen()));
        let user_ptr = placement::place(slot_start, max_size, size, alignment, side);
        debug_assert!(aligned_to(user_ptr as *const u8, alignment));

        // Pages of the slot this allocation doesn't touch stay inaccessible
        let (pages, len) = placement::pages_spanned(user_ptr, size, page_size);
        // SAFETY: the pages lie inside our reservation, in a slot we just
        // reserved and nobody else can touch.
        unsafe { mem::allocate_in_pool(pages, len) };

        let trace = self.sampler.capture(tls, &self.backtrace_mutex);
        {
            let _guard = self.pool_mutex.scoped();
            // SAFETY: lock held, `slot` came from the pool
            unsafe { self.meta_mut(slot) }.record_allocation(user_ptr, size, thread::thread_id(), trace);
        }

        // SAFETY: slot addresses are never zero
        Ok(unsafe { NonNull::new_unchecked(user_ptr as *mut u8) })
    }

    /// Free a pointer owned by this pool (check [`pointer_is_mine()`] first).
    /// Invalid and double frees are trapped.
    ///
    /// [`pointer_is_mine()`]: Self::pointer_is_mine
    pub fn deallocate<T>(&self, ptr: *mut T) {
        sampling::with_current(|tls| self.deallocate_in(tls, ptr as *mut u8))
    }

    pub fn deallocate_in(&self, tls: &ThreadLocals, ptr: *mut u8) {
        let addr = ptr as usize;
        debug_assert!(self.state.pointer_is_mine(addr), "pointer is not mine");
        if !self.state.pointer_is_mine(addr) {
            return;
        }
        let slot = self.state.nearest_slot(addr);

        // The unwinder may allocate, so it must not run under the pool lock,
        // and not at all if we are already inside the allocator.
        let trace = if tls.is_recursive() {
            Trace::empty()
        } else {
            self.sampler.capture(tls, &self.backtrace_mutex)
        };

        let failure = {
            let _guard = self.pool_mutex.scoped();
            // SAFETY: lock held, `nearest_slot()` is always in range
            let meta = unsafe { self.meta_mut(slot) };
            if meta.addr != addr {
                Some(Error::InvalidFree)
            } else if meta.is_deallocated {
                Some(Error::DoubleFree)
            } else {
                // Recorded before the pages go away, so a racing
                // use-after-free sees consistent metadata
                meta.record_deallocation(thread::thread_id(), trace);
                None
            }
        };
        if let Some(kind) = failure {
            cold(|| self.trap_in(tls, addr, kind));
            return;
        }

        let slot_start = self.state.slot_to_addr(slot);
        // SAFETY: the slot is ours until `free()` below. Revoke first, so no
        // thread can be handed a slot that is still accessible.
        unsafe { mem::deallocate_in_pool(slot_start, self.state.maximum_allocation_size()) };

        let _guard = self.pool_mutex.scoped();
        // SAFETY: lock held
        unsafe { self.slots_mut() }.free(slot);
    }

    fn trap_in(&self, tls: &ThreadLocals, addr: usize, kind: Error) {
        // A crash handler that allocates must not come back into the pool
        let _recursion = tls.enter();
        trap::trap(&self.state, self.fault_sink, addr, kind);
    }

    /// The requested size of the live allocation at `ptr`
    pub fn size_of<T>(&self, ptr: *const T) -> usize {
        let addr = ptr as usize;
        debug_assert!(self.state.pointer_is_mine(addr));
        if !self.state.pointer_is_mine(addr) {
            return 0;
        }
        let _guard = self.pool_mutex.scoped();
        // SAFETY: lock held
        let meta = unsafe { self.meta_mut(self.state.nearest_slot(addr)) };
        debug_assert_eq!(meta.addr, addr);
        meta.requested_size
    }

    /// A copy of the metadata of `slot`
    pub fn metadata(&self, slot: SlotIndex) -> Option<AllocationMetadata> {
        if slot.0 >= self.metadata.len() {
            return None;
        }
        let _guard = self.pool_mutex.scoped();
        // SAFETY: lock held, index checked
        Some(*unsafe { self.meta_mut(slot) })
    }

    pub fn stats(&self) -> PoolStats {
        let _guard = self.pool_mutex.scoped();
        // SAFETY: lock held
        unsafe { self.slots_mut() }.stats()
    }

    pub fn has_free_slots(&self) -> bool {
        let _guard = self.pool_mutex.scoped();
        // SAFETY: lock held
        unsafe { self.slots_mut() }.has_free_slots()
    }

    /// Take both locks: nothing can allocate or free in the pool until
    /// [`enable()`](Self::enable). Used around `fork()`.
    pub fn disable(&self) {
        self.pool_mutex.lock();
        self.backtrace_mutex.lock();
    }

    /// # Safety
    ///
    /// Must follow a [`disable()`](Self::disable), on this thread or (after
    /// `fork()`) in the child it was inherited by.
    pub unsafe fn enable(&self) {
        self.pool_mutex.unlock();
        self.backtrace_mutex.unlock();
    }

    /// [`disable()`](Self::disable) until the returned guard is dropped
    pub fn pause(&self) -> PausedPool<'_> {
        self.disable();
        PausedPool { allocator: self }
    }

    /// Call `callback(address, size)` for every live allocation that starts in
    /// `[base, base + size)`. The callback must not allocate.
    ///
    /// # Safety
    ///
    /// The allocator must be disabled.
    pub unsafe fn iterate_unchecked(&self, base: usize, size: usize, mut callback: impl FnMut(usize, usize)) {
        for meta in self.metadata.as_slice() {
            if meta.is_live() && meta.addr >= base && meta.addr < base.saturating_add(size) {
                callback(meta.addr, meta.requested_size);
            }
        }
    }

    /// Stop for good. Called once a crash is under way somewhere in the
    /// process: this thread never samples again, nor does any other, and the
    /// pool lock is taken if it is free so the pool stays frozen for whoever
    /// reports the crash.
    pub fn stop(&self) {
        sampling::with_current(|tls| tls.poison());
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.pool_mutex.try_lock();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Read one metadata entry for a crash handler. The pool lock is used when
    /// it can be taken, otherwise (a stopped pool, a thread that crashed while
    /// holding it) the entry is read as-is.
    fn metadata_for_crash(&self, slot: SlotIndex) -> AllocationMetadata {
        let locked = self.pool_mutex.try_lock();
        // SAFETY: `slot` is in range. Without the lock this read can race a
        // writer, which at worst gives a torn description of a dying process.
        let meta = unsafe { ptr::read_volatile(&self.metadata.as_slice()[slot.0]) };
        if locked {
            // SAFETY: taken just above
            unsafe { self.pool_mutex.unlock() };
        }
        meta
    }

    /// What happened at `fault_addr`? `None` if the address is not ours.
    pub fn diagnose(&self, fault_addr: usize) -> Option<Error> {
        if !self.state.pointer_is_mine(fault_addr) {
            return None;
        }
        Some(crash::diagnose(&self.state, |slot| self.metadata_for_crash(slot), fault_addr))
    }

    /// Everything known about a fault at `fault_addr`, for a reporter
    pub fn failure_report(&self, fault_addr: usize) -> Option<FailureReport> {
        if !self.state.pointer_is_mine(fault_addr) {
            return None;
        }
        Some(FailureReport::build(&self.state, |slot| self.metadata_for_crash(slot), fault_addr))
    }
}

/// A disabled allocator, re-enabled on drop
pub struct PausedPool<'a> {
    allocator: &'a GuardedPoolAllocator,
}

impl PausedPool<'_> {
    /// See [`GuardedPoolAllocator::iterate_unchecked()`]
    pub fn iterate(&self, base: usize, size: usize, callback: impl FnMut(usize, usize)) {
        // SAFETY: we hold the allocator disabled
        unsafe { self.allocator.iterate_unchecked(base, size, callback) }
    }
}

impl Drop for PausedPool<'_> {
    fn drop(&mut self) {
        // SAFETY: disabled in `pause()`
        unsafe { self.allocator.enable() }
    }
}

unsafe extern "C" fn fork_prepare() {
    if let Some(allocator) = GuardedPoolAllocator::singleton() {
        allocator.disable();
    }
}

unsafe extern "C" fn fork_parent() {
    if let Some(allocator) = GuardedPoolAllocator::singleton() {
        allocator.enable();
    }
}

unsafe extern "C" fn fork_child() {
    if let Some(allocator) = GuardedPoolAllocator::singleton() {
        allocator.enable();
    }
}
