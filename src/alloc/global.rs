//! A `#[global_allocator]` that samples into a [`GuardedPoolAllocator`] and
//! sends everything else to a fallback allocator.
//!
//! ```no_run
//! use guardpool::{GuardedAlloc, Options};
//!
//! fn options() -> Options {
//!     Options::from_env().unwrap_or_default()
//! }
//!
//! #[global_allocator]
//! static GLOBAL: GuardedAlloc = unsafe { GuardedAlloc::new(options, dlmalloc::GlobalDlmalloc) };
//!
//! fn main() {
//!     let sometimes_guarded = Box::new([0u8; 64]);
//!     drop(sometimes_guarded);
//! }
//! ```

use std::{
    alloc::{GlobalAlloc, Layout},
    ptr,
};

use dlmalloc::GlobalDlmalloc;

use crate::{
    alloc::{guarded::GuardedPoolAllocator, options::Options},
    lazy_lock::{LazyLock, LazyLockState},
    util::hint::cold,
};

pub struct GuardedAlloc<A = GlobalDlmalloc>
where
    A: GlobalAlloc,
{
    options: fn() -> Options,
    pool: LazyLock<GuardedPoolAllocator>,
    fallback: A,
}

impl<A> GuardedAlloc<A>
where
    A: GlobalAlloc,
{
    /// The pool is built from `options()` on the first allocation. Anything
    /// allocated while that is happening (including by `options()` itself)
    /// goes to `fallback`.
    ///
    /// # Safety
    ///
    /// - The `GuardedAlloc` must live in a `static`: the pool registers itself
    ///   with fork and crash handlers, which keep a reference to it forever.
    /// - `fallback` must be safe to use as a global allocator
    pub const unsafe fn new(options: fn() -> Options, fallback: A) -> Self {
        Self {
            options,
            pool: LazyLock::new(),
            fallback,
        }
    }

    /// The pool, if it has been built (and building it didn't fail)
    pub fn pool(&self) -> Option<&GuardedPoolAllocator> {
        match self.pool.state() {
            LazyLockState::Init => self.pool.get(),
            LazyLockState::Initializing => None,
            LazyLockState::Uninit => cold(|| self.initialize()),
        }
    }

    fn initialize(&self) -> Option<&GuardedPoolAllocator> {
        let pool = self
            .pool
            .initialize_once(|| GuardedPoolAllocator::new(&(self.options)()))?;
        // SAFETY: `new()` requires `self` to be a static, and the pool is
        // never moved out of it
        let pool: &'static GuardedPoolAllocator = unsafe { &*(pool as *const GuardedPoolAllocator) };
        pool.register_singleton();
        Some(pool)
    }

    pub const fn fallback(&self) -> &A {
        &self.fallback
    }

    fn owner(&self, ptr: *mut u8) -> Option<&GuardedPoolAllocator> {
        self.pool.get().filter(|pool| pool.pointer_is_mine(ptr))
    }
}

unsafe impl<A> GlobalAlloc for GuardedAlloc<A>
where
    A: GlobalAlloc,
{
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if let Some(pool) = self.pool() {
            if let Ok(ptr) = pool.try_allocate(layout.size(), layout.align()) {
                return ptr.as_ptr();
            }
        }
        self.fallback.alloc(layout)
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if let Some(pool) = self.pool() {
            // Slot pages are freshly mapped on every reuse, so always zero
            if let Ok(ptr) = pool.try_allocate(layout.size(), layout.align()) {
                return ptr.as_ptr();
            }
        }
        self.fallback.alloc_zeroed(layout)
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        match self.owner(ptr) {
            Some(pool) => pool.deallocate(ptr),
            None => self.fallback.dealloc(ptr, layout),
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(pool) = self.owner(ptr) else {
            return self.fallback.realloc(ptr, layout, new_size);
        };
        // SAFETY: same alignment as an allocation that already exists, and
        // the caller guarantees the size doesn't overflow
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        let new = self.alloc(new_layout);
        if !new.is_null() {
            // SAFETY: both are valid for the smaller of the two sizes, and
            // distinct allocations
            unsafe { ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size)) };
            pool.deallocate(ptr);
        }
        new
    }
}
