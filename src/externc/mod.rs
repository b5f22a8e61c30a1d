//! C entry points for crash handlers, `malloc_iterate()`-style heap walkers
//! and `fork()` wrappers written in other languages. They all operate on the
//! registered singleton, and are no-ops when there is none.

use libc::{c_void, size_t, uintptr_t};

use crate::alloc::{guarded::GuardedPoolAllocator, state::Error};

pub type IterateCallback = unsafe extern "C" fn(base: uintptr_t, size: size_t, arg: *mut c_void);

#[no_mangle]
pub extern "C" fn guardpool_disable() {
    if let Some(pool) = GuardedPoolAllocator::singleton() {
        pool.disable();
    }
}

/// # Safety
///
/// Must follow a [`guardpool_disable()`] by the same thread (or in a child
/// that was forked while it was disabled).
#[no_mangle]
pub unsafe extern "C" fn guardpool_enable() {
    if let Some(pool) = GuardedPoolAllocator::singleton() {
        pool.enable();
    }
}

/// Call `callback(address, size, arg)` for every live pool allocation
/// starting in `[base, base + size)`.
///
/// # Safety
///
/// The pool must be disabled with [`guardpool_disable()`], and `callback`
/// must not allocate.
#[no_mangle]
pub unsafe extern "C" fn guardpool_iterate(
    base: uintptr_t,
    size: size_t,
    callback: IterateCallback,
    arg: *mut c_void,
) {
    if let Some(pool) = GuardedPoolAllocator::singleton() {
        pool.iterate_unchecked(base, size, |addr, len| callback(addr, len, arg));
    }
}

#[no_mangle]
pub extern "C" fn guardpool_stop() {
    if let Some(pool) = GuardedPoolAllocator::singleton() {
        pool.stop();
    }
}

#[no_mangle]
pub extern "C" fn guardpool_pointer_is_mine(ptr: *const c_void) -> bool {
    GuardedPoolAllocator::singleton().is_some_and(|pool| pool.pointer_is_mine(ptr))
}

/// Classify a fault address as an [`Error`] number, `0` (unknown) for
/// addresses outside the pool
#[no_mangle]
pub extern "C" fn guardpool_diagnose(fault_addr: uintptr_t) -> u8 {
    GuardedPoolAllocator::singleton()
        .and_then(|pool| pool.diagnose(fault_addr))
        .unwrap_or(Error::Unknown) as u8
}

/// The pointer the allocator itself trapped on, `0` if it trapped on none
#[no_mangle]
pub extern "C" fn guardpool_failure_address() -> uintptr_t {
    GuardedPoolAllocator::singleton().map_or(0, |pool| pool.state().failure_address())
}
