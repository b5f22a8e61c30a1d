//! Reads through a dangling pointer to a sampled allocation and reports the
//! fault from a `SIGSEGV` handler.
//!
//! ```plaintext
//! RUST_LOG=debug cargo run --example use_after_free
//! ```

use std::{mem, ptr};

use dlmalloc::GlobalDlmalloc;
use guardpool::{
    util::print::{hex, putstr},
    ForceSampleScope, GuardedAlloc, GuardedPoolAllocator, Options,
};

fn options() -> Options {
    Options::from_env().unwrap_or_default()
}

#[global_allocator]
static GLOBAL: GuardedAlloc = unsafe { GuardedAlloc::new(options, GlobalDlmalloc) };

extern "C" fn on_segv(_: libc::c_int, info: *mut libc::siginfo_t, _: *mut libc::c_void) {
    // SAFETY: the kernel hands us a valid `siginfo_t` for SA_SIGINFO handlers
    let addr = unsafe { (*info).si_addr() } as usize;
    let mut buf = [0u8; 18];
    putstr("SIGSEGV at ");
    putstr(hex(addr, &mut buf));
    match GuardedPoolAllocator::singleton().and_then(|pool| {
        pool.stop();
        pool.diagnose(addr)
    }) {
        Some(error) => {
            putstr(": ");
            putstr(error.as_str());
            putstr(" in the guarded pool\n");
        }
        None => putstr(": not a guarded pool address\n"),
    }
    // SAFETY: async-signal-safe
    unsafe { libc::_exit(1) }
}

fn install_handler() {
    // SAFETY: plain sigaction setup, the handler only uses async-signal-safe
    // calls and the non-allocating pool accessors
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = on_segv as usize;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGSEGV, &action, ptr::null_mut());
    }
}

fn main() {
    env_logger::init();
    install_handler();

    let dangling = {
        let _force = ForceSampleScope::new();
        let value = Box::new(0x5eed_u64);
        &*value as *const u64
    };
    let pool = GLOBAL.pool().filter(|pool| pool.pointer_is_mine(dangling));
    if pool.is_none() {
        println!("the allocation was not sampled (is the pool disabled, or full?)");
        return;
    }
    println!("reading freed memory at {dangling:p}");
    // SAFETY: it isn't, which is the point
    let value = unsafe { ptr::read_volatile(dangling) };
    println!("unreachable: read {value:#x}");
}
