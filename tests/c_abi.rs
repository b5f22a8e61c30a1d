use std::{ffi::c_void, sync::OnceLock};

use guardpool::{
    externc::{
        guardpool_diagnose, guardpool_disable, guardpool_enable, guardpool_failure_address,
        guardpool_iterate, guardpool_pointer_is_mine, guardpool_stop,
    },
    Error, GuardedPoolAllocator, Options, RecordingFault,
};

static SINK: RecordingFault = RecordingFault::new();
static POOL: OnceLock<GuardedPoolAllocator> = OnceLock::new();

/// The registered singleton, shared by every test in this binary
fn pool() -> &'static GuardedPoolAllocator {
    let pool = POOL.get_or_init(|| {
        let _ = env_logger::builder().is_test(true).try_init();
        let options = Options {
            sample_rate: 1,
            max_simultaneous_allocations: 16,
            install_fork_handlers: true,
            ..Options::default()
        };
        GuardedPoolAllocator::new(&options).with_fault_sink(&SINK)
    });
    pool.register_singleton();
    assert!(std::ptr::eq(GuardedPoolAllocator::singleton().unwrap(), pool));
    pool
}

/// Run `f` in a forked child, returning its exit code
fn in_child(f: impl FnOnce() -> i32) -> i32 {
    unsafe {
        let pid = libc::fork();
        assert!(pid >= 0);
        if pid == 0 {
            libc::_exit(f());
        }
        let mut status = 0;
        assert_eq!(libc::waitpid(pid, &mut status, 0), pid);
        assert!(libc::WIFEXITED(status));
        libc::WEXITSTATUS(status)
    }
}

unsafe extern "C" fn collect(base: usize, size: usize, arg: *mut c_void) {
    (*(arg as *mut Vec<(usize, usize)>)).push((base, size));
}

#[test]
fn iterate_reports_live_allocations() {
    let pool = pool();
    let p = pool.allocate(40, 8) as usize;
    assert!(guardpool_pointer_is_mine(p as *const c_void));

    // Reserved up front: the callback must not allocate
    let mut seen: Vec<(usize, usize)> = Vec::with_capacity(16);
    guardpool_disable();
    unsafe {
        guardpool_iterate(p, 1, collect, &mut seen as *mut _ as *mut c_void);
        guardpool_enable();
    }
    assert_eq!(seen, vec![(p, 40)]);
    pool.deallocate(p as *mut u8);
}

#[test]
fn diagnose_classifies_pool_addresses() {
    let pool = pool();
    let p = pool.allocate(8, 8);
    pool.deallocate(p);
    assert_eq!(guardpool_diagnose(p as usize), Error::UseAfterFree as u8);
    assert_eq!(guardpool_diagnose(0x10), Error::Unknown as u8);
    assert!(!guardpool_pointer_is_mine(std::ptr::null()));
}

#[test]
fn stop_freezes_the_pool() {
    let pool = pool();
    let code = in_child(|| {
        guardpool_stop();
        if !pool.is_stopped() || !pool.allocate(8, 8).is_null() {
            return 1;
        }
        // A crash handler can still look at the pool, the lock is not needed
        let _ = guardpool_diagnose(pool.state().pool_base());
        if !guardpool_pointer_is_mine(pool.state().pool_base() as *const c_void) {
            return 2;
        }
        0
    });
    assert_eq!(code, 0);
    assert!(!pool.is_stopped());
}

#[test]
fn fork_handlers_leave_the_child_usable() {
    let pool = pool();
    let code = in_child(|| {
        let p = pool.allocate(16, 16);
        if p.is_null() && pool.has_free_slots() {
            return 1;
        }
        if !p.is_null() {
            pool.deallocate(p);
        }
        0
    });
    assert_eq!(code, 0);
}

#[test]
fn trapped_misuse_is_visible_to_crash_handlers() {
    let pool = pool();
    let code = in_child(|| {
        let p = pool.allocate(8, 8);
        if p.is_null() {
            return 3;
        }
        pool.deallocate(p);
        pool.deallocate(p);
        if SINK.raised() == 0 || guardpool_failure_address() != p as usize {
            return 1;
        }
        if guardpool_diagnose(pool.state().pool_base()) != Error::DoubleFree as u8 {
            return 2;
        }
        0
    });
    assert_eq!(code, 0);
}
