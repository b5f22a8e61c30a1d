use std::time::{SystemTime, UNIX_EPOCH};

use crate::util::print::die;

/// Stored when a trace has no thread attached to it (yet)
pub const INVALID_THREAD_ID: u64 = u64::MAX;

/// The kernel's id for the calling thread
pub fn thread_id() -> u64 {
    // SAFETY: `gettid` takes no arguments and cannot fail
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

/// A per-thread PRNG seed: wall clock mixed with the thread id. Never zero,
/// since zero is a fixed point of xorshift.
pub fn seed() -> u32 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() ^ u64::from(d.subsec_nanos()))
        .unwrap_or(0);
    let mixed = now.wrapping_add(thread_id()).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    match (mixed >> 32) as u32 ^ mixed as u32 {
        0 => 0xacd9_79ce,
        n => n,
    }
}

/// Microseconds on the monotonic clock. Does not allocate, so it is usable
/// with the pool lock held.
pub fn monotonic_micros() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: `ts` is a valid out-pointer, and CLOCK_MONOTONIC always exists
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}

/// Register `prepare` to run before `fork()`, and `parent`/`child` to run in
/// the respective process after it.
pub fn install_at_fork(
    prepare: unsafe extern "C" fn(),
    parent: unsafe extern "C" fn(),
    child: unsafe extern "C" fn(),
) {
    // SAFETY: the handlers are plain `extern "C"` functions with static
    // lifetime, which is all `pthread_atfork()` needs.
    if unsafe { libc::pthread_atfork(Some(prepare), Some(parent), Some(child)) } != 0 {
        die("failed to install fork handlers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threads_have_distinct_ids() {
        let here = thread_id();
        let there = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(here, there);
        assert_ne!(here, INVALID_THREAD_ID);
    }

    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let a = monotonic_micros();
        let b = monotonic_micros();
        assert!(a > 0 && b >= a);
    }

    #[test]
    fn seeds_are_never_zero() {
        for _ in 0..100 {
            assert_ne!(seed(), 0);
        }
    }
}
