//! Turning a detected misuse into a real fault.

use std::{
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    alloc::state::{AllocatorState, Error},
    util::print::{hex, putstr},
};

/// Receives a misuse after the failure record has been written to the state.
///
/// The production sink never returns. A sink that does return (tests) makes
/// the allocator abandon the operation that failed, leaving the pool exactly
/// as it was before the bad call.
pub trait FaultSink: Sync {
    fn raise(&self, state: &AllocatorState);
}

/// Raise a `SIGSEGV` by writing to the pool's first guard page. The fault
/// happens at a real instruction with real registers, which is what the crash
/// handler wants to describe.
pub struct SegvFault;

impl FaultSink for SegvFault {
    fn raise(&self, state: &AllocatorState) {
        if let Some((kind, address)) = state.failure() {
            let mut buf = [0u8; 18];
            putstr("guardpool: ");
            putstr(kind.as_str());
            putstr(" at ");
            putstr(hex(address, &mut buf));
            putstr("\n");
        }
        // SAFETY: this is the point, the first page of the pool is always a
        // guard page and the write faults.
        unsafe { ptr::write_volatile(state.pool_base() as *mut u8, 0) };
        // Only reachable if the guard page was somehow writable
        std::process::abort()
    }
}

/// Counts raised faults instead of crashing
#[derive(Default)]
pub struct RecordingFault {
    raised: AtomicUsize,
}

impl RecordingFault {
    pub const fn new() -> Self {
        Self {
            raised: AtomicUsize::new(0),
        }
    }

    pub fn raised(&self) -> usize {
        self.raised.load(Ordering::SeqCst)
    }
}

impl FaultSink for RecordingFault {
    fn raise(&self, _: &AllocatorState) {
        self.raised.fetch_add(1, Ordering::SeqCst);
    }
}

/// Record `kind` at `address` and hand over to `sink`
pub fn trap(state: &AllocatorState, sink: &dyn FaultSink, address: usize, kind: Error) {
    state.record_failure(kind, address);
    sink.raise(state);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_sees_the_failure() {
        let state = AllocatorState::new(0x1000, 4096, 1);
        let sink = RecordingFault::new();
        trap(&state, &sink, 0x2003, Error::InvalidFree);
        assert_eq!(sink.raised(), 1);
        assert_eq!(state.failure(), Some((Error::InvalidFree, 0x2003)));
    }
}
