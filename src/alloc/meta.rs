//! Per-slot allocation metadata. There is exactly one [`AllocationMetadata`]
//! per slot, indexed identically to the slots. An entry is overwritten when
//! its slot goes live, updated once when it is freed, and otherwise left
//! alone so a crash handler can still describe the last allocation that used
//! the slot.

use bytemuck::Zeroable;

use crate::os::thread::INVALID_THREAD_ID;

/// Frames kept per trace
pub const MAX_TRACE_FRAMES: usize = 32;

/// A function that fills `frames` with return addresses of the current call
/// stack (innermost first) and returns how many it wrote.
pub type BacktraceFn = fn(frames: &mut [usize]) -> usize;

/// A captured call stack: opaque program counters, symbolized by whoever
/// reports the crash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct Trace {
    frames: [usize; MAX_TRACE_FRAMES],
    len: usize,
}

// SAFETY: all-zeroes is an empty trace
unsafe impl Zeroable for Trace {}

impl Trace {
    pub const fn empty() -> Self {
        Self {
            frames: [0; MAX_TRACE_FRAMES],
            len: 0,
        }
    }

    /// Capture the current stack with `backtrace`, if there is one
    pub fn capture(backtrace: Option<BacktraceFn>) -> Self {
        let mut trace = Self::empty();
        if let Some(backtrace) = backtrace {
            trace.len = backtrace(&mut trace.frames).min(MAX_TRACE_FRAMES);
        }
        trace
    }

    pub fn frames(&self) -> &[usize] {
        &self.frames[..self.len]
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Who did an allocation (or deallocation), and from where
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct CallSiteInfo {
    pub thread_id: u64,
    pub trace: Trace,
}

// SAFETY: both fields are `Zeroable`
unsafe impl Zeroable for CallSiteInfo {}

impl CallSiteInfo {
    pub const fn none() -> Self {
        Self {
            thread_id: INVALID_THREAD_ID,
            trace: Trace::empty(),
        }
    }

    fn record(&mut self, thread_id: u64, trace: Trace) {
        self.thread_id = thread_id;
        self.trace = trace;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct AllocationMetadata {
    /// Address handed to the user, `0` if the slot was never used
    pub addr: usize,
    /// The exact requested size
    pub requested_size: usize,
    pub is_deallocated: bool,
    pub allocation: CallSiteInfo,
    pub deallocation: CallSiteInfo,
}

// SAFETY: a zeroed entry is "slot never used", and every field is plain data
unsafe impl Zeroable for AllocationMetadata {}

impl AllocationMetadata {
    /// The slot went live
    pub fn record_allocation(&mut self, addr: usize, size: usize, thread_id: u64, trace: Trace) {
        self.addr = addr;
        self.requested_size = size;
        self.is_deallocated = false;
        self.allocation.record(thread_id, trace);
        self.deallocation = CallSiteInfo::none();
    }

    /// The slot's allocation was freed
    pub fn record_deallocation(&mut self, thread_id: u64, trace: Trace) {
        self.is_deallocated = true;
        self.deallocation.record(thread_id, trace);
    }

    /// Whether this entry has ever described an allocation
    pub fn is_used(&self) -> bool {
        self.addr != 0
    }

    /// Whether this entry describes a live allocation
    pub fn is_live(&self) -> bool {
        self.is_used() && !self.is_deallocated
    }

    /// Is `addr` inside the requested `[addr, addr + requested_size)`?
    pub fn contains(&self, addr: usize) -> bool {
        self.addr <= addr && addr < self.addr + self.requested_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_backtrace(frames: &mut [usize]) -> usize {
        for (i, f) in frames.iter_mut().take(3).enumerate() {
            *f = 0x1000 + i;
        }
        3
    }

    fn greedy_backtrace(frames: &mut [usize]) -> usize {
        frames.fill(1);
        usize::MAX
    }

    #[test]
    fn zeroed_metadata_is_unused() {
        let meta = AllocationMetadata::zeroed();
        assert!(!meta.is_used());
        assert!(!meta.is_live());
        assert!(meta.allocation.trace.is_empty());
    }

    #[test]
    fn allocation_then_deallocation() {
        let mut meta = AllocationMetadata::zeroed();
        meta.record_allocation(0x4000, 16, 7, Trace::capture(Some(fake_backtrace)));
        assert!(meta.is_live());
        assert_eq!(meta.allocation.thread_id, 7);
        assert_eq!(meta.allocation.trace.frames(), &[0x1000, 0x1001, 0x1002]);
        assert_eq!(meta.deallocation.thread_id, INVALID_THREAD_ID);
        assert!(meta.contains(0x4000));
        assert!(meta.contains(0x400f));
        assert!(!meta.contains(0x4010));

        meta.record_deallocation(8, Trace::empty());
        assert!(meta.is_used());
        assert!(!meta.is_live());
        assert_eq!(meta.deallocation.thread_id, 8);

        // Reuse resets the deallocation side
        meta.record_allocation(0x6000, 1, 9, Trace::empty());
        assert!(meta.is_live());
        assert_eq!(meta.deallocation, CallSiteInfo::none());
    }

    #[test]
    fn oversized_backtrace_counts_are_clamped() {
        let trace = Trace::capture(Some(greedy_backtrace));
        assert_eq!(trace.frames().len(), MAX_TRACE_FRAMES);
        assert!(Trace::capture(None).is_empty());
    }
}
