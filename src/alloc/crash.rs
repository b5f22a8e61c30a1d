//! Explaining a fault in the pool after the fact.
//!
//! Everything here works from an [`AllocatorState`] and a way of reading slot
//! metadata, so it can run inside a signal handler of a process whose
//! allocator is in an unknown state, or out of process on copies of both. A
//! copied state is only worth reading if its
//! [`version_magic()`](AllocatorState::version_magic) is current.

use serde::{Deserialize, Serialize};

use crate::{
    alloc::{
        meta::AllocationMetadata,
        state::{AllocatorState, Error, SlotIndex},
    },
    serialize::serde_addr,
};

/// Classify a fault at `fault_addr`, which must be inside the pool.
///
/// A misuse the allocator trapped itself wins. Otherwise a fault on a guard
/// page is an overflow or underflow of the nearest neighbouring allocation,
/// and a fault inside a freed slot is a use after free.
pub fn diagnose(
    state: &AllocatorState,
    metadata: impl Fn(SlotIndex) -> AllocationMetadata,
    fault_addr: usize,
) -> Error {
    if !state.pointer_is_mine(fault_addr) {
        return Error::Unknown;
    }
    if let Some((kind, _)) = state.failure() {
        return kind;
    }

    let meta = metadata(culprit_slot(state, &metadata, fault_addr));
    if !meta.is_used() {
        return Error::Unknown;
    }
    if state.is_guard_page(fault_addr) {
        return if meta.addr < fault_addr {
            Error::BufferOverflow
        } else {
            Error::BufferUnderflow
        };
    }
    if meta.is_deallocated {
        return Error::UseAfterFree;
    }
    // A live slot with accessible pages, the fault was not ours
    Error::Unknown
}

/// The slot a fault at `addr` is blamed on. Inside a slot that is the slot
/// itself. On a guard page it is the neighbour on the nearer side of the
/// page, or the other neighbour if the nearer one was never used.
fn culprit_slot(
    state: &AllocatorState,
    metadata: impl Fn(SlotIndex) -> AllocationMetadata,
    addr: usize,
) -> SlotIndex {
    let forward = state.nearest_slot(addr);
    if !state.is_guard_page(addr) {
        return forward;
    }
    let offset = (addr - state.pool_base()) % state.slot_stride();
    let first_guard = addr < state.pool_base() + state.page_size();
    let last_guard = addr >= state.pool_end() - state.page_size();
    let left = (!first_guard).then(|| if last_guard { forward } else { SlotIndex(forward.0 - 1) });
    let right = (!last_guard).then_some(forward);
    let (near, far) = if offset < state.page_size() / 2 {
        (left, right)
    } else {
        (right, left)
    };
    match (near, far) {
        (Some(near), Some(far)) if !metadata(near).is_used() => far,
        (Some(near), _) => near,
        (None, Some(far)) => far,
        (None, None) => forward,
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSiteReport {
    pub thread_id: Option<u64>,
    #[serde(with = "serde_addr::seq")]
    pub trace: Vec<usize>,
}

impl CallSiteReport {
    fn new(site: &crate::alloc::meta::CallSiteInfo) -> Self {
        Self {
            thread_id: (site.thread_id != crate::os::thread::INVALID_THREAD_ID).then_some(site.thread_id),
            trace: site.trace.frames().to_vec(),
        }
    }
}

/// The allocation a fault was attributed to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationReport {
    pub slot: usize,
    #[serde(with = "serde_addr")]
    pub address: usize,
    pub size: usize,
    pub allocated_by: CallSiteReport,
    /// `None` while the allocation is live
    pub deallocated_by: Option<CallSiteReport>,
}

/// What a crash reporter prints. Building one allocates, so only do it once
/// the fault has been confirmed to be in the pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub error: Error,
    /// Where the signal happened
    #[serde(with = "serde_addr")]
    pub fault_address: usize,
    /// For misuse trapped by the allocator, the pointer passed to it. The
    /// fault itself is then a deliberate write to the first guard page.
    pub internal_address: Option<String>,
    pub allocation: Option<AllocationReport>,
}

impl FailureReport {
    pub fn build(
        state: &AllocatorState,
        metadata: impl Fn(SlotIndex) -> AllocationMetadata,
        fault_addr: usize,
    ) -> Self {
        let error = diagnose(state, &metadata, fault_addr);
        let internal = state.failure().map(|(_, addr)| addr);
        let culprit = internal.unwrap_or(fault_addr);

        let allocation = state.pointer_is_mine(culprit).then(|| {
            let slot = culprit_slot(state, &metadata, culprit);
            (slot, metadata(slot))
        });
        let allocation = allocation
            .filter(|(_, meta)| meta.is_used())
            .map(|(slot, meta)| AllocationReport {
                slot: slot.0,
                address: meta.addr,
                size: meta.requested_size,
                allocated_by: CallSiteReport::new(&meta.allocation),
                deallocated_by: meta.is_deallocated.then(|| CallSiteReport::new(&meta.deallocation)),
            });

        Self {
            error,
            fault_address: fault_addr,
            internal_address: internal.map(|addr| format!("{addr:#x}")),
            allocation,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use bytemuck::Zeroable;

    use super::*;
    use crate::alloc::meta::Trace;

    const PAGE: usize = 4096;
    const BASE: usize = 0x40_0000;

    /// A two-slot pool with an 8 byte allocation at the start of slot 0
    fn fixture() -> (AllocatorState, [AllocationMetadata; 2]) {
        let state = AllocatorState::new(BASE, PAGE, 2);
        let mut meta = [AllocationMetadata::zeroed(); 2];
        meta[0].record_allocation(state.slot_to_addr(SlotIndex(0)), 8, 11, Trace::empty());
        (state, meta)
    }

    fn lookup(meta: &[AllocationMetadata]) -> impl Fn(SlotIndex) -> AllocationMetadata + '_ {
        move |slot| meta[slot.0]
    }

    #[test]
    fn foreign_addresses_are_unknown() {
        let (state, meta) = fixture();
        assert_eq!(diagnose(&state, lookup(&meta), BASE - 1), Error::Unknown);
        assert_eq!(diagnose(&state, lookup(&meta), state.pool_end()), Error::Unknown);
    }

    #[test]
    fn guard_pages_give_the_direction() {
        let (state, meta) = fixture();
        let slot = state.slot_to_addr(SlotIndex(0));
        assert_eq!(diagnose(&state, lookup(&meta), slot - 1), Error::BufferUnderflow);
        assert_eq!(diagnose(&state, lookup(&meta), slot + PAGE), Error::BufferOverflow);
    }

    #[test]
    fn freed_slot_is_use_after_free() {
        let (state, mut meta) = fixture();
        let slot = state.slot_to_addr(SlotIndex(0));
        assert_eq!(diagnose(&state, lookup(&meta), slot + 4), Error::Unknown);
        meta[0].record_deallocation(12, Trace::empty());
        assert_eq!(diagnose(&state, lookup(&meta), slot + 4), Error::UseAfterFree);
    }

    #[test]
    fn untouched_slot_is_unknown() {
        let (state, meta) = fixture();
        let slot1 = state.slot_to_addr(SlotIndex(1));
        assert_eq!(diagnose(&state, lookup(&meta), slot1), Error::Unknown);
        // The guard page before slot 1 is blamed on slot 0 while slot 1 is unused
        assert_eq!(diagnose(&state, lookup(&meta), slot1 - 1), Error::BufferOverflow);
        // The trailing guard page only has a left neighbour
        assert_eq!(diagnose(&state, lookup(&meta), state.pool_end() - PAGE), Error::Unknown);
    }

    #[test]
    fn trapped_failure_takes_precedence() {
        let (state, meta) = fixture();
        let slot = state.slot_to_addr(SlotIndex(0));
        state.record_failure(Error::DoubleFree, slot);
        // The trap writes to the first guard page
        assert_eq!(diagnose(&state, lookup(&meta), BASE), Error::DoubleFree);

        let report = FailureReport::build(&state, lookup(&meta), BASE);
        assert_eq!(report.error, Error::DoubleFree);
        assert_eq!(report.internal_address, Some(format!("{slot:#x}")));
        assert_eq!(report.allocation.unwrap().address, slot);
    }

    #[test]
    fn report_describes_the_allocation() {
        let (state, mut meta) = fixture();
        let slot = state.slot_to_addr(SlotIndex(0));
        meta[0].record_deallocation(12, Trace::empty());
        let report = FailureReport::build(&state, lookup(&meta), slot + 2);
        assert_eq!(report.error, Error::UseAfterFree);
        let allocation = report.allocation.clone().unwrap();
        assert_eq!(allocation.size, 8);
        assert_eq!(allocation.allocated_by.thread_id, Some(11));
        assert_eq!(allocation.deallocated_by.unwrap().thread_id, Some(12));

        let json = report.to_json().unwrap();
        assert!(json.contains("\"UseAfterFree\""));
        assert!(json.contains(&format!("\"{:#x}\"", slot + 2)));
        let back: FailureReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }
}
