//! A sampling guarded-page allocator.
//!
//! A small, random fraction of heap allocations is served from a pool where
//! every allocation sits on its own page between two inaccessible guard pages,
//! and where freed memory is made inaccessible. Overflows, underflows and
//! use-after-frees of sampled allocations fault at the offending access, and
//! double or invalid frees are caught by the allocator. Everything that is not
//! sampled goes to an ordinary allocator at the cost of a thread-local
//! decrement.

pub mod alloc;
pub mod externc;
mod lazy_lock;
pub mod os;
pub mod serialize;
pub mod sync;
pub mod util;

pub use alloc::{
    crash::FailureReport,
    global::GuardedAlloc,
    guarded::{Fallback, GuardedPoolAllocator, PausedPool},
    meta::{AllocationMetadata, BacktraceFn},
    options::{Options, OptionsError, OPTIONS_ENV},
    sampling::ForceSampleScope,
    slots::PoolStats,
    state::{AllocatorState, Error, VersionMagic},
    trap::{FaultSink, RecordingFault, SegvFault},
};
