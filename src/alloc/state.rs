//! Process-wide allocator state: the pool geometry (written once when the
//! allocator is built) and the failure record (written once, on the way to a
//! crash). Everything a crash handler needs to make sense of a fault address
//! can be computed from this struct and the metadata table alone.

use std::{
    fmt,
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};

use serde::{Deserialize, Serialize};

/// What went wrong. Numbering is stable, external crash handlers read the raw
/// `u8` out of [`AllocatorState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Error {
    Unknown = 0,
    UseAfterFree = 1,
    DoubleFree = 2,
    InvalidFree = 3,
    BufferOverflow = 4,
    BufferUnderflow = 5,
}

impl Error {
    pub const fn from_u8(n: u8) -> Self {
        match n {
            1 => Error::UseAfterFree,
            2 => Error::DoubleFree,
            3 => Error::InvalidFree,
            4 => Error::BufferOverflow,
            5 => Error::BufferUnderflow,
            _ => Error::Unknown,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Error::Unknown => "Unknown",
            Error::UseAfterFree => "Use After Free",
            Error::DoubleFree => "Double Free",
            Error::InvalidFree => "Invalid (Wild) Free",
            Error::BufferOverflow => "Buffer Overflow",
            Error::BufferUnderflow => "Buffer Underflow",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Index of a slot in the pool. Slots are never identified by address: the
/// address is always derived from the index with [`slot_address()`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotIndex(pub usize);

/// Start of the usable region of slot `index`, for a pool at `base` whose slots
/// are `stride` bytes apart (one guard page plus the slot). The first guard
/// page sits at `base` itself.
pub const fn slot_address(base: usize, page_size: usize, stride: usize, index: SlotIndex) -> usize {
    base + page_size + index.0 * stride
}

/// Leads an [`AllocatorState`] so a crash handler working on a copy taken
/// from another process can tell whether it knows how to read it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct VersionMagic {
    pub magic: [u8; 4],
    pub version: u16,
    pub reserved: u16,
}

impl VersionMagic {
    pub const MAGIC: [u8; 4] = *b"AsAn";
    /// Bumped whenever the layout of [`AllocatorState`] or
    /// [`AllocationMetadata`](crate::alloc::meta::AllocationMetadata) changes
    pub const VERSION: u16 = 2;

    pub const fn current() -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            reserved: 0,
        }
    }

    const fn zeroed() -> Self {
        Self {
            magic: [0; 4],
            version: 0,
            reserved: 0,
        }
    }

    pub fn is_current(&self) -> bool {
        *self == Self::current()
    }
}

#[repr(C)]
pub struct AllocatorState {
    /// Zero until the allocator is set up
    version_magic: VersionMagic,
    /// First byte of the pool, `0` when the allocator is disabled
    pub(crate) pool_base: usize,
    /// One past the last byte of the pool, `0` when the allocator is disabled
    pub(crate) pool_end: usize,
    pub(crate) page_size: usize,
    pub(crate) max_simultaneous_allocations: usize,
    failure_kind: AtomicU8,
    failure_address: AtomicUsize,
}

impl AllocatorState {
    /// The state of an allocator that never samples anything
    pub const fn disabled() -> Self {
        Self {
            version_magic: VersionMagic::zeroed(),
            pool_base: 0,
            pool_end: 0,
            page_size: 0,
            max_simultaneous_allocations: 0,
            failure_kind: AtomicU8::new(Error::Unknown as u8),
            failure_address: AtomicUsize::new(0),
        }
    }

    pub(crate) fn new(pool_base: usize, page_size: usize, max_simultaneous_allocations: usize) -> Self {
        let mut state = Self {
            version_magic: VersionMagic::current(),
            pool_base,
            pool_end: 0,
            page_size,
            max_simultaneous_allocations,
            ..Self::disabled()
        };
        state.pool_end = pool_base + state.pool_size();
        state
    }

    pub fn version_magic(&self) -> VersionMagic {
        self.version_magic
    }

    pub fn pool_base(&self) -> usize {
        self.pool_base
    }

    pub fn pool_end(&self) -> usize {
        self.pool_end
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn max_simultaneous_allocations(&self) -> usize {
        self.max_simultaneous_allocations
    }

    pub fn is_enabled(&self) -> bool {
        self.pool_end != 0
    }

    /// Every slot is a single page
    pub fn maximum_allocation_size(&self) -> usize {
        self.page_size
    }

    /// Distance between the starts of two neighbouring slots
    pub fn slot_stride(&self) -> usize {
        self.maximum_allocation_size() + self.page_size
    }

    /// Bytes needed for the whole pool, guard pages included
    pub fn pool_size(&self) -> usize {
        self.page_size * (1 + self.max_simultaneous_allocations)
            + self.max_simultaneous_allocations * self.maximum_allocation_size()
    }

    pub fn slot_to_addr(&self, index: SlotIndex) -> usize {
        slot_address(self.pool_base, self.page_size, self.slot_stride(), index)
    }

    /// Whether `ptr` points anywhere into the pool, guard pages included
    #[inline(always)]
    pub fn pointer_is_mine(&self, ptr: usize) -> bool {
        self.pool_base <= ptr && ptr < self.pool_end
    }

    fn addr_to_slot(&self, ptr: usize) -> SlotIndex {
        SlotIndex((ptr - self.pool_base) / self.slot_stride())
    }

    /// The slot `ptr` belongs to, clamped to the valid range. The guard page
    /// preceding a slot maps to that slot.
    pub fn nearest_slot(&self, ptr: usize) -> SlotIndex {
        if ptr <= self.pool_base + self.page_size {
            return SlotIndex(0);
        }
        if ptr >= self.pool_end - self.page_size {
            return SlotIndex(self.max_simultaneous_allocations - 1);
        }
        self.addr_to_slot(ptr)
    }

    pub fn is_guard_page(&self, ptr: usize) -> bool {
        debug_assert!(self.pointer_is_mine(ptr));
        let page_offset = (ptr - self.pool_base) / self.page_size;
        let pages_per_slot = self.maximum_allocation_size() / self.page_size;
        page_offset % (pages_per_slot + 1) == 0
    }

    /// Write the failure record. Only the first failure is kept, if several
    /// threads race here they all end up describing the same one.
    pub(crate) fn record_failure(&self, kind: Error, address: usize) -> bool {
        let first = self
            .failure_kind
            .compare_exchange(
                Error::Unknown as u8,
                kind as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if first {
            self.failure_address.store(address, Ordering::Release);
        }
        first
    }

    pub fn failure_kind(&self) -> Error {
        Error::from_u8(self.failure_kind.load(Ordering::Acquire))
    }

    pub fn failure_address(&self) -> usize {
        self.failure_address.load(Ordering::Acquire)
    }

    /// `Some` once a misuse has been detected by the allocator itself
    pub fn failure(&self) -> Option<(Error, usize)> {
        match self.failure_kind() {
            Error::Unknown => None,
            kind => Some((kind, self.failure_address())),
        }
    }
}

impl fmt::Debug for AllocatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatorState")
            .field("version_magic", &self.version_magic)
            .field("pool_base", &format_args!("{:#x}", self.pool_base))
            .field("pool_end", &format_args!("{:#x}", self.pool_end))
            .field("page_size", &self.page_size)
            .field("max_simultaneous_allocations", &self.max_simultaneous_allocations)
            .field("failure", &self.failure())
            .finish()
    }
}
