//! The platform page backend. Everything here is page-granular and fatal on
//! failure: a partially mapped guarded pool is not something we can run with.

use std::{
    ffi::CStr,
    marker::PhantomData,
    mem,
    ptr::{self, NonNull},
    slice,
};

use bytemuck::Zeroable;
use libc::{
    mmap, mprotect, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_FIXED, MAP_PRIVATE, PROT_NONE,
    PROT_READ, PROT_WRITE,
};

use crate::util::{
    hint::cold,
    num::round_up,
    print::{die, die_errno},
};

/// Name of the metadata and free slot mappings
pub const METADATA_NAME: &CStr = c"guardpool metadata";
/// Name of every inaccessible page in the pool
pub const GUARD_PAGE_NAME: &CStr = c"guardpool guard page";
/// Name of the pages backing a live allocation
pub const ALIVE_SLOT_NAME: &CStr = c"guardpool alive slot";

/// The system page size. Always a power of two.
pub fn page_size() -> usize {
    page_size::get()
}

#[cfg(target_os = "android")]
fn set_mapping_name(ptr: *mut u8, size: usize, name: &'static CStr) {
    const PR_SET_VMA: libc::c_int = 0x53564d41;
    const PR_SET_VMA_ANON_NAME: libc::c_ulong = 0;
    // SAFETY: naming a mapping has no memory-safety requirements, and the
    // kernel keeps the pointer, which is why `name` must be `'static`.
    unsafe {
        libc::prctl(
            PR_SET_VMA,
            PR_SET_VMA_ANON_NAME,
            ptr as libc::c_ulong,
            size as libc::c_ulong,
            name.as_ptr() as libc::c_ulong,
        );
    }
}

#[cfg(not(target_os = "android"))]
fn set_mapping_name(_: *mut u8, _: usize, _: &'static CStr) {
    // Anonymous mapping names are only supported on Android
}

fn assert_page_aligned(ptr: *mut u8, size: usize) {
    debug_assert!(ptr as usize % page_size() == 0);
    debug_assert!(size % page_size() == 0);
}

/// An owned page-aligned mapping, `munmap()`ed on drop. The empty region owns
/// nothing, which is what a disabled allocator holds.
pub struct MmapRegion {
    ptr: *mut u8,
    size: usize,
}

impl MmapRegion {
    pub const fn empty() -> Self {
        Self {
            ptr: ptr::null_mut(),
            size: 0,
        }
    }

    fn map_with(size: usize, prot: libc::c_int, name: &'static CStr, what: &str) -> Self {
        if size == 0 {
            die("attempted to mmap() 0 bytes")
        }
        let size = round_up(size, page_size());
        // SAFETY: anonymous private mapping at a kernel-chosen address, this
        // cannot alias anything we already own.
        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                size,
                prot,
                MAP_ANONYMOUS | MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == MAP_FAILED {
            cold(|| die_errno(what));
        }
        let ptr = ptr as *mut u8;
        set_mapping_name(ptr, size, name);
        Self { ptr, size }
    }

    /// `mmap()` a zeroed read/write region of at least `size` bytes.
    ///
    /// # Panics
    /// - Never, but kills the process if the mapping fails
    pub fn map(size: usize, name: &'static CStr) -> Self {
        Self::map_with(size, PROT_READ | PROT_WRITE, name, "failed to map metadata memory")
    }

    /// Reserve `size` bytes of address space with no access permissions
    pub fn reserve(size: usize, name: &'static CStr) -> Self {
        Self::map_with(size, PROT_NONE, name, "failed to reserve the guarded pool")
    }

    pub fn addr(&self) -> usize {
        self.ptr as usize
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.ptr.is_null()
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        if self.is_empty() {
            return;
        }
        assert_page_aligned(self.ptr, self.size);
        // SAFETY: we own exactly `self.size` bytes at `self.ptr`, obtained
        // from `mmap()` and never handed out beyond our lifetime.
        if unsafe { munmap(self.ptr as _, self.size) } != 0 {
            cold(|| die_errno("failed to unmap guarded pool memory"));
        }
    }
}

/// Make `[ptr, ptr + size)` of the reserved pool readable and writable.
///
/// # Safety
///
/// The range must be page-aligned and lie inside a reservation made with
/// [`MmapRegion::reserve()`] that is still alive.
pub unsafe fn allocate_in_pool(ptr: usize, size: usize) {
    let ptr = ptr as *mut u8;
    assert_page_aligned(ptr, size);
    if mprotect(ptr as _, size, PROT_READ | PROT_WRITE) != 0 {
        cold(|| die_errno("failed to allocate in the guarded pool"));
    }
    set_mapping_name(ptr, size, ALIVE_SLOT_NAME);
}

/// Make `[ptr, ptr + size)` inaccessible again. The pages are replaced with a
/// fresh `PROT_NONE` mapping rather than `mprotect()`ed, so freed slots give
/// their memory back to the system instead of counting against RSS.
///
/// # Safety
///
/// Same as [`allocate_in_pool()`]. Any reference into the range is dead
/// after this.
pub unsafe fn deallocate_in_pool(ptr: usize, size: usize) {
    let ptr = ptr as *mut u8;
    assert_page_aligned(ptr, size);
    let mapped = mmap(
        ptr as _,
        size,
        PROT_NONE,
        MAP_FIXED | MAP_ANONYMOUS | MAP_PRIVATE,
        -1,
        0,
    );
    if mapped == MAP_FAILED {
        cold(|| die_errno("failed to deallocate in the guarded pool"));
    }
    set_mapping_name(ptr, size, GUARD_PAGE_NAME);
}

/// A fixed-length array of `T` living in its own zeroed mapping. This is how
/// the metadata and free slot tables are stored: they must never come from
/// the heap we are hooked into.
pub struct MmapArray<T> {
    region: MmapRegion,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T> MmapArray<T>
where
    T: Zeroable,
{
    pub const fn empty() -> Self {
        Self {
            region: MmapRegion::empty(),
            len: 0,
            _marker: PhantomData,
        }
    }

    pub fn new(len: usize) -> Self {
        if len == 0 {
            return Self::empty();
        }
        let bytes = mem::size_of::<T>()
            .checked_mul(len)
            .unwrap_or_else(|| die("metadata array size overflows"));
        Self {
            region: MmapRegion::map(bytes.max(1), METADATA_NAME),
            len,
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn base(&self) -> *mut T {
        if self.region.is_empty() {
            NonNull::dangling().as_ptr()
        } else {
            self.region.ptr as *mut T
        }
    }

    pub fn as_slice(&self) -> &[T] {
        // SAFETY:
        // - the mapping is page-aligned, so aligned for any `T` we store
        // - fresh anonymous pages are zeroed, and `T: Zeroable`
        unsafe { slice::from_raw_parts(self.base(), self.len) }
    }

    /// # Safety
    ///
    /// The caller must have exclusive access to the array for the lifetime of
    /// the returned slice (in practice: hold the lock that guards it).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice_unchecked(&self) -> &mut [T] {
        slice::from_raw_parts_mut(self.base(), self.len)
    }
}

// SAFETY: the array is plain memory, synchronisation is the owner's job
unsafe impl<T: Send> Send for MmapArray<T> {}
unsafe impl<T: Sync> Sync for MmapArray<T> {}
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}
