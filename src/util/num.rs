/// Test if `n` is a power of two. Zero is not.
pub const fn is_power_of_two(n: usize) -> bool {
    n != 0 && n & (n - 1) == 0
}

/// Round up `n` to the nearest multiple of `to`, which must be a power of two
pub const fn round_up(n: usize, to: usize) -> usize {
    debug_assert!(is_power_of_two(to));
    (n + to - 1) & !(to - 1)
}

/// Align `addr` up to `align`, which must be a power of two. Already-aligned
/// addresses are returned unchanged.
pub const fn align_up(addr: usize, align: usize) -> usize {
    debug_assert!(is_power_of_two(align));
    if addr & (align - 1) == 0 {
        addr
    } else {
        addr + align - (addr & (align - 1))
    }
}

/// Align `addr` down to `align`, which must be a power of two.
pub const fn align_down(addr: usize, align: usize) -> usize {
    debug_assert!(is_power_of_two(align));
    addr & !(align - 1)
}

/// The address of the page containing `addr`
pub const fn page_addr(addr: usize, page_size: usize) -> usize {
    align_down(addr, page_size)
}

/// Test if `ptr` is aligned to a multiple of `align`
pub fn aligned_to<T>(ptr: *const T, align: usize) -> bool {
    ptr as usize % align == 0
}
