//! Where inside a slot an allocation goes, and which pages it needs.
//!
//! ```plaintext
//!   guard  |<------------------ slot ------------------>|  guard
//! +--------+--------------------------------------------+--------+
//! | ////// | [alloc]                                    | ////// |  left aligned
//! +--------+--------------------------------------------+--------+
//! | ////// |                                    [alloc] | ////// |  right aligned
//! +--------+--------------------------------------------+--------+
//! ```
//!
//! An allocation can only catch an overflow on the side it touches, so the
//! side is a coin flip per allocation.

use crate::util::num::{align_down, align_up, is_power_of_two, page_addr, round_up};

/// Default alignment when the caller does not care, `alignof(max_align_t)`
pub const DEFAULT_ALIGNMENT: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn from_coin(heads: bool) -> Self {
        if heads {
            Side::Left
        } else {
            Side::Right
        }
    }
}

/// Bytes of slot needed to serve `size` at `alignment`. Slots are whole pages,
/// so anything up to page alignment costs nothing extra.
pub fn required_backing_size(size: usize, alignment: usize, page_size: usize) -> usize {
    debug_assert!(is_power_of_two(alignment));
    debug_assert!(size != 0);
    if alignment <= page_size {
        size
    } else {
        size + alignment - page_size
    }
}

/// Can a slot of `max_size` bytes serve this request at all?
pub fn fits(size: usize, alignment: usize, page_size: usize, max_size: usize) -> bool {
    is_power_of_two(alignment)
        && alignment <= max_size
        && size <= max_size
        && required_backing_size(size, alignment, page_size) <= max_size
}

/// The user pointer for an allocation of `size` at `alignment` in the slot
/// `[slot_start, slot_start + slot_size)`.
pub fn place(slot_start: usize, slot_size: usize, size: usize, alignment: usize, side: Side) -> usize {
    let ptr = match side {
        Side::Left => align_up(slot_start, alignment),
        Side::Right => align_down(slot_start + slot_size - size, alignment),
    };
    debug_assert!(ptr >= slot_start);
    debug_assert!(ptr + size <= slot_start + slot_size);
    ptr
}

/// The page-aligned range that has to be accessible for `[ptr, ptr + size)`
pub fn pages_spanned(ptr: usize, size: usize, page_size: usize) -> (usize, usize) {
    let start = page_addr(ptr, page_size);
    let end = round_up(ptr + size, page_size);
    (start, end - start)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 4096;
    const SLOT: usize = 0x7000_0000;

    #[test]
    fn placement_is_aligned_and_in_bounds() {
        for size in [1, 7, 8, 15, 16, 100, 1000, 2048, 4095, 4096] {
            for alignment in [1, 2, 4, 8, 16, 64, 256, 1024, 4096] {
                if !fits(size, alignment, PAGE, PAGE) {
                    continue;
                }
                for side in [Side::Left, Side::Right] {
                    let p = place(SLOT, PAGE, size, alignment, side);
                    assert_eq!(p % alignment, 0, "{size} {alignment} {side:?}");
                    assert!(p >= SLOT);
                    assert!(p + size <= SLOT + PAGE);
                }
            }
        }
    }

    #[test]
    fn sides_touch_their_guard() {
        assert_eq!(place(SLOT, PAGE, 8, 8, Side::Left), SLOT);
        assert_eq!(place(SLOT, PAGE, 8, 8, Side::Right), SLOT + PAGE - 8);
        // Right alignment leaves a gap when the size is not a multiple of the
        // alignment
        assert_eq!(place(SLOT, PAGE, 13, 16, Side::Right), SLOT + PAGE - 16);
    }

    #[test]
    fn oversized_requests_do_not_fit() {
        assert!(fits(PAGE, 16, PAGE, PAGE));
        assert!(!fits(PAGE + 1, 16, PAGE, PAGE));
        assert!(!fits(8, 3, PAGE, PAGE));
        assert!(!fits(8, 2 * PAGE, PAGE, PAGE));
        assert!(!fits(8, 0, PAGE, PAGE));
    }

    #[test]
    fn backing_size_grows_past_page_alignment() {
        assert_eq!(required_backing_size(10, 16, PAGE), 10);
        assert_eq!(required_backing_size(10, PAGE, PAGE), 10);
        assert_eq!(required_backing_size(10, 4 * PAGE, PAGE), 10 + 3 * PAGE);
    }

    #[test]
    fn only_touched_pages_are_spanned() {
        assert_eq!(pages_spanned(SLOT, 8, PAGE), (SLOT, PAGE));
        assert_eq!(pages_spanned(SLOT + PAGE - 8, 8, PAGE), (SLOT, PAGE));
        assert_eq!(pages_spanned(SLOT + 100, PAGE, PAGE), (SLOT, 2 * PAGE));
    }
}
