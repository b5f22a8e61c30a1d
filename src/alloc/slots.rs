//! Bookkeeping for which slots are virgin, free or live. This is only index
//! juggling: the caller holds the pool lock around every call, and does the
//! page-permission work outside of it.

use rand::Rng;

use crate::{
    alloc::state::SlotIndex,
    os::{mem::MmapArray, thread::monotonic_micros},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Number of slots in the pool
    pub capacity: usize,
    /// Slots that have held an allocation at least once
    pub sampled: usize,
    /// Slots that were used and are now available again
    pub free: usize,
    /// Slots currently backing an allocation
    pub live: usize,
    /// Successful reservations since the pool was built
    pub reservations: u64,
    /// Live slots integrated over time, in slot-microseconds
    pub live_micros: u64,
}

impl PoolStats {
    /// Slots that have never been handed out
    pub fn virgin(&self) -> usize {
        self.capacity - self.sampled
    }

    /// How long a reservation has been held on average, in microseconds
    pub fn average_lifetime_micros(&self) -> u64 {
        self.live_micros.checked_div(self.reservations).unwrap_or(0)
    }
}

/// Time-weighted count of live slots. Every reservation and free first adds
/// `live * (now - previous)` for the stretch since the last one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Occupancy {
    live_micros: u64,
    previous: u64,
    reservations: u64,
}

impl Occupancy {
    const fn new() -> Self {
        Self {
            live_micros: 0,
            previous: 0,
            reservations: 0,
        }
    }

    /// The clock starts with the first reservation
    fn accumulate(&mut self, live: usize, started: bool, now: u64) {
        if started {
            let elapsed = now.saturating_sub(self.previous);
            self.live_micros = self.live_micros.saturating_add(elapsed.saturating_mul(live as u64));
        }
        self.previous = now;
    }
}

pub struct SlotPool {
    capacity: usize,
    /// Slots `[0, num_sampled)` have been used at least once
    num_sampled: usize,
    free_slots: MmapArray<usize>,
    free_len: usize,
    occupancy: Occupancy,
}

impl SlotPool {
    pub const fn empty() -> Self {
        Self {
            capacity: 0,
            num_sampled: 0,
            free_slots: MmapArray::empty(),
            free_len: 0,
            occupancy: Occupancy::new(),
        }
    }

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            num_sampled: 0,
            free_slots: MmapArray::new(capacity),
            free_len: 0,
            occupancy: Occupancy::new(),
        }
    }

    /// Hand out a slot. Slots that were never used go first, strictly before
    /// any reuse, so a freed slot stays poisoned for as long as possible. After
    /// that, a uniformly random free slot is picked. `None` when every slot is
    /// live.
    pub fn reserve<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<SlotIndex> {
        self.reserve_at(rng, monotonic_micros())
    }

    fn reserve_at<R: Rng + ?Sized>(&mut self, rng: &mut R, now: u64) -> Option<SlotIndex> {
        self.occupancy.accumulate(self.live(), self.num_sampled > 0, now);
        if self.num_sampled < self.capacity {
            self.num_sampled += 1;
            self.occupancy.reservations += 1;
            return Some(SlotIndex(self.num_sampled - 1));
        }
        if self.free_len == 0 {
            return None;
        }
        self.occupancy.reservations += 1;
        let picked = rng.gen_range(0..self.free_len);
        // SAFETY: the pool lock is held by our caller, which is the only way
        // to reach a `&mut SlotPool`
        let free = unsafe { self.free_slots.as_mut_slice_unchecked() };
        let slot = free[picked];
        self.free_len -= 1;
        free[picked] = free[self.free_len];
        Some(SlotIndex(slot))
    }

    /// Give a slot back. Its pages must already be inaccessible.
    pub fn free(&mut self, slot: SlotIndex) {
        self.free_at(slot, monotonic_micros());
    }

    fn free_at(&mut self, slot: SlotIndex, now: u64) {
        self.occupancy.accumulate(self.live(), self.num_sampled > 0, now);
        debug_assert!(slot.0 < self.num_sampled);
        debug_assert!(self.free_len < self.capacity);
        // SAFETY: as in `reserve()`
        let free = unsafe { self.free_slots.as_mut_slice_unchecked() };
        free[self.free_len] = slot.0;
        self.free_len += 1;
    }

    fn live(&self) -> usize {
        self.num_sampled - self.free_len
    }

    pub fn has_free_slots(&self) -> bool {
        self.num_sampled < self.capacity || self.free_len > 0
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity,
            sampled: self.num_sampled,
            free: self.free_len,
            live: self.live(),
            reservations: self.occupancy.reservations,
            live_micros: self.occupancy.live_micros,
        }
    }
}
