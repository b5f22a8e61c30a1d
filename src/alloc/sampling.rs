//! Deciding which allocations go into the guarded pool.
//!
//! Every thread owns a [`ThreadLocals`]: a PRNG, a countdown to the next
//! sampled allocation, and the recursion guard. The core functions take the
//! context explicitly; [`with_current()`] is the registry that hands out the
//! calling thread's own context.

use std::{cell::Cell, marker::PhantomData};

use rand::{Error as RandError, RngCore, SeedableRng};

use crate::{
    alloc::meta::{BacktraceFn, Trace},
    os::{modules::ModuleWatch, thread},
    sync::RawMutex,
};

/// The countdown is kept in 31 bits
pub const NEXT_SAMPLE_COUNTER_MASK: u32 = (1 << 31) - 1;

/// Largest accepted sample rate (exclusive)
pub const MAX_SAMPLE_RATE: u32 = 1 << 30;

/// Allocations a thread makes between two occupancy log lines
pub const OCCUPANCY_LOG_INTERVAL: u32 = 100_000;

/// State a fresh thread starts in before it is seeded. xorshift32 maps this to
/// `0xfffffffe`, so even an unseeded thread defers sampling for a long time.
const UNSEEDED_STATE: u32 = 0xacd9_79ce;

/// xorshift32: arithmetic only, never allocates, and good enough for deciding
/// when to sample and where to put things.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Xorshift32 {
    state: u32,
}

impl Xorshift32 {
    pub const fn new(state: u32) -> Self {
        Self {
            state: if state == 0 { UNSEEDED_STATE } else { state },
        }
    }

    pub const fn state(&self) -> u32 {
        self.state
    }
}

impl RngCore for Xorshift32 {
    fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }

    fn next_u64(&mut self) -> u64 {
        (u64::from(self.next_u32()) << 32) | u64::from(self.next_u32())
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(4) {
            let bytes = self.next_u32().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), RandError> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl SeedableRng for Xorshift32 {
    type Seed = [u8; 4];

    fn from_seed(seed: Self::Seed) -> Self {
        Self::new(u32::from_le_bytes(seed))
    }
}

/// Per-thread sampling state. No destructor and const-constructible, so it can
/// live in a `thread_local!` that is usable from inside `malloc()`.
pub struct ThreadLocals {
    random_state: Cell<u32>,
    next_sample_counter: Cell<u32>,
    recursive_guard: Cell<bool>,
    seeded: Cell<bool>,
    forced: Cell<u32>,
    calls: Cell<u32>,
}

impl ThreadLocals {
    pub const fn new() -> Self {
        Self {
            random_state: Cell::new(UNSEEDED_STATE),
            next_sample_counter: Cell::new(0),
            recursive_guard: Cell::new(false),
            seeded: Cell::new(false),
            forced: Cell::new(0),
            calls: Cell::new(0),
        }
    }

    /// A context with a fixed PRNG seed, for reproducible runs
    pub fn with_seed(seed: u64) -> Self {
        let tls = Self::new();
        tls.random_state.set(Xorshift32::seed_from_u64(seed).state());
        tls.seeded.set(true);
        tls
    }

    /// Run `f` with this thread's PRNG, seeding it first if this is its first
    /// use.
    pub fn with_rng<R>(&self, f: impl FnOnce(&mut Xorshift32) -> R) -> R {
        if !self.seeded.get() {
            self.random_state.set(Xorshift32::new(thread::seed()).state());
            self.seeded.set(true);
        }
        let mut rng = Xorshift32::new(self.random_state.get());
        let result = f(&mut rng);
        self.random_state.set(rng.state());
        result
    }

    pub fn is_recursive(&self) -> bool {
        self.recursive_guard.get()
    }

    /// Mark this thread as inside the allocator until the guard drops
    pub fn enter(&self) -> RecursionGuard<'_> {
        let previous = self.recursive_guard.replace(true);
        RecursionGuard { tls: self, previous }
    }

    /// Set the recursion guard for good. Used by `stop()`.
    pub fn poison(&self) {
        self.recursive_guard.set(true);
    }

    pub fn is_forced(&self) -> bool {
        self.forced.get() != 0
    }

    pub fn next_sample_counter(&self) -> u32 {
        self.next_sample_counter.get()
    }

    /// Count one allocation, true once every [`OCCUPANCY_LOG_INTERVAL`]
    pub fn count_call(&self) -> bool {
        let calls = self.calls.get() + 1;
        if calls == OCCUPANCY_LOG_INTERVAL {
            self.calls.set(0);
            return true;
        }
        self.calls.set(calls);
        false
    }

    /// Tick the countdown. `adjusted_rate_plus_one` is `2 * rate + 1` (or `2`
    /// for a rate of one, `0` for an allocator that was never set up, which
    /// wraps to the longest possible interval).
    pub fn tick(&self, adjusted_rate_plus_one: u32) -> bool {
        let mut counter = self.next_sample_counter.get();
        if counter == 0 {
            counter = if adjusted_rate_plus_one == 0 {
                NEXT_SAMPLE_COUNTER_MASK
            } else {
                self.with_rng(|rng| (rng.next_u32() % (adjusted_rate_plus_one - 1)).wrapping_add(1))
                    & NEXT_SAMPLE_COUNTER_MASK
            };
        }
        counter = counter.wrapping_sub(1) & NEXT_SAMPLE_COUNTER_MASK;
        self.next_sample_counter.set(counter);
        counter == 0
    }

    /// Push the next sample as far out as the rate allows
    pub fn defer(&self, adjusted_rate_plus_one: u32) {
        self.next_sample_counter
            .set(adjusted_rate_plus_one.wrapping_sub(1) & NEXT_SAMPLE_COUNTER_MASK);
    }
}

impl Default for ThreadLocals {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static CURRENT: ThreadLocals = const { ThreadLocals::new() };
}

/// Run `f` with the calling thread's sampling context
#[inline(always)]
pub fn with_current<R>(f: impl FnOnce(&ThreadLocals) -> R) -> R {
    CURRENT.with(f)
}

pub struct RecursionGuard<'a> {
    tls: &'a ThreadLocals,
    previous: bool,
}

impl Drop for RecursionGuard<'_> {
    fn drop(&mut self) {
        self.tls.recursive_guard.set(self.previous);
    }
}

/// While alive, every allocation made on this thread is sampled (as long as
/// the pool has room). Scopes nest.
pub struct ForceSampleScope {
    _not_send: PhantomData<*const ()>,
}

impl ForceSampleScope {
    pub fn new() -> Self {
        with_current(|tls| tls.forced.set(tls.forced.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Default for ForceSampleScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ForceSampleScope {
    fn drop(&mut self) {
        with_current(|tls| tls.forced.set(tls.forced.get().saturating_sub(1)));
    }
}

/// Frames walked when checking the caller against watched modules
const FORCED_SAMPLE_FRAMES: usize = 16;

/// The sampling policy of one allocator
pub struct Sampler {
    adjusted_rate_plus_one: u32,
    backtrace: Option<BacktraceFn>,
    modules: Option<ModuleWatch>,
}

impl Sampler {
    pub const fn disabled() -> Self {
        Self {
            adjusted_rate_plus_one: 0,
            backtrace: None,
            modules: None,
        }
    }

    /// Sampling every `sample_rate` allocations on average. Twice the rate is
    /// used as the modulus so the expected interval is `sample_rate`.
    pub fn new(sample_rate: u32, backtrace: Option<BacktraceFn>, modules: Option<ModuleWatch>) -> Self {
        debug_assert!(sample_rate > 0 && sample_rate < MAX_SAMPLE_RATE);
        let adjusted_rate_plus_one = if sample_rate == 1 { 2 } else { sample_rate * 2 + 1 };
        Self {
            adjusted_rate_plus_one,
            backtrace,
            modules: modules.filter(|m| !m.is_empty()),
        }
    }

    pub fn adjusted_rate_plus_one(&self) -> u32 {
        self.adjusted_rate_plus_one
    }

    pub fn modules(&self) -> Option<&ModuleWatch> {
        self.modules.as_ref()
    }

    /// Is the caller running code from a watched module? Needs a backtrace,
    /// which is taken under `backtrace_lock` with the recursion guard up.
    fn caller_is_watched(&self, tls: &ThreadLocals, backtrace_lock: &RawMutex) -> bool {
        let (Some(modules), Some(backtrace)) = (&self.modules, self.backtrace) else {
            return false;
        };
        let _recursion = tls.enter();
        let mut frames = [0usize; FORCED_SAMPLE_FRAMES];
        let len = {
            let _guard = backtrace_lock.scoped();
            backtrace(&mut frames).min(FORCED_SAMPLE_FRAMES)
        };
        modules.contains_any(&frames[..len])
    }

    /// Should the next allocation on `tls`'s thread be sampled?
    #[inline]
    pub fn should_sample(&self, tls: &ThreadLocals, backtrace_lock: &RawMutex) -> bool {
        if tls.is_recursive() || self.adjusted_rate_plus_one == 0 {
            return false;
        }
        if tls.is_forced() {
            return true;
        }
        if self.modules.is_some() && self.caller_is_watched(tls, backtrace_lock) {
            return true;
        }
        tls.tick(self.adjusted_rate_plus_one)
    }

    /// The pool turned out to be unusable, stop asking for a long while
    pub fn defer(&self, tls: &ThreadLocals) {
        tls.defer(self.adjusted_rate_plus_one);
    }

    pub(crate) fn capture(&self, tls: &ThreadLocals, backtrace_lock: &RawMutex) -> Trace {
        if self.backtrace.is_none() {
            return Trace::empty();
        }
        let _recursion = tls.enter();
        let _guard = backtrace_lock.scoped();
        Trace::capture(self.backtrace)
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;

    #[test]
    fn xorshift_matches_reference_sequence() {
        let mut rng = Xorshift32::new(1);
        assert_eq!(rng.next_u32(), 270369);
        assert_eq!(rng.next_u32(), 67634689);
        // The magic unseeded state lands on a huge value straight away
        assert_eq!(Xorshift32::new(UNSEEDED_STATE).next_u32(), 0xffff_fffe);
        // Zero would be a fixed point
        assert_ne!(Xorshift32::new(0).next_u32(), 0);
    }

    #[test]
    fn rate_one_samples_everything() {
        let sampler = Sampler::new(1, None, None);
        let tls = ThreadLocals::with_seed(1);
        let lock = RawMutex::new();
        assert!((0..1000).all(|_| sampler.should_sample(&tls, &lock)));
    }

    #[test]
    fn average_interval_tracks_rate() {
        let sampler = Sampler::new(100, None, None);
        let tls = ThreadLocals::with_seed(0xfeed);
        let lock = RawMutex::new();
        let n = 200_000;
        let sampled = (0..n).filter(|_| sampler.should_sample(&tls, &lock)).count();
        // expected 2000
        assert!((1500..2500).contains(&sampled), "sampled {sampled}");
    }

    #[test]
    fn never_initialised_sampler_defers_forever() {
        let sampler = Sampler::disabled();
        let tls = ThreadLocals::new();
        let lock = RawMutex::new();
        sampler.defer(&tls);
        assert_eq!(tls.next_sample_counter(), NEXT_SAMPLE_COUNTER_MASK);
        assert!((0..10_000).all(|_| !sampler.should_sample(&tls, &lock)));
    }

    #[test]
    fn unconfigured_countdown_wraps_to_the_longest_interval() {
        for seed in 0..64 {
            let tls = ThreadLocals::with_seed(seed);
            let state = tls.with_rng(|rng| rng.state());
            assert!(!tls.tick(0));
            assert_eq!(tls.next_sample_counter(), NEXT_SAMPLE_COUNTER_MASK - 1);
            // The PRNG was left alone
            assert_eq!(tls.with_rng(|rng| rng.state()), state);
        }
        let fresh = ThreadLocals::new();
        assert!(!fresh.tick(0));
        assert_eq!(fresh.next_sample_counter(), NEXT_SAMPLE_COUNTER_MASK - 1);
    }

    #[test]
    fn disabled_sampler_leaves_the_countdown_alone() {
        let sampler = Sampler::disabled();
        let tls = ThreadLocals::with_seed(0xdead);
        let lock = RawMutex::new();
        // Primed to fire on the next tick
        tls.defer(2);
        assert_eq!(tls.next_sample_counter(), 1);
        assert!(!sampler.should_sample(&tls, &lock));
        assert_eq!(tls.next_sample_counter(), 1);
    }

    #[test]
    fn occupancy_log_fires_once_per_interval() {
        let tls = ThreadLocals::new();
        let fired = (0..OCCUPANCY_LOG_INTERVAL * 3).filter(|_| tls.count_call()).count();
        assert_eq!(fired, 3);
    }

    #[test]
    fn recursion_guard_blocks_sampling() {
        let sampler = Sampler::new(1, None, None);
        let tls = ThreadLocals::with_seed(3);
        let lock = RawMutex::new();
        {
            let _guard = tls.enter();
            assert!(tls.is_recursive());
            assert!(!sampler.should_sample(&tls, &lock));
            {
                let _nested = tls.enter();
            }
            assert!(tls.is_recursive());
        }
        assert!(!tls.is_recursive());
        assert!(sampler.should_sample(&tls, &lock));
    }

    #[test]
    fn forced_scope_overrides_counter() {
        let sampler = Sampler::new(MAX_SAMPLE_RATE - 1, None, None);
        let lock = RawMutex::new();
        {
            let _outer = ForceSampleScope::new();
            let _inner = ForceSampleScope::new();
            with_current(|tls| assert!(sampler.should_sample(tls, &lock)));
        }
        with_current(|tls| assert!(!tls.is_forced()));
    }

    #[test]
    fn forced_scope_does_nothing_when_disabled() {
        let sampler = Sampler::disabled();
        let lock = RawMutex::new();
        let _scope = ForceSampleScope::new();
        with_current(|tls| {
            sampler.defer(tls);
            assert!(!sampler.should_sample(tls, &lock));
        });
    }

    #[test]
    fn rng_is_usable_through_rand() {
        let tls = ThreadLocals::with_seed(42);
        let picks: Vec<usize> = (0..100).map(|_| tls.with_rng(|rng| rng.gen_range(0..7))).collect();
        assert!(picks.iter().all(|&p| p < 7));
        assert!(picks.iter().any(|&p| p != picks[0]));
    }

    fn backtrace_here(frames: &mut [usize]) -> usize {
        frames[0] = backtrace_here as usize;
        1
    }

    #[test]
    fn unresolvable_modules_fall_back_to_the_counter() {
        let modules = ModuleWatch::new(vec!["libnothing-here.so".to_owned()]);
        let sampler = Sampler::new(MAX_SAMPLE_RATE - 1, Some(backtrace_here), Some(modules));
        let tls = ThreadLocals::with_seed(9);
        let lock = RawMutex::new();
        assert!(sampler.modules().is_some());
        assert!((0..100).all(|_| !sampler.should_sample(&tls, &lock)));
        assert!(!tls.is_recursive());
        assert!(!lock.is_locked());
    }
}
