pub mod crash;
pub mod global;
pub mod guarded;
pub mod meta;
pub mod options;
pub mod placement;
pub mod sampling;
pub mod slots;
pub mod state;
pub mod trap;
