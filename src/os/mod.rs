//! Thin wrappers over the Linux primitives the pool is built on.

pub mod mem;
pub mod modules;
pub mod thread;
