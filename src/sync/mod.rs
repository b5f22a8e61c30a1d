pub mod mutex;

pub use mutex::{RawMutex, ScopedLock};
