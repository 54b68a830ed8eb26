#![cfg_attr(not(test), no_std)]

mod kspin;

pub use kspin::{SpinMutex, SpinMutexGuard};
pub use spin::{Lazy, Once, RwLock, RwLockReadGuard, RwLockWriteGuard};
