#![cfg_attr(not(test), no_std)]

pub mod error;
pub mod misc;
pub mod signal;
