#![cfg_attr(not(test), no_std)]

#[cfg(feature = "std")]
#[macro_use]
extern crate std;

pub extern crate heapless;

pub mod task;
pub mod taskq;

mod platform;
