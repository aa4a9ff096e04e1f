#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate log;

pub mod descriptor;
pub mod err;
pub mod transfer;

pub use transfer::Speed;
