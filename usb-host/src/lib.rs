#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate log;

pub use usbh_if::descriptor::*;
pub use usbh_if::err::*;
pub use usbh_if::transfer::*;

pub mod backend;
mod class;
mod config;
mod device;
mod enumerate;
pub mod ep;
pub mod err;
mod host;
mod osal;
mod pool;
mod queue;
mod urb;

pub use backend::{EndpointInfo, HcdOp};
pub use class::ClassDriver;
pub use config::HostConfig;
pub use device::{Device, DeviceAttach};
pub use ep::{
    Endpoint, EndpointBulkIn, EndpointBulkOut, EndpointInterruptIn, EndpointInterruptOut,
    EndpointIsoIn, EndpointIsoOut, TransferWaiter,
};
pub use err::Result;
pub use host::{HcId, Host, HostController};
pub use osal::KernelOp;
pub use queue::CompletionDispatcher;
pub use urb::{Completion, CompletionFn, IsocPacket, IsocRequest, UrbHandle, UrbState};
