pub use usbh_if::err::{TransferError, USBError};

pub type Result<T = ()> = core::result::Result<T, USBError>;
