use alloc::string::String;

/// Failure reported by the host controller for a single transfer.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Stall")]
    Stall,
    #[error("CRC error")]
    Crc,
    #[error("Babble")]
    Babble,
    #[error("Data buffer overrun or underrun")]
    DataBuffer,
    #[error("Bus error")]
    Bus,
    #[error("Cancelled")]
    Cancelled,
    #[error("Other error: {0}")]
    Other(String),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum USBError {
    #[error("Invalid argument")]
    InvalidArgument,
    #[error("Endpoint not found")]
    EndpointNotFound,
    #[error("Invalid descriptor")]
    InvalidDescriptor,
    #[error("Busy")]
    Busy,
    #[error("No memory available")]
    NoMemory,
    #[error("Timeout")]
    Timeout,
    /// The endpoint is halted on the host controller, try again after a reset.
    #[error("Endpoint halted, retry")]
    Retry,
    #[error("Endpoint not open")]
    NotOpen,
    #[error("Slot limit reached")]
    SlotLimitReached,
    #[error("Not found")]
    NotFound,
    #[error("Configuration not set")]
    ConfigurationNotSet,
    #[error("Transfer error: {0}")]
    TransferError(#[from] TransferError),
}

impl USBError {
    /// `true` when the transfer was torn down by an abort or endpoint close.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, USBError::TransferError(TransferError::Cancelled))
    }
}
