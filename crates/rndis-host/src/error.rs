use thiserror::Error;

use crate::usb::TransferError;

/// A malformed or unexpected RNDIS message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("message truncated: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },
    #[error("unexpected message type {actual:#010x}, expected {expected:#010x}")]
    UnexpectedType { expected: u32, actual: u32 },
    #[error("message length field is inconsistent with the buffer")]
    BadLength,
    #[error("payload offset/length point outside the message")]
    PayloadOutOfBounds,
    #[error("device returned status {0:#010x}")]
    Status(u32),
    #[error("reply carries {actual} bytes, expected {expected}")]
    UnexpectedReplyLength { expected: usize, actual: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// No matching completion arrived within the command retry budget.
    #[error("timed out waiting for an RNDIS completion")]
    Timeout,
    /// The USB layer reported the transfer aborted or the device gone.
    #[error("device disconnected")]
    DeviceDisconnected,
    #[error("pipe stalled")]
    PipeStalled,
    #[error("no free transfer buffers")]
    ResourceExhausted,
    /// The session is in a state it should never reach and must be torn down.
    #[error("internal invariant violated: {0}")]
    InternalInvariantViolation(&'static str),
    #[error("configuration mismatch: {0}")]
    ConfigurationMismatch(&'static str),
    #[error("usb error {0:#x}")]
    Usb(i32),
}

impl From<TransferError> for Error {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Stalled => Error::PipeStalled,
            TransferError::Aborted | TransferError::NotResponding => Error::DeviceDisconnected,
            TransferError::Other(code) => Error::Usb(code),
        }
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
