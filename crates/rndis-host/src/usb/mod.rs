//! The slice of a USB host stack the RNDIS engine needs.
//!
//! Implementations must honour two rules:
//!
//! * [`UsbPipe::submit`] never runs the completion before it returns.
//!   Completions run later on whatever context the host stack uses.
//! * [`UsbPipe::clear_stall`] never runs completions. [`UsbPipe::abort`]
//!   may run them synchronously.

pub mod descriptors;
pub mod request;
pub mod transfer;

use std::sync::Arc;

pub use descriptors::{
    ConfigurationDescriptor, Direction, EndpointDescriptor, InterfaceClass, InterfaceDescriptor,
    InterfaceEntry, TransferType,
};
pub use request::{CdcRequest, DeviceRequest, RequestType};
pub use transfer::{
    clear_stall, submit_with_stall_retry, Completion, SubmitError, Transfer, TransferBuffer,
    TransferError,
};

pub trait UsbDevice: Send + Sync {
    fn configurations(&self) -> Vec<ConfigurationDescriptor>;

    fn set_configuration(&self, value: u8) -> Result<(), TransferError>;

    /// Claims interface `number` of the active configuration.
    fn open_interface(&self, number: u8) -> Result<Arc<dyn UsbInterface>, TransferError>;
}

pub trait UsbInterface: Send + Sync {
    fn descriptor(&self) -> InterfaceDescriptor;

    fn endpoints(&self) -> Vec<EndpointDescriptor>;

    fn open_pipe(&self, endpoint: &EndpointDescriptor) -> Result<Arc<dyn UsbPipe>, TransferError>;

    /// Synchronous control write on endpoint 0; returns bytes transferred.
    fn control_out(&self, request: DeviceRequest, data: &[u8]) -> Result<usize, TransferError>;

    /// Synchronous control read on endpoint 0; returns bytes received.
    fn control_in(&self, request: DeviceRequest, data: &mut [u8]) -> Result<usize, TransferError>;

    /// Releases the interface. Outstanding transfers on its pipes complete
    /// with [`TransferError::Aborted`].
    fn close(&self);
}

pub trait UsbPipe: Send + Sync {
    fn submit(&self, transfer: Transfer) -> Result<(), SubmitError>;

    fn clear_stall(&self) -> Result<(), TransferError>;

    /// Cancels everything queued on the pipe.
    fn abort(&self);
}
