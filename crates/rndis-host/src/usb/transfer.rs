/******************************************************************************
*	usb/transfer.rs
*
*	Asynchronous bulk transfers. A transfer owns its buffer while it is in
*	flight; the completion gets the buffer back together with the outcome.
******************************************************************************/

use core::fmt;
use core::ops::{Deref, DerefMut};

use log::{error, warn};

use super::UsbPipe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    Stalled,
    /// The transfer was cancelled, usually by an abort on its pipe.
    Aborted,
    /// The device is gone.
    NotResponding,
    Other(i32),
}

impl TransferError {
    /// Aborted and NotResponding mean the pipe is going away; completions
    /// seeing either must stop quietly.
    pub fn is_stop(&self) -> bool {
        matches!(self, TransferError::Aborted | TransferError::NotResponding)
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Stalled => f.write_str("stalled"),
            TransferError::Aborted => f.write_str("aborted"),
            TransferError::NotResponding => f.write_str("not responding"),
            TransferError::Other(code) => write!(f, "error {:#x}", code),
        }
    }
}

/// Heap buffer handed to the USB layer for the life of a transfer.
pub struct TransferBuffer {
    bytes: Box<[u8]>,
}

impl TransferBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }
}

impl Deref for TransferBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl DerefMut for TransferBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl fmt::Debug for TransferBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferBuffer")
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Called exactly once with the number of bytes moved (or the error) and
/// the buffer the transfer was submitted with.
pub type Completion = Box<dyn FnOnce(Result<usize, TransferError>, TransferBuffer) + Send>;

pub struct Transfer {
    pub buffer: TransferBuffer,
    /// Bytes to send for OUT; bytes to request for IN.
    pub length: usize,
    pub completion: Completion,
}

impl Transfer {
    pub fn bulk_in(buffer: TransferBuffer, completion: Completion) -> Self {
        let length = buffer.capacity();
        Self {
            buffer,
            length,
            completion,
        }
    }

    pub fn bulk_out(buffer: TransferBuffer, length: usize, completion: Completion) -> Self {
        Self {
            buffer,
            length,
            completion,
        }
    }

    /// Runs the completion. Used by pipe implementations.
    pub fn complete(self, result: Result<usize, TransferError>) {
        (self.completion)(result, self.buffer)
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("buffer", &self.buffer)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// A submission the pipe refused. The transfer comes back untouched and its
/// completion has not run.
#[derive(Debug)]
pub struct SubmitError {
    pub error: TransferError,
    pub transfer: Transfer,
}

/// Clears a halt on `pipe`, giving up after `attempts` tries that each
/// report the pipe still stalled.
pub fn clear_stall(pipe: &dyn UsbPipe, attempts: u32) -> Result<(), TransferError> {
    for _ in 0..attempts {
        match pipe.clear_stall() {
            Ok(()) => return Ok(()),
            Err(TransferError::Stalled) => continue,
            Err(err) => return Err(err),
        }
    }
    error!("usb: pipe still stalled after {} clear attempts", attempts);
    Err(TransferError::Stalled)
}

/// Submits `transfer`; if the pipe reports a stall, clears it and tries
/// exactly once more.
pub fn submit_with_stall_retry(
    pipe: &dyn UsbPipe,
    transfer: Transfer,
    attempts: u32,
) -> Result<(), SubmitError> {
    match pipe.submit(transfer) {
        Err(SubmitError {
            error: TransferError::Stalled,
            transfer,
        }) => {
            warn!("usb: submit hit a stalled pipe, clearing and retrying");
            if let Err(err) = clear_stall(pipe, attempts) {
                return Err(SubmitError {
                    error: err,
                    transfer,
                });
            }
            pipe.submit(transfer)
        }
        other => other,
    }
}
