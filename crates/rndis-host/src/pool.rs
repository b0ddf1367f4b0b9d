//! Fixed-size transmit buffer pool.
//!
//! Free buffers are tracked as a stack of slot indices, so the buffer most
//! recently handed back is the next one handed out. The pool has no locking
//! of its own; it lives inside the driver's gate.

use log::trace;
use tinyvec::TinyVec;

use crate::error::{Error, Result};
use crate::usb::TransferBuffer;

/// A buffer checked out of the pool together with the slot it belongs to.
#[derive(Debug)]
pub struct BufferHandle {
    pub index: usize,
    pub buffer: TransferBuffer,
}

pub struct BufferPool {
    slots: Vec<Option<TransferBuffer>>,
    free: TinyVec<[u16; 8]>,
}

impl BufferPool {
    /// `count` must fit in a u16; the config validation guarantees that.
    pub fn new(count: usize, size: usize) -> Self {
        let count = count.min(usize::from(u16::MAX));
        let slots = (0..count).map(|_| Some(TransferBuffer::new(size))).collect();
        // lowest index on top
        let free = (0..count as u16).rev().collect();
        Self { slots, free }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn num_free(&self) -> usize {
        self.free.len()
    }

    /// Takes the buffer on top of the free stack without popping its index.
    /// The free count stays the same until [`commit`](Self::commit); a
    /// failed submission hands the buffer back with
    /// [`restore`](Self::restore).
    pub fn reserve(&mut self) -> Result<Option<BufferHandle>> {
        let Some(&top) = self.free.last() else {
            return Ok(None);
        };
        let index = usize::from(top);
        let buffer = self
            .slots
            .get_mut(index)
            .ok_or(Error::InternalInvariantViolation("free index outside the pool"))?
            .take()
            .ok_or(Error::InternalInvariantViolation("free slot has no buffer"))?;
        Ok(Some(BufferHandle { index, buffer }))
    }

    /// Pops `index` off the free stack once its transfer is in flight.
    pub fn commit(&mut self, index: usize) -> Result<()> {
        match self.free.last() {
            Some(&top) if usize::from(top) == index => {
                self.free.pop();
                trace!("pool: buffer {} out, {} free", index, self.free.len());
                Ok(())
            }
            _ => Err(Error::InternalInvariantViolation(
                "committed buffer is not the reserved one",
            )),
        }
    }

    /// Puts back a reserved buffer that never made it to the wire.
    pub fn restore(&mut self, handle: BufferHandle) {
        if let Some(slot) = self.slots.get_mut(handle.index) {
            *slot = Some(handle.buffer);
        }
    }

    pub fn try_acquire(&mut self) -> Result<Option<BufferHandle>> {
        let handle = self.reserve()?;
        if let Some(handle) = &handle {
            self.commit(handle.index)?;
        }
        Ok(handle)
    }

    /// Returns a buffer whose transfer has completed.
    ///
    /// Returns `true` when this release took the pool from empty to one
    /// free buffer, i.e. when a stalled transmit queue should be woken.
    pub fn release(&mut self, index: usize, buffer: TransferBuffer) -> Result<bool> {
        if self.free.len() >= self.slots.len() {
            return Err(Error::InternalInvariantViolation(
                "buffer released into a full pool",
            ));
        }
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(Error::InternalInvariantViolation("released index outside the pool"))?;
        if slot.is_some() {
            return Err(Error::InternalInvariantViolation("buffer released twice"));
        }
        *slot = Some(buffer);
        self.free.push(index as u16);
        trace!("pool: buffer {} back, {} free", index, self.free.len());
        Ok(self.free.len() == 1)
    }
}
