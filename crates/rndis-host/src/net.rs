//! The upstream side: what the driver needs from the host network stack.

use core::fmt;

use crate::error::ProtocolError;
use crate::protocol::ETHERNET_ADDRESS_LEN;

/// Calls the driver makes into the host network stack.
///
/// The driver never holds its own lock while calling any of these, so an
/// implementation is free to call straight back into
/// [`RndisDriver::transmit`](crate::RndisDriver::transmit), for instance
/// from [`queue_service`](NetworkStack::queue_service).
pub trait NetworkStack: Send + Sync {
    /// One received Ethernet frame. The slice is only valid for the call.
    fn frame_received(&self, frame: &[u8]);

    fn output_success(&self);
    fn output_error(&self);
    fn input_success(&self);
    fn input_error(&self);

    fn queue_start(&self);
    fn queue_stop(&self);
    fn queue_flush(&self);
    fn queue_set_capacity(&self, capacity: usize);
    /// A transmit buffer became free after the pool ran dry.
    fn queue_service(&self);

    fn link_status(&self, up: bool);
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EthernetAddress(pub [u8; ETHERNET_ADDRESS_LEN]);

impl EthernetAddress {
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let bytes: [u8; ETHERNET_ADDRESS_LEN] =
            data.try_into()
                .map_err(|_| ProtocolError::UnexpectedReplyLength {
                    expected: ETHERNET_ADDRESS_LEN,
                    actual: data.len(),
                })?;
        Ok(EthernetAddress(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_local(&self) -> bool {
        self.0[0] & 0x02 != 0
    }
}

impl fmt::Display for EthernetAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for EthernetAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
