//! Synchronous RNDIS control channel.
//!
//! Commands go out with SEND_ENCAPSULATED_COMMAND on the control interface
//! and the reply is polled for with GET_ENCAPSULATED_RESPONSE. The interrupt
//! endpoint that announces "response available" is not used.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, trace, warn};

use crate::codec::{self, InitCompletion, MIN_REPLY_LEN};
use crate::config::DriverConfig;
use crate::error::{Error, ProtocolError, Result};
use crate::protocol::{MessageType, Oid, PacketFilter, RNDIS_MAJOR_VERSION, RNDIS_MINOR_VERSION};
use crate::usb::{DeviceRequest, UsbInterface};

/// Request id source. Ids start at 1, wrap, and never produce 0.
#[derive(Debug, Clone)]
pub struct RequestIds {
    last: u32,
}

impl RequestIds {
    pub fn new() -> Self {
        Self { last: 0 }
    }

    /// Continues after `last`; mostly for tests.
    pub fn starting_after(last: u32) -> Self {
        Self { last }
    }

    pub fn next(&mut self) -> u32 {
        self.last = self.last.wrapping_add(1);
        if self.last == 0 {
            self.last = 1;
        }
        self.last
    }
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CommandChannel {
    control: Arc<dyn UsbInterface>,
    interface_number: u8,
    ids: RequestIds,
    buffer_size: usize,
    retries: u32,
    retry_delay: Duration,
}

impl CommandChannel {
    pub fn new(control: Arc<dyn UsbInterface>, config: &DriverConfig) -> Self {
        let interface_number = control.descriptor().number;
        Self {
            control,
            interface_number,
            ids: RequestIds::new(),
            buffer_size: config.command_buffer_size,
            retries: config.command_retries,
            retry_delay: config.command_retry_delay,
        }
    }

    pub fn with_request_ids(mut self, ids: RequestIds) -> Self {
        self.ids = ids;
        self
    }

    /// Sends `message` and waits for its completion.
    ///
    /// The request id is stamped in place unless the message is HALT or
    /// RESET. Returns the raw completion, already checked for type,
    /// request id and a success status.
    pub fn execute(&mut self, message: &mut [u8]) -> Result<Vec<u8>> {
        let kind = codec::message_type(message)?;
        let request_id = if kind.carries_request_id() {
            let id = self.ids.next();
            codec::set_request_id(message, id)?;
            Some(id)
        } else {
            None
        };

        let out_len = u16::try_from(message.len())
            .map_err(|_| Error::ConfigurationMismatch("command larger than a control transfer"))?;
        let sent = self.control.control_out(
            DeviceRequest::send_encapsulated_command(self.interface_number, out_len),
            message,
        )?;
        if sent != message.len() {
            error!(
                "rndis: {:?} sent {} of {} bytes",
                kind,
                sent,
                message.len()
            );
            return Err(ProtocolError::Truncated {
                needed: message.len(),
                actual: sent,
            }
            .into());
        }

        self.await_completion(kind.completion(), request_id)
    }

    fn await_completion(&mut self, expected: MessageType, request_id: Option<u32>) -> Result<Vec<u8>> {
        let mut reply = vec![0u8; self.buffer_size];
        // the constructor bounds buffer_size through the config check
        let in_len = u16::try_from(self.buffer_size).unwrap_or(u16::MAX);

        for attempt in 1..=self.retries {
            let got = self
                .control
                .control_in(
                    DeviceRequest::get_encapsulated_response(self.interface_number, in_len),
                    &mut reply,
                )?
                .min(reply.len());

            if got < MIN_REPLY_LEN {
                trace!("rndis: poll {} got {} bytes, waiting", attempt, got);
            } else {
                let header = codec::peek_reply(&reply[..got])?;
                if header.message_type == expected
                    && request_id.map_or(true, |id| header.request_id == id)
                {
                    let status = header.status.ok_or(ProtocolError::Truncated {
                        needed: 16,
                        actual: got,
                    })?;
                    if !status.is_success() {
                        error!("rndis: {:?} failed with {:?}", expected, status);
                        return Err(ProtocolError::Status(status.0).into());
                    }
                    reply.truncate(got);
                    return Ok(reply);
                }

                if header.message_type == expected {
                    warn!(
                        "rndis: {:?} for request {} while waiting for {:?}",
                        expected, header.request_id, request_id
                    );
                } else if header.message_type.is_unsolicited() {
                    // Status indications are not acted on; a KEEPALIVE would
                    // need a reply we do not send.
                    warn!(
                        "rndis: ignoring unsolicited {:?} (status {:?})",
                        header.message_type, header.status
                    );
                } else {
                    warn!(
                        "rndis: unexpected {:?} while waiting for {:?}",
                        header.message_type, expected
                    );
                }
            }
            thread::sleep(self.retry_delay);
        }

        error!(
            "rndis: no {:?} after {} polls",
            expected, self.retries
        );
        Err(Error::Timeout)
    }

    pub fn init(&mut self, max_transfer_size: u32) -> Result<InitCompletion> {
        let mut msg = codec::encode_init(RNDIS_MAJOR_VERSION, RNDIS_MINOR_VERSION, max_transfer_size);
        let reply = self.execute(&mut msg)?;
        let done = codec::decode_init_complete(&reply)?;
        debug!(
            "rndis: init complete: version {}.{}, medium {:#x}, max_packets_per_transfer {}, max_transfer_size {}, alignment {}",
            done.major_version,
            done.minor_version,
            done.medium,
            done.max_packets_per_transfer,
            done.max_transfer_size,
            done.packet_alignment_factor
        );
        Ok(done)
    }

    /// Queries `oid`, padding the request with `in_len` zero bytes.
    pub fn query(&mut self, oid: Oid, in_len: u32) -> Result<Vec<u8>> {
        let mut msg = codec::encode_query(oid, in_len);
        let reply = self.execute(&mut msg)?;
        let done = codec::decode_query_complete(&reply)?;
        trace!("rndis: query {:?} -> {} bytes", oid, done.payload.len());
        Ok(done.payload.to_vec())
    }

    pub fn set(&mut self, oid: Oid, value: &[u8]) -> Result<()> {
        let mut msg = codec::encode_set(oid, value);
        let reply = self.execute(&mut msg)?;
        codec::decode_set_complete(&reply)?;
        trace!("rndis: set {:?} ok", oid);
        Ok(())
    }

    pub fn set_packet_filter(&mut self, filter: PacketFilter) -> Result<()> {
        debug!("rndis: packet filter {:?}", filter);
        self.set(Oid::OID_GEN_CURRENT_PACKET_FILTER, &filter.bits().to_le_bytes())
    }
}
