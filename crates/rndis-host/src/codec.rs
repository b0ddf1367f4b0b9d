/*
 * RNDIS message encoding and decoding.
 *
 * Every field on the wire is a little-endian u32. Offsets inside QUERY,
 * SET and PACKET messages are measured from the byte right after the
 * msg_len field, i.e. from byte 8 of the message.
 */

use core::mem::size_of;

use byteorder::{ByteOrder, LittleEndian};
use bytemuck::{Pod, Zeroable};
use log::trace;

use crate::error::ProtocolError;
use crate::protocol::{MessageType, Oid, Status, DATA_HEADER_LEN};

type Result<T> = core::result::Result<T, ProtocolError>;

/// Offsets in QUERY/SET/PACKET are relative to this byte.
const OFFSET_BASE: usize = 8;

/// The smallest message the command channel will look at: type, length
/// and request id.
pub const MIN_REPLY_LEN: usize = 12;

macro_rules! le32 {
    ($val:expr) => {
        Le32::new($val as u32)
    };
}

/// Little-endian u32 that can sit in a `#[repr(C)]` wire struct.
#[derive(Copy, Clone, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct Le32(u32);

impl Le32 {
    pub const ZERO: Le32 = Le32(0);

    #[inline]
    pub const fn new(val: u32) -> Self {
        Le32(val.to_le())
    }

    #[inline]
    pub const fn get(self) -> u32 {
        u32::from_le(self.0)
    }
}

impl core::fmt::Debug for Le32 {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        core::fmt::Debug::fmt(&self.get(), f)
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Pod, Zeroable)]
pub struct InitMsg {
    pub message_type: Le32,
    pub message_length: Le32,
    pub request_id: Le32,
    pub major_version: Le32,
    pub minor_version: Le32,
    pub max_transfer_size: Le32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Pod, Zeroable)]
pub struct InitCompleteMsg {
    pub message_type: Le32,
    pub message_length: Le32,
    pub request_id: Le32,
    pub status: Le32,
    pub major_version: Le32,
    pub minor_version: Le32,
    pub device_flags: Le32,
    pub medium: Le32,
    pub max_packets_per_transfer: Le32,
    pub max_transfer_size: Le32,
    pub packet_alignment_factor: Le32,
    pub af_list_offset: Le32,
    pub af_list_size: Le32,
}

/// Shared by QUERY and SET; the information buffer follows the header.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Pod, Zeroable)]
pub struct OidRequestMsg {
    pub message_type: Le32,
    pub message_length: Le32,
    pub request_id: Le32,
    pub oid: Le32,
    pub information_buffer_length: Le32,
    pub information_buffer_offset: Le32,
    pub device_vc_handle: Le32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Pod, Zeroable)]
pub struct QueryCompleteMsg {
    pub message_type: Le32,
    pub message_length: Le32,
    pub request_id: Le32,
    pub status: Le32,
    pub information_buffer_length: Le32,
    pub information_buffer_offset: Le32,
}

/// Header every completion starts with. SET_COMPLETE is exactly this.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Pod, Zeroable)]
pub struct CompletionHeader {
    pub message_type: Le32,
    pub message_length: Le32,
    pub request_id: Le32,
    pub status: Le32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Pod, Zeroable)]
pub struct PacketMsg {
    pub message_type: Le32,
    pub message_length: Le32,
    pub data_offset: Le32,
    pub data_length: Le32,
    pub oob_data_offset: Le32,
    pub oob_data_length: Le32,
    pub num_oob_data_elements: Le32,
    pub per_packet_info_offset: Le32,
    pub per_packet_info_length: Le32,
    pub vc_handle: Le32,
    pub reserved: Le32,
}

const _: () = assert!(size_of::<PacketMsg>() == DATA_HEADER_LEN);
const _: () = assert!(size_of::<InitMsg>() == 24);
const _: () = assert!(size_of::<OidRequestMsg>() == 28);
const _: () = assert!(size_of::<InitCompleteMsg>() == 52);

fn read<T: Pod>(bytes: &[u8]) -> Result<T> {
    let needed = size_of::<T>();
    match bytes.get(..needed) {
        Some(head) => Ok(bytemuck::pod_read_unaligned(head)),
        None => Err(ProtocolError::Truncated {
            needed,
            actual: bytes.len(),
        }),
    }
}

fn expect_type(actual: u32, expected: MessageType) -> Result<()> {
    if actual != expected.0 {
        return Err(ProtocolError::UnexpectedType {
            expected: expected.0,
            actual,
        });
    }
    Ok(())
}

/// Type, length and request id of a reply, plus the status if the reply
/// is long enough to carry one.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReplyHeader {
    pub message_type: MessageType,
    pub message_length: u32,
    pub request_id: u32,
    pub status: Option<Status>,
}

pub fn peek_reply(bytes: &[u8]) -> Result<ReplyHeader> {
    if bytes.len() < MIN_REPLY_LEN {
        return Err(ProtocolError::Truncated {
            needed: MIN_REPLY_LEN,
            actual: bytes.len(),
        });
    }
    Ok(ReplyHeader {
        message_type: MessageType(LittleEndian::read_u32(&bytes[0..4])),
        message_length: LittleEndian::read_u32(&bytes[4..8]),
        request_id: LittleEndian::read_u32(&bytes[8..12]),
        status: bytes.get(12..16).map(|s| Status(LittleEndian::read_u32(s))),
    })
}

/// Stamps `id` into the request id field of an encoded command.
pub fn set_request_id(message: &mut [u8], id: u32) -> Result<()> {
    let actual = message.len();
    let field = message
        .get_mut(8..12)
        .ok_or(ProtocolError::Truncated {
            needed: MIN_REPLY_LEN,
            actual,
        })?;
    LittleEndian::write_u32(field, id);
    Ok(())
}

pub fn message_type(message: &[u8]) -> Result<MessageType> {
    match message.get(0..4) {
        Some(raw) => Ok(MessageType(LittleEndian::read_u32(raw))),
        None => Err(ProtocolError::Truncated {
            needed: 4,
            actual: message.len(),
        }),
    }
}

/// INIT with request id 0; the command channel stamps the real id.
pub fn encode_init(major: u32, minor: u32, max_transfer_size: u32) -> Vec<u8> {
    let msg = InitMsg {
        message_type: le32!(MessageType::INIT.0),
        message_length: le32!(size_of::<InitMsg>()),
        request_id: Le32::ZERO,
        major_version: le32!(major),
        minor_version: le32!(minor),
        max_transfer_size: le32!(max_transfer_size),
    };
    bytemuck::bytes_of(&msg).to_vec()
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InitCompletion {
    pub request_id: u32,
    pub status: Status,
    pub major_version: u32,
    pub minor_version: u32,
    pub device_flags: u32,
    pub medium: u32,
    pub max_packets_per_transfer: u32,
    pub max_transfer_size: u32,
    pub packet_alignment_factor: u32,
}

pub fn decode_init_complete(bytes: &[u8]) -> Result<InitCompletion> {
    let msg: InitCompleteMsg = read(bytes)?;
    expect_type(msg.message_type.get(), MessageType::INIT_COMPLETE)?;
    Ok(InitCompletion {
        request_id: msg.request_id.get(),
        status: Status(msg.status.get()),
        major_version: msg.major_version.get(),
        minor_version: msg.minor_version.get(),
        device_flags: msg.device_flags.get(),
        medium: msg.medium.get(),
        max_packets_per_transfer: msg.max_packets_per_transfer.get(),
        max_transfer_size: msg.max_transfer_size.get(),
        packet_alignment_factor: msg.packet_alignment_factor.get(),
    })
}

fn encode_oid_request(message_type: MessageType, oid: Oid, info: &[u8]) -> Vec<u8> {
    let header_len = size_of::<OidRequestMsg>();
    let msg = OidRequestMsg {
        message_type: le32!(message_type.0),
        message_length: le32!(header_len + info.len()),
        request_id: Le32::ZERO,
        oid: le32!(oid.value()),
        information_buffer_length: le32!(info.len()),
        information_buffer_offset: le32!(header_len - OFFSET_BASE),
        device_vc_handle: Le32::ZERO,
    };
    let mut out = Vec::with_capacity(header_len + info.len());
    out.extend_from_slice(bytemuck::bytes_of(&msg));
    out.extend_from_slice(info);
    out
}

/// QUERY with `in_len` zero bytes of input buffer appended. Some devices
/// size their reply after the input buffer, hence the padding.
pub fn encode_query(oid: Oid, in_len: u32) -> Vec<u8> {
    encode_oid_request(MessageType::QUERY, oid, &vec![0u8; in_len as usize])
}

pub fn encode_set(oid: Oid, value: &[u8]) -> Vec<u8> {
    encode_oid_request(MessageType::SET, oid, value)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct QueryCompletion<'a> {
    pub request_id: u32,
    pub status: Status,
    pub payload: &'a [u8],
}

pub fn decode_query_complete(bytes: &[u8]) -> Result<QueryCompletion<'_>> {
    let msg: QueryCompleteMsg = read(bytes)?;
    expect_type(msg.message_type.get(), MessageType::QUERY_COMPLETE)?;

    let offset = msg.information_buffer_offset.get() as usize;
    let len = msg.information_buffer_length.get() as usize;
    let payload = OFFSET_BASE
        .checked_add(offset)
        .and_then(|start| Some((start, start.checked_add(len)?)))
        .and_then(|(start, end)| bytes.get(start..end))
        .ok_or(ProtocolError::PayloadOutOfBounds)?;

    Ok(QueryCompletion {
        request_id: msg.request_id.get(),
        status: Status(msg.status.get()),
        payload,
    })
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SetCompletion {
    pub request_id: u32,
    pub status: Status,
}

pub fn decode_set_complete(bytes: &[u8]) -> Result<SetCompletion> {
    let msg: CompletionHeader = read(bytes)?;
    expect_type(msg.message_type.get(), MessageType::SET_COMPLETE)?;
    Ok(SetCompletion {
        request_id: msg.request_id.get(),
        status: Status(msg.status.get()),
    })
}

fn packet_header(payload_len: usize) -> Result<PacketMsg> {
    let total = DATA_HEADER_LEN
        .checked_add(payload_len)
        .filter(|total| *total <= u32::MAX as usize)
        .ok_or(ProtocolError::BadLength)?;
    Ok(PacketMsg {
        message_type: le32!(MessageType::PACKET.0),
        message_length: le32!(total),
        data_offset: le32!(DATA_HEADER_LEN - OFFSET_BASE),
        data_length: le32!(payload_len),
        ..PacketMsg::default()
    })
}

/// Writes a PACKET message wrapping `payload` to the front of `buf` and
/// returns the number of bytes used.
pub fn write_data_frame(buf: &mut [u8], payload: &[u8]) -> Result<usize> {
    let header = packet_header(payload.len())?;
    let total = DATA_HEADER_LEN + payload.len();
    if buf.len() < total {
        return Err(ProtocolError::Truncated {
            needed: total,
            actual: buf.len(),
        });
    }
    buf[..DATA_HEADER_LEN].copy_from_slice(bytemuck::bytes_of(&header));
    buf[DATA_HEADER_LEN..total].copy_from_slice(payload);
    Ok(total)
}

pub fn encode_data_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let mut out = vec![0u8; DATA_HEADER_LEN + payload.len()];
    write_data_frame(&mut out, payload)?;
    Ok(out)
}

/// Splits a bulk IN buffer into the Ethernet frames it carries.
///
/// The whole buffer is validated before anything is returned, so a bad
/// message anywhere in the batch yields no frames at all.
pub fn decode_data_frames(bytes: &[u8]) -> Result<Vec<&[u8]>> {
    let mut frames = Vec::new();
    let mut rest = bytes;

    while !rest.is_empty() {
        let header: PacketMsg = read(rest)?;
        expect_type(header.message_type.get(), MessageType::PACKET)?;

        let msg_len = header.message_length.get() as usize;
        if msg_len < DATA_HEADER_LEN || msg_len > rest.len() {
            return Err(ProtocolError::BadLength);
        }
        let message = &rest[..msg_len];

        let offset = header.data_offset.get() as usize;
        let len = header.data_length.get() as usize;
        let frame = OFFSET_BASE
            .checked_add(offset)
            .and_then(|start| Some((start, start.checked_add(len)?)))
            .and_then(|(start, end)| message.get(start..end))
            .ok_or(ProtocolError::PayloadOutOfBounds)?;

        trace!("rndis: frame of {} bytes in {} byte message", len, msg_len);
        frames.push(frame);
        rest = &rest[msg_len..];
    }

    Ok(frames)
}
