//! RNDIS protocol constants.
//!
//! Reference: [MS-RNDIS] and
//! https://learn.microsoft.com/en-us/windows-hardware/drivers/network/remote-ndis-communication

use core::fmt;

use bitflags::bitflags;

pub const RNDIS_MAJOR_VERSION: u32 = 1;
pub const RNDIS_MINOR_VERSION: u32 = 0;

/// Size of the header preceding every Ethernet frame on the data pipes.
pub const DATA_HEADER_LEN: usize = 44;
pub const ETHERNET_HEADER_LEN: usize = 14;
pub const ETHERNET_ADDRESS_LEN: usize = 6;

/// Reply buffer length proposed when querying the permanent address.
pub const PERMANENT_ADDRESS_QUERY_LEN: u32 = 48;

/// RNDIS message type. Kept open-ended so replies carrying unknown types
/// can still be logged.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MessageType(pub u32);

impl MessageType {
    pub const PACKET: Self = Self(0x0000_0001);
    pub const INIT: Self = Self(0x0000_0002);
    pub const HALT: Self = Self(0x0000_0003);
    pub const QUERY: Self = Self(0x0000_0004);
    pub const SET: Self = Self(0x0000_0005);
    pub const RESET: Self = Self(0x0000_0006);
    pub const INDICATE_STATUS: Self = Self(0x0000_0007);
    pub const KEEPALIVE: Self = Self(0x0000_0008);

    pub const COMPLETION_FLAG: u32 = 0x8000_0000;

    pub const INIT_COMPLETE: Self = Self::INIT.completion();
    pub const QUERY_COMPLETE: Self = Self::QUERY.completion();
    pub const SET_COMPLETE: Self = Self::SET.completion();
    pub const RESET_COMPLETE: Self = Self::RESET.completion();
    pub const KEEPALIVE_COMPLETE: Self = Self::KEEPALIVE.completion();

    pub const fn completion(self) -> Self {
        Self(self.0 | Self::COMPLETION_FLAG)
    }

    pub const fn is_completion(self) -> bool {
        self.0 & Self::COMPLETION_FLAG != 0
    }

    /// HALT and RESET have no request id field.
    pub const fn carries_request_id(self) -> bool {
        !matches!(self.0, 0x0000_0003 | 0x0000_0006)
    }

    /// Messages the device may send on its own rather than as a reply.
    pub const fn is_unsolicited(self) -> bool {
        matches!(self.0, 0x0000_0007 | 0x0000_0008)
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::PACKET => "PACKET",
            Self::INIT => "INIT",
            Self::HALT => "HALT",
            Self::QUERY => "QUERY",
            Self::SET => "SET",
            Self::RESET => "RESET",
            Self::INDICATE_STATUS => "INDICATE_STATUS",
            Self::KEEPALIVE => "KEEPALIVE",
            Self::INIT_COMPLETE => "INIT_COMPLETE",
            Self::QUERY_COMPLETE => "QUERY_COMPLETE",
            Self::SET_COMPLETE => "SET_COMPLETE",
            Self::RESET_COMPLETE => "RESET_COMPLETE",
            Self::KEEPALIVE_COMPLETE => "KEEPALIVE_COMPLETE",
            _ => return write!(f, "MessageType({:#010x})", self.0),
        };
        f.write_str(name)
    }
}

/// NDIS status code carried in completions and indications.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Status(pub u32);

impl Status {
    pub const SUCCESS: Self = Self(0x0000_0000);
    pub const FAILURE: Self = Self(0xC000_0001);
    pub const INVALID_DATA: Self = Self(0xC001_0015);
    pub const NOT_SUPPORTED: Self = Self(0xC000_00BB);
    pub const MEDIA_CONNECT: Self = Self(0x4001_000B);
    pub const MEDIA_DISCONNECT: Self = Self(0x4001_000C);
    pub const MEDIA_SPECIFIC_INDICATION: Self = Self(0x4001_0012);

    pub const fn is_success(self) -> bool {
        self.0 == Self::SUCCESS.0
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::SUCCESS => "SUCCESS",
            Self::FAILURE => "FAILURE",
            Self::INVALID_DATA => "INVALID_DATA",
            Self::NOT_SUPPORTED => "NOT_SUPPORTED",
            Self::MEDIA_CONNECT => "MEDIA_CONNECT",
            Self::MEDIA_DISCONNECT => "MEDIA_DISCONNECT",
            Self::MEDIA_SPECIFIC_INDICATION => "MEDIA_SPECIFIC_INDICATION",
            _ => return write!(f, "Status({:#010x})", self.0),
        };
        f.write_str(name)
    }
}

#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum Oid {
    // General objects
    OID_GEN_SUPPORTED_LIST = 0x0001_0101,
    OID_GEN_HARDWARE_STATUS = 0x0001_0102,
    OID_GEN_MEDIA_SUPPORTED = 0x0001_0103,
    OID_GEN_MEDIA_IN_USE = 0x0001_0104,
    OID_GEN_MAXIMUM_FRAME_SIZE = 0x0001_0106,
    OID_GEN_LINK_SPEED = 0x0001_0107,
    OID_GEN_TRANSMIT_BLOCK_SIZE = 0x0001_010A,
    OID_GEN_RECEIVE_BLOCK_SIZE = 0x0001_010B,
    OID_GEN_VENDOR_ID = 0x0001_010C,
    OID_GEN_VENDOR_DESCRIPTION = 0x0001_010D,
    OID_GEN_CURRENT_PACKET_FILTER = 0x0001_010E,
    OID_GEN_MAXIMUM_TOTAL_SIZE = 0x0001_0111,
    OID_GEN_MEDIA_CONNECT_STATUS = 0x0001_0114,
    OID_GEN_PHYSICAL_MEDIUM = 0x0001_0202,

    // Ethernet objects
    OID_802_3_PERMANENT_ADDRESS = 0x0101_0101,
    OID_802_3_CURRENT_ADDRESS = 0x0101_0102,
    OID_802_3_MULTICAST_LIST = 0x0101_0103,
    OID_802_3_MAXIMUM_LIST_SIZE = 0x0101_0104,
}

impl Oid {
    pub const fn value(self) -> u32 {
        self as u32
    }
}

bitflags! {
    /// Values for OID_GEN_CURRENT_PACKET_FILTER.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct PacketFilter: u32 {
        const DIRECTED = 0x0000_0001;
        const MULTICAST = 0x0000_0002;
        const ALL_MULTICAST = 0x0000_0004;
        const BROADCAST = 0x0000_0008;
        const SOURCE_ROUTING = 0x0000_0010;
        const PROMISCUOUS = 0x0000_0020;
        const SMT = 0x0000_0040;
        const ALL_LOCAL = 0x0000_0080;
        const GROUP = 0x0000_1000;
        const ALL_FUNCTIONAL = 0x0000_2000;
        const FUNCTIONAL = 0x0000_4000;
        const MAC_FRAME = 0x0000_8000;
    }
}

impl PacketFilter {
    /// Filter programmed on enable.
    pub const DEFAULT: Self = Self::DIRECTED
        .union(Self::BROADCAST)
        .union(Self::ALL_MULTICAST)
        .union(Self::PROMISCUOUS);
}

/// Medium reported in INIT_COMPLETE.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Medium(pub u32);

impl Medium {
    pub const IEEE_802_3: Self = Self(0x0000_0000);
    pub const IEEE_802_5: Self = Self(0x0000_0001);
    pub const WIRELESS_WAN: Self = Self(0x0000_0009);
}

impl fmt::Debug for Medium {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::IEEE_802_3 => f.write_str("802.3"),
            Self::IEEE_802_5 => f.write_str("802.5"),
            Self::WIRELESS_WAN => f.write_str("WirelessWan"),
            _ => write!(f, "Medium({:#x})", self.0),
        }
    }
}
