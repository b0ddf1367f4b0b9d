/******************************************************************************
*	usb/request.rs
*
*	The USB 2.0 setup packet (section 9.3) and the CDC class requests used to
*	tunnel RNDIS control messages over endpoint 0.
******************************************************************************/

use bitflags::bitflags;

bitflags! {
    /// bmRequestType.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct RequestType: u8 {
        const DEVICE_TO_HOST = 0x80;
        const CLASS = 0x20;
        const VENDOR = 0x40;
        const RECIPIENT_INTERFACE = 0x01;
        const RECIPIENT_ENDPOINT = 0x02;
    }
}

impl RequestType {
    /// 0x21: host-to-device, class, interface.
    pub const CLASS_INTERFACE_OUT: Self = Self::CLASS.union(Self::RECIPIENT_INTERFACE);
    /// 0xA1: device-to-host, class, interface.
    pub const CLASS_INTERFACE_IN: Self = Self::DEVICE_TO_HOST
        .union(Self::CLASS)
        .union(Self::RECIPIENT_INTERFACE);
}

/// CDC class-specific requests (CDC 1.1, table 46).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdcRequest {
    SendEncapsulatedCommand = 0x00,
    GetEncapsulatedResponse = 0x01,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRequest {
    pub request_type: RequestType,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl DeviceRequest {
    pub fn new(request_type: RequestType, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    /// SEND_ENCAPSULATED_COMMAND carrying `length` bytes to `interface`.
    pub fn send_encapsulated_command(interface: u8, length: u16) -> Self {
        Self::new(
            RequestType::CLASS_INTERFACE_OUT,
            CdcRequest::SendEncapsulatedCommand as u8,
            0,
            u16::from(interface),
            length,
        )
    }

    /// GET_ENCAPSULATED_RESPONSE for up to `length` bytes from `interface`.
    pub fn get_encapsulated_response(interface: u8, length: u16) -> Self {
        Self::new(
            RequestType::CLASS_INTERFACE_IN,
            CdcRequest::GetEncapsulatedResponse as u8,
            0,
            u16::from(interface),
            length,
        )
    }

    pub fn is_in(&self) -> bool {
        self.request_type.contains(RequestType::DEVICE_TO_HOST)
    }

    /// The 8-byte setup packet as it goes on the wire.
    pub fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type.bits(),
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }
}
