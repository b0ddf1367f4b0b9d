/******************************************************************************
*	usb/descriptors.rs
*
*	The subset of USB 2.0 chapter 9 descriptors the RNDIS matcher and the
*	session setup look at, plus a walker that turns a raw configuration
*	descriptor blob into them.
******************************************************************************/

use crate::error::{Error, Result};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorType {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    DeviceQualifier = 6,
    OtherSpeedConfiguration = 7,
    InterfacePower = 8,
    InterfaceAssociation = 11,
    ClassInterface = 36,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceClass {
    Communications = 0x02,
    CdcData = 0x0A,
    WirelessController = 0xE0,
    Miscellaneous = 0xEF,
    VendorSpecific = 0xFF,
}

impl InterfaceClass {
    pub const fn code(self) -> u8 {
        self as u8
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub alternate_setting: u8,
    pub endpoint_count: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl InterfaceDescriptor {
    pub fn triple(&self) -> (u8, u8, u8) {
        (self.class, self.subclass, self.protocol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub const DIRECTION_IN: u8 = 0x80;

    pub fn number(&self) -> u8 {
        self.address & 0x0f
    }

    pub fn direction(&self) -> Direction {
        if self.address & Self::DIRECTION_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn transfer_type(&self) -> TransferType {
        match self.attributes & 0x3 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }

    pub fn is_bulk(&self) -> bool {
        self.transfer_type() == TransferType::Bulk
    }
}

/// An interface (first alternate setting seen) and the endpoints that
/// follow it in the configuration blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceEntry {
    pub descriptor: InterfaceDescriptor,
    pub endpoints: Vec<EndpointDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationDescriptor {
    pub value: u8,
    pub interfaces: Vec<InterfaceEntry>,
}

impl ConfigurationDescriptor {
    pub fn interface(&self, number: u8) -> Option<&InterfaceEntry> {
        self.interfaces
            .iter()
            .find(|entry| entry.descriptor.number == number)
    }

    /// Walks a full configuration descriptor (as returned by
    /// GET_DESCRIPTOR(Configuration) with wTotalLength bytes).
    ///
    /// Class-specific and unknown descriptors are skipped. Only alternate
    /// setting 0 of each interface is kept.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let malformed = Error::ConfigurationMismatch("malformed configuration descriptor");

        if bytes.len() < 9 || bytes[1] != DescriptorType::Configuration as u8 {
            return Err(malformed);
        }
        let total = usize::from(u16::from_le_bytes([bytes[2], bytes[3]])).min(bytes.len());
        let value = bytes[5];

        let mut interfaces: Vec<InterfaceEntry> = Vec::new();
        let mut skipping_alternate = false;
        let mut at = usize::from(bytes[0]);

        while at + 2 <= total {
            let len = usize::from(bytes[at]);
            if len < 2 || at + len > total {
                return Err(malformed);
            }
            let desc = &bytes[at..at + len];

            match desc[1] {
                t if t == DescriptorType::Interface as u8 => {
                    if len < 9 {
                        return Err(malformed);
                    }
                    skipping_alternate = desc[3] != 0;
                    if !skipping_alternate {
                        interfaces.push(InterfaceEntry {
                            descriptor: InterfaceDescriptor {
                                number: desc[2],
                                alternate_setting: desc[3],
                                endpoint_count: desc[4],
                                class: desc[5],
                                subclass: desc[6],
                                protocol: desc[7],
                            },
                            endpoints: Vec::new(),
                        });
                    }
                }
                t if t == DescriptorType::Endpoint as u8 => {
                    if len < 7 {
                        return Err(malformed);
                    }
                    if skipping_alternate {
                        at += len;
                        continue;
                    }
                    let Some(current) = interfaces.last_mut() else {
                        return Err(malformed);
                    };
                    current.endpoints.push(EndpointDescriptor {
                        address: desc[2],
                        attributes: desc[3],
                        max_packet_size: u16::from_le_bytes([desc[4], desc[5]]),
                        interval: desc[6],
                    });
                }
                _ => {}
            }
            at += len;
        }

        Ok(ConfigurationDescriptor { value, interfaces })
    }
}
