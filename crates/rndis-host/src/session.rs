//! An RNDIS function bound to its two USB interfaces.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::command::CommandChannel;
use crate::config::DriverConfig;
use crate::error::{Error, ProtocolError, Result};
use crate::matching::{ControlKind, InterfaceMatch};
use crate::net::EthernetAddress;
use crate::protocol::{
    Medium, Oid, PacketFilter, DATA_HEADER_LEN, ETHERNET_ADDRESS_LEN, ETHERNET_HEADER_LEN,
    PERMANENT_ADDRESS_QUERY_LEN,
};
use crate::usb::{self, Direction, EndpointDescriptor, UsbDevice, UsbInterface, UsbPipe};

/// Largest Ethernet payload that fits in one transfer of
/// `max_transfer_size` bytes, capped at `max_mtu`.
pub fn derive_mtu(max_transfer_size: u32, max_mtu: u32) -> u32 {
    let overhead = (DATA_HEADER_LEN + ETHERNET_HEADER_LEN) as u32;
    max_transfer_size.saturating_sub(overhead).min(max_mtu)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub configuration_value: u8,
    pub control_interface: u8,
    pub data_interface: u8,
    pub kind: ControlKind,
    /// What the device reported in INIT_COMPLETE.
    pub device_max_transfer_size: u32,
    /// The above, clamped to the transmit buffer size.
    pub max_transfer_size: u32,
    pub max_packets_per_transfer: u32,
    pub packet_alignment_factor: u32,
    pub medium: Medium,
    pub mtu: u32,
}

pub struct RndisSession {
    control: Arc<dyn UsbInterface>,
    data: Arc<dyn UsbInterface>,
    in_pipe: Arc<dyn UsbPipe>,
    out_pipe: Arc<dyn UsbPipe>,
    commands: Mutex<CommandChannel>,
    info: SessionInfo,
    closed: AtomicBool,
}

impl RndisSession {
    /// Opens both interfaces, checks the data endpoints and runs the INIT
    /// handshake. On failure every interface opened here is closed again.
    pub fn open(
        device: &dyn UsbDevice,
        found: InterfaceMatch,
        config: &DriverConfig,
    ) -> Result<Self> {
        config.validate()?;

        let control = device.open_interface(found.control_interface).map_err(|err| {
            error!(
                "rndis: cannot open control interface {}: {}",
                found.control_interface, err
            );
            Error::from(err)
        })?;
        let data = match device.open_interface(found.data_interface) {
            Ok(data) => data,
            Err(err) => {
                error!(
                    "rndis: cannot open data interface {}: {}",
                    found.data_interface, err
                );
                control.close();
                return Err(err.into());
            }
        };

        match Self::start(Arc::clone(&control), Arc::clone(&data), found, config) {
            Ok(session) => Ok(session),
            Err(err) => {
                error!("rndis: attach failed: {}", err);
                data.close();
                control.close();
                Err(err)
            }
        }
    }

    fn start(
        control: Arc<dyn UsbInterface>,
        data: Arc<dyn UsbInterface>,
        found: InterfaceMatch,
        config: &DriverConfig,
    ) -> Result<Self> {
        let (in_ep, out_ep) = bulk_pair(&data.endpoints())?;
        let in_pipe = data.open_pipe(&in_ep)?;
        let out_pipe = data.open_pipe(&out_ep)?;
        debug!(
            "rndis: data pipes in {:#04x} out {:#04x}",
            in_ep.address, out_ep.address
        );

        let mut commands = CommandChannel::new(Arc::clone(&control), config);
        let done = commands.init(config.in_buffer_size as u32)?;

        let max_transfer_size = done.max_transfer_size.min(config.out_buffer_size as u32);
        let mtu = derive_mtu(max_transfer_size, config.max_mtu);
        if done.max_transfer_size > max_transfer_size {
            debug!(
                "rndis: device max_transfer_size {} clamped to {}",
                done.max_transfer_size, max_transfer_size
            );
        }

        let info = SessionInfo {
            configuration_value: found.configuration_value,
            control_interface: found.control_interface,
            data_interface: found.data_interface,
            kind: found.kind,
            device_max_transfer_size: done.max_transfer_size,
            max_transfer_size,
            max_packets_per_transfer: done.max_packets_per_transfer,
            packet_alignment_factor: done.packet_alignment_factor,
            medium: Medium(done.medium),
            mtu,
        };
        info!(
            "rndis: {:?} device up on interfaces {}/{}: max_transfer_size {}, mtu {}",
            info.kind, info.control_interface, info.data_interface, max_transfer_size, mtu
        );

        Ok(Self {
            control,
            data,
            in_pipe,
            out_pipe,
            commands: Mutex::new(commands),
            info,
            closed: AtomicBool::new(false),
        })
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn in_pipe(&self) -> &dyn UsbPipe {
        &*self.in_pipe
    }

    pub fn out_pipe(&self) -> &dyn UsbPipe {
        &*self.out_pipe
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queries `oid`. With `expected_len` set, a reply of any other size is
    /// an error.
    pub fn query(&self, oid: Oid, in_len: u32, expected_len: Option<usize>) -> Result<Vec<u8>> {
        let payload = self.commands.lock().query(oid, in_len)?;
        match expected_len {
            Some(expected) if payload.len() != expected => {
                warn!(
                    "rndis: query {:?} returned {} bytes, expected {}",
                    oid,
                    payload.len(),
                    expected
                );
                Err(ProtocolError::UnexpectedReplyLength {
                    expected,
                    actual: payload.len(),
                }
                .into())
            }
            _ => Ok(payload),
        }
    }

    pub fn set_packet_filter(&self, filter: PacketFilter) -> Result<()> {
        self.commands.lock().set_packet_filter(filter)
    }

    pub fn hardware_address(&self) -> Result<EthernetAddress> {
        let reply = self.query(
            Oid::OID_802_3_PERMANENT_ADDRESS,
            PERMANENT_ADDRESS_QUERY_LEN,
            Some(ETHERNET_ADDRESS_LEN),
        )?;
        let addr = EthernetAddress::from_bytes(&reply)?;
        info!("rndis: permanent address {}", addr);
        Ok(addr)
    }

    /// Cancels outstanding transfers on both data pipes and clears any halt
    /// left behind. May run completions synchronously.
    pub fn abort_pipes(&self, stall_clear_attempts: u32) {
        for (name, pipe) in [("in", &self.in_pipe), ("out", &self.out_pipe)] {
            pipe.abort();
            if let Err(err) = usb::clear_stall(&**pipe, stall_clear_attempts) {
                debug!("rndis: clearing {} pipe after abort: {}", name, err);
            }
        }
    }

    /// Closes the data interface, then the control interface. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(
            "rndis: closing interfaces {}/{}",
            self.info.data_interface, self.info.control_interface
        );
        self.data.close();
        self.control.close();
    }
}

fn bulk_pair(endpoints: &[EndpointDescriptor]) -> Result<(EndpointDescriptor, EndpointDescriptor)> {
    if endpoints.len() != 2 {
        error!(
            "rndis: data interface has {} endpoints, expected 2",
            endpoints.len()
        );
        return Err(Error::ConfigurationMismatch(
            "data interface must have exactly two endpoints",
        ));
    }

    let mut in_ep = None;
    let mut out_ep = None;
    for ep in endpoints {
        if !ep.is_bulk() {
            return Err(Error::ConfigurationMismatch("data endpoint is not bulk"));
        }
        match ep.direction() {
            Direction::In => in_ep = Some(*ep),
            Direction::Out => out_ep = Some(*ep),
        }
    }

    match (in_ep, out_ep) {
        (Some(in_ep), Some(out_ep)) => Ok((in_ep, out_ep)),
        _ => Err(Error::ConfigurationMismatch(
            "data endpoints must be one IN and one OUT",
        )),
    }
}
