//! Host-side RNDIS engine for USB-tethered phones and Linux gadgets.
//!
//! The crate talks RNDIS over a pair of USB interfaces (a control interface
//! carrying encapsulated commands and a CDC data interface with one bulk IN
//! and one bulk OUT pipe) and presents the result as an Ethernet-like device
//! to a host network stack.
//!
//! The USB host stack and the network stack are both reached through traits
//! ([`usb::UsbDevice`], [`usb::UsbInterface`], [`usb::UsbPipe`] and
//! [`net::NetworkStack`]) so the engine can run against a real host API or
//! an in-memory double.
//!
//! The usual flow is:
//!
//! 1. [`RndisDriver::attach`] matches the control/data interface pair, opens
//!    both interfaces and performs the RNDIS INIT handshake.
//! 2. [`RndisDriver::enable`] allocates buffers, programs the packet filter and
//!    starts the perpetual bulk IN read loop.
//! 3. [`RndisDriver::transmit`] wraps Ethernet frames in RNDIS packet messages
//!    while received batches are split and pushed to
//!    [`net::NetworkStack::frame_received`].
//! 4. [`RndisDriver::disable`] and [`RndisDriver::terminate`] tear it all down.

pub mod codec;
pub mod command;
pub mod config;
pub mod driver;
pub mod error;
pub mod matching;
pub mod net;
pub mod pool;
pub mod protocol;
pub mod session;
pub mod usb;

#[cfg(test)]
mod sim;

pub use config::DriverConfig;
pub use driver::{LifecycleState, RndisDriver, TransmitStatus};
pub use error::{Error, ProtocolError, Result};
pub use net::NetworkStack;
pub use session::{RndisSession, SessionInfo};
