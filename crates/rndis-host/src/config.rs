//! Driver tunables.
//!
//! Everything here used to be a compile-time constant; the defaults keep
//! those values.

use core::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::{DATA_HEADER_LEN, ETHERNET_HEADER_LEN};

pub const DEFAULT_OUT_BUFFER_COUNT: usize = 4;
pub const DEFAULT_OUT_BUFFER_SIZE: usize = 4096;
/// One reader performs better than two on a half-duplex USB2 bus.
pub const DEFAULT_IN_BUFFER_COUNT: usize = 1;
/// Large enough to take the biggest batches Android sends in one go.
pub const DEFAULT_IN_BUFFER_SIZE: usize = 16384;
pub const DEFAULT_TRANSMIT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_MAX_MTU: u32 = 1500;
pub const DEFAULT_COMMAND_BUFFER_SIZE: usize = 1052;
pub const DEFAULT_COMMAND_RETRIES: u32 = 10;
pub const DEFAULT_COMMAND_RETRY_DELAY: Duration = Duration::from_millis(20);
pub const DEFAULT_STALL_CLEAR_ATTEMPTS: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Number of transmit buffers in the pool.
    pub out_buffer_count: usize,
    /// Size of each transmit buffer. The device's maximum transfer size is
    /// clamped to this value.
    pub out_buffer_size: usize,
    /// Number of receive buffers kept in flight, 1 or 2.
    pub in_buffer_count: usize,
    /// Size of each receive buffer, also proposed to the device during INIT.
    pub in_buffer_size: usize,
    /// Capacity of the host transmit queue while the link is up.
    pub transmit_queue_capacity: usize,
    /// Ceiling for the derived MTU.
    pub max_mtu: u32,
    /// Bytes requested by each GET_ENCAPSULATED_RESPONSE.
    pub command_buffer_size: usize,
    /// Poll attempts for a single RNDIS command.
    pub command_retries: u32,
    /// Fixed back-off between poll attempts.
    pub command_retry_delay: Duration,
    /// Upper bound on back-to-back clear-stall requests for one pipe.
    pub stall_clear_attempts: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            out_buffer_count: DEFAULT_OUT_BUFFER_COUNT,
            out_buffer_size: DEFAULT_OUT_BUFFER_SIZE,
            in_buffer_count: DEFAULT_IN_BUFFER_COUNT,
            in_buffer_size: DEFAULT_IN_BUFFER_SIZE,
            transmit_queue_capacity: DEFAULT_TRANSMIT_QUEUE_CAPACITY,
            max_mtu: DEFAULT_MAX_MTU,
            command_buffer_size: DEFAULT_COMMAND_BUFFER_SIZE,
            command_retries: DEFAULT_COMMAND_RETRIES,
            command_retry_delay: DEFAULT_COMMAND_RETRY_DELAY,
            stall_clear_attempts: DEFAULT_STALL_CLEAR_ATTEMPTS,
        }
    }
}

impl DriverConfig {
    pub fn validate(&self) -> Result<()> {
        let min_buffer = DATA_HEADER_LEN + ETHERNET_HEADER_LEN;

        if !(1..=2).contains(&self.in_buffer_count) {
            return Err(Error::ConfigurationMismatch("in_buffer_count must be 1 or 2"));
        }
        if self.out_buffer_count == 0 || self.out_buffer_count > usize::from(u16::MAX) {
            return Err(Error::ConfigurationMismatch("out_buffer_count out of range"));
        }
        if self.out_buffer_size <= min_buffer || self.out_buffer_size > u32::MAX as usize {
            return Err(Error::ConfigurationMismatch("out_buffer_size out of range"));
        }
        if self.in_buffer_size <= min_buffer || self.in_buffer_size > u32::MAX as usize {
            return Err(Error::ConfigurationMismatch("in_buffer_size out of range"));
        }
        if self.command_buffer_size < 16 || self.command_buffer_size > usize::from(u16::MAX) {
            return Err(Error::ConfigurationMismatch("command_buffer_size out of range"));
        }
        if self.command_retries == 0 {
            return Err(Error::ConfigurationMismatch("command_retries must be nonzero"));
        }
        if self.stall_clear_attempts == 0 {
            return Err(Error::ConfigurationMismatch("stall_clear_attempts must be nonzero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DriverConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.out_buffer_count, 4);
        assert_eq!(config.out_buffer_size, 4096);
        assert_eq!(config.in_buffer_size, 16384);
        assert_eq!(config.transmit_queue_capacity, 256);
    }

    #[test]
    fn rejects_three_readers() {
        let config = DriverConfig {
            in_buffer_count: 3,
            ..DriverConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::ConfigurationMismatch(_))
        ));
    }

    #[test]
    fn rejects_buffers_smaller_than_headers() {
        let config = DriverConfig {
            out_buffer_size: 58,
            ..DriverConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
