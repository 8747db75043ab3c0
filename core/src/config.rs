//! Stack configuration
//!
//! Everything the embedder can tune in one place: per-connection MTU
//! defaults, reassembly limits, timeouts, and the pairing capabilities
//! advertised during the security handshake. The core reads these values at
//! connection/channel creation and never mutates them.

use crate::smp::IoCapability;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration validation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Attribute MTU too small: must be >= {min}, got {got}")]
    AttMtuTooSmall { min: u16, got: u16 },

    #[error("Channel MPS out of range: must be {min}-{max}, got {got}")]
    ChannelMpsOutOfRange { min: u16, max: u16, got: u16 },

    #[error("Channel MTU out of range: must be {min}-{max}, got {got}")]
    ChannelMtuOutOfRange { min: u16, max: u16, got: u16 },

    #[error("Initial credits must be > 0")]
    NoInitialCredits,

    #[error("Minimum key size out of range: must be 7-16, got {0}")]
    InvalidMinKeySize(u8),
}

/// Smallest attribute MTU any connection may use.
pub const ATT_MIN_MTU: u16 = 23;

/// Smallest data-channel MTU/MPS permitted by the multiplexer.
pub const CHANNEL_MIN_MTU: u16 = 23;
pub const CHANNEL_MAX_MTU: u16 = 65535;
pub const CHANNEL_MIN_MPS: u16 = 23;
pub const CHANNEL_MAX_MPS: u16 = 65533;

/// Stack-wide configuration, consumed at connection and channel creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    /// Attribute MTU this side is willing to accept (>= 23)
    pub att_mtu: u16,
    /// Largest reassembled payload the multiplexer will accept, in bytes
    pub max_reassembly_size: usize,
    /// Largest data-frame payload the frame codec will accept, in bytes
    pub max_frame_payload: usize,
    /// How long a controller command may stay unanswered
    pub command_timeout: Duration,
    /// How long an attribute request or pairing step may stay unanswered
    pub request_timeout: Duration,
    /// Default MTU proposed when opening a credit-based channel
    pub channel_mtu: u16,
    /// Default per-fragment payload size proposed for credit-based channels
    pub channel_mps: u16,
    /// Credits granted to the peer when a credit-based channel opens
    pub initial_credits: u16,
    /// Input/output capability advertised during pairing
    pub io_capability: IoCapability,
    /// Whether this side wants to bond (retain keys)
    pub bonding: bool,
    /// Whether this side requires an authenticated (MITM-protected) key
    pub mitm: bool,
    /// Whether this side supports the elliptic-curve pairing path
    pub secure_connections: bool,
    /// Smallest encryption key size this side will accept (7..=16)
    pub min_key_size: u8,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            att_mtu: 517,
            max_reassembly_size: 65535,
            max_frame_payload: 1024,
            command_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            channel_mtu: 2048,
            channel_mps: 1004,
            initial_credits: 256,
            io_capability: IoCapability::NoInputNoOutput,
            bonding: true,
            mitm: false,
            secure_connections: true,
            min_key_size: 7,
        }
    }
}

impl StackConfig {
    /// Validate the configuration, returning the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.att_mtu < ATT_MIN_MTU {
            return Err(ConfigError::AttMtuTooSmall {
                min: ATT_MIN_MTU,
                got: self.att_mtu,
            });
        }
        if self.channel_mtu < CHANNEL_MIN_MTU {
            return Err(ConfigError::ChannelMtuOutOfRange {
                min: CHANNEL_MIN_MTU,
                max: CHANNEL_MAX_MTU,
                got: self.channel_mtu,
            });
        }
        if self.channel_mps < CHANNEL_MIN_MPS || self.channel_mps > CHANNEL_MAX_MPS {
            return Err(ConfigError::ChannelMpsOutOfRange {
                min: CHANNEL_MIN_MPS,
                max: CHANNEL_MAX_MPS,
                got: self.channel_mps,
            });
        }
        if self.initial_credits == 0 {
            return Err(ConfigError::NoInitialCredits);
        }
        if !(7..=16).contains(&self.min_key_size) {
            return Err(ConfigError::InvalidMinKeySize(self.min_key_size));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(StackConfig::default().validate().is_ok());
    }

    #[test]
    fn test_reject_tiny_att_mtu() {
        let config = StackConfig {
            att_mtu: 10,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::AttMtuTooSmall { got: 10, .. })
        ));
    }

    #[test]
    fn test_reject_zero_credits() {
        let config = StackConfig {
            initial_credits: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoInitialCredits));
    }

    #[test]
    fn test_reject_bad_key_size() {
        let config = StackConfig {
            min_key_size: 17,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidMinKeySize(17)));
    }
}
