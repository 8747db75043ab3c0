//! Channel multiplexer
//!
//! Turns one byte-oriented connection into many logical channels:
//! - signaling.rs: control-frame codec for the signaling channel
//! - channel.rs: credit-based channel state machine, segmentation and
//!   reassembly, credit flow control
//! - manager.rs: per-connection channel table, identifier allocation,
//!   fixed-channel routing
//!
//! Fixed channels (attribute, signaling, security) exist for the life of the
//! connection; dynamic channels are created by a request/response handshake
//! and carry credit-based flow control.

pub mod channel;
pub mod manager;
pub mod signaling;

pub use channel::{ChannelState, CreditChannel};
pub use manager::{ChannelManager, ChannelServerRegistry, FixedChannelSink, IncomingChannel};
pub use signaling::{ControlFrame, SignalingPacket};

use crate::hci::HciError;
use thiserror::Error;

// Fixed channel identifiers
pub const CID_ATTRIBUTE: u16 = 0x0004;
pub const CID_SIGNALING: u16 = 0x0005;
pub const CID_SECURITY: u16 = 0x0006;

// Dynamic channel identifier space, lowest free first, reusable after close
pub const DYNAMIC_CID_START: u16 = 0x0040;
pub const DYNAMIC_CID_END: u16 = 0x007F;

// Dynamically assignable protocol/service identifiers
pub const PSM_DYNAMIC_START: u16 = 0x0080;
pub const PSM_DYNAMIC_END: u16 = 0x00FF;

/// Length + channel-id header in front of every channel PDU
pub const PDU_HEADER_SIZE: usize = 4;
/// Total-length prefix carried by the first fragment of an SDU
pub const SDU_LENGTH_PREFIX_SIZE: usize = 2;

/// Result codes for a credit-based connection response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ConnectionResult {
    Success = 0x0000,
    PsmNotSupported = 0x0002,
    NoResources = 0x0004,
    InsufficientAuthentication = 0x0005,
    InsufficientEncryption = 0x0008,
    InvalidSourceCid = 0x0009,
    SourceCidAlreadyAllocated = 0x000A,
}

impl ConnectionResult {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Self::Success),
            0x0002 => Some(Self::PsmNotSupported),
            0x0004 => Some(Self::NoResources),
            0x0005 => Some(Self::InsufficientAuthentication),
            0x0008 => Some(Self::InsufficientEncryption),
            0x0009 => Some(Self::InvalidSourceCid),
            0x000A => Some(Self::SourceCidAlreadyAllocated),
            _ => None,
        }
    }
}

// Command-reject reasons
pub const REJECT_COMMAND_NOT_UNDERSTOOD: u16 = 0x0000;
pub const REJECT_SIGNALING_MTU_EXCEEDED: u16 = 0x0001;
pub const REJECT_INVALID_CID: u16 = 0x0002;

/// Channel multiplexer errors
#[derive(Debug, Error, Clone)]
pub enum L2capError {
    /// The peer refused the channel-open request
    #[error("Channel refused: {0:?}")]
    ChannelRefused(ConnectionResult),

    /// A declared or reassembled payload exceeds the configured maximum
    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An outbound payload exceeds the channel's negotiated MTU
    #[error("Payload exceeds channel MTU: {size} bytes (MTU {mtu})")]
    SduTooLarge { size: usize, mtu: u16 },

    /// Reassembly produced more bytes than the declared total length
    #[error("Reassembly overflow: declared {declared}, received {received}")]
    ReassemblyOverflow { declared: usize, received: usize },

    #[error("No free channel identifier")]
    NoFreeCid,

    #[error("No channel with identifier 0x{0:04X}")]
    NoSuchChannel(u16),

    #[error("Channel is closed")]
    ChannelClosed,

    #[error("Operation invalid in state {0}")]
    InvalidState(&'static str),

    #[error("No response to signaling request")]
    RequestTimeout,

    #[error("Malformed control frame (code 0x{code:02X})")]
    MalformedControlFrame { code: u8 },

    #[error(transparent)]
    Hci(#[from] HciError),
}
