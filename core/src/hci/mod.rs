//! Host-controller interface
//!
//! This module provides:
//! - FrameCodec: type-tagged, length-prefixed packet framing over a raw
//!   duplex byte stream, tolerant of arbitrary chunking
//! - ControllerLink: one controller's command queue (strictly one command in
//!   flight), event dispatch, and data routing
//!
//! Everything above this module sees packets and events, never raw bytes.

pub mod codec;
pub mod link;

pub use codec::{Event, FrameCodec, Packet, PacketType};
pub use link::{CommandReply, ControllerLink, LinkClient};

use thiserror::Error;

/// Frame-level decode errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Declared payload length exceeds the configured maximum. The frame is
    /// dropped; decoding resumes at the next frame boundary.
    #[error("Frame too long: {got} bytes (max {max})")]
    FrameTooLong { got: usize, max: usize },

    /// Unknown packet-type byte. There is no way to find the next frame
    /// boundary after this, so the link must be closed.
    #[error("Invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),
}

/// Controller-link errors
#[derive(Debug, Error, Clone)]
pub enum HciError {
    /// No completion or status event arrived for a command in time
    #[error("Command 0x{opcode:04X} timed out")]
    CommandTimeout { opcode: u16 },

    /// The controller answered a command with a non-success status
    #[error("Command 0x{opcode:04X} failed with status 0x{status:02X}")]
    CommandFailed { opcode: u16, status: u8 },

    /// The transport to the controller is gone
    #[error("Link lost")]
    LinkLost,

    /// An event payload was shorter than its event code requires
    #[error("Malformed event 0x{code:02X}: {reason}")]
    MalformedEvent { code: u8, reason: &'static str },

    #[error(transparent)]
    Framing(#[from] FrameError),
}

// Command opcodes used by the stack itself. Anything else goes through
// send_command with a caller-supplied opcode.
pub const CMD_DISCONNECT: u16 = 0x0406;
pub const CMD_RESET: u16 = 0x0C03;
pub const CMD_START_ENCRYPTION: u16 = 0x2019;

// Event codes
pub const EVT_CONNECTION_COMPLETE: u8 = 0x03;
pub const EVT_DISCONNECTION_COMPLETE: u8 = 0x05;
pub const EVT_ENCRYPTION_CHANGE: u8 = 0x08;
pub const EVT_COMMAND_COMPLETE: u8 = 0x0E;
pub const EVT_COMMAND_STATUS: u8 = 0x0F;

/// Success status, shared by command and connection-level events
pub const STATUS_SUCCESS: u8 = 0x00;
