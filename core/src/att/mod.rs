//! Attribute protocol
//!
//! Request/response exchange over the fixed attribute channel:
//! - pdu.rs: PDU codec (hand-packed, little-endian handles)
//! - server.rs: attribute table, request handling, notifications and
//!   indications
//! - client.rs: serialized outbound requests, typed error mapping, paged
//!   discovery and long-value reads
//!
//! Correlation is purely by channel-level ordering: there is no transaction
//! identifier, so at most one request may be outstanding per connection at a
//! time. The client enforces that by queuing; the server answers strictly in
//! order.

pub mod client;
pub mod pdu;
pub mod server;

pub use client::{AttributeClient, AttributeUpdate};
pub use pdu::{AttPdu, AttUuid};
pub use server::{Attribute, AttributePermissions, AttributeServer, ServerSession};

use crate::l2cap::{FixedChannelSink, L2capError};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

// Opcodes
pub const OP_ERROR_RESPONSE: u8 = 0x01;
pub const OP_EXCHANGE_MTU_REQUEST: u8 = 0x02;
pub const OP_EXCHANGE_MTU_RESPONSE: u8 = 0x03;
pub const OP_FIND_INFORMATION_REQUEST: u8 = 0x04;
pub const OP_FIND_INFORMATION_RESPONSE: u8 = 0x05;
pub const OP_READ_REQUEST: u8 = 0x0A;
pub const OP_READ_RESPONSE: u8 = 0x0B;
pub const OP_READ_BLOB_REQUEST: u8 = 0x0C;
pub const OP_READ_BLOB_RESPONSE: u8 = 0x0D;
pub const OP_WRITE_REQUEST: u8 = 0x12;
pub const OP_WRITE_RESPONSE: u8 = 0x13;
pub const OP_WRITE_COMMAND: u8 = 0x52;
pub const OP_NOTIFICATION: u8 = 0x1B;
pub const OP_INDICATION: u8 = 0x1D;
pub const OP_CONFIRMATION: u8 = 0x1E;

/// Protocol error codes carried in an error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttErrorCode {
    InvalidHandle,
    ReadNotPermitted,
    WriteNotPermitted,
    InsufficientAuthentication,
    RequestNotSupported,
    InvalidOffset,
    AttributeNotFound,
    InsufficientEncryptionKeySize,
    InvalidAttributeValueLength,
    UnlikelyError,
    InsufficientEncryption,
    Other(u8),
}

impl AttErrorCode {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Self::InvalidHandle,
            0x02 => Self::ReadNotPermitted,
            0x03 => Self::WriteNotPermitted,
            0x05 => Self::InsufficientAuthentication,
            0x06 => Self::RequestNotSupported,
            0x07 => Self::InvalidOffset,
            0x0A => Self::AttributeNotFound,
            0x0C => Self::InsufficientEncryptionKeySize,
            0x0D => Self::InvalidAttributeValueLength,
            0x0E => Self::UnlikelyError,
            0x0F => Self::InsufficientEncryption,
            other => Self::Other(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::InvalidHandle => 0x01,
            Self::ReadNotPermitted => 0x02,
            Self::WriteNotPermitted => 0x03,
            Self::InsufficientAuthentication => 0x05,
            Self::RequestNotSupported => 0x06,
            Self::InvalidOffset => 0x07,
            Self::AttributeNotFound => 0x0A,
            Self::InsufficientEncryptionKeySize => 0x0C,
            Self::InvalidAttributeValueLength => 0x0D,
            Self::UnlikelyError => 0x0E,
            Self::InsufficientEncryption => 0x0F,
            Self::Other(code) => *code,
        }
    }
}

/// Attribute-protocol failures, as seen by the requesting caller.
#[derive(Debug, Error, Clone)]
pub enum AttError {
    /// The peer answered with an error response
    #[error("Attribute error {code:?} (request 0x{request:02X}, handle 0x{handle:04X})")]
    Peer {
        request: u8,
        handle: u16,
        code: AttErrorCode,
    },

    /// No response arrived within the request timeout
    #[error("Attribute request timed out")]
    Timeout,

    /// The connection went away with the request outstanding
    #[error("Attribute channel closed")]
    Closed,

    /// The peer sent a PDU that does not decode, or answered with the wrong
    /// response kind
    #[error("Malformed attribute PDU (opcode 0x{0:02X})")]
    Malformed(u8),

    #[error(transparent)]
    L2cap(#[from] L2capError),
}

/// Routes attribute-channel PDUs by opcode: requests and confirmations to
/// the server session, responses and server-initiated updates to the client.
pub struct AttBearer {
    pub server: Arc<ServerSession>,
    pub client: Arc<AttributeClient>,
}

#[async_trait]
impl FixedChannelSink for AttBearer {
    async fn on_pdu(&self, pdu: Vec<u8>) {
        let Some(&opcode) = pdu.first() else {
            warn!("empty attribute PDU");
            return;
        };
        match opcode {
            OP_ERROR_RESPONSE
            | OP_EXCHANGE_MTU_RESPONSE
            | OP_FIND_INFORMATION_RESPONSE
            | OP_READ_RESPONSE
            | OP_READ_BLOB_RESPONSE
            | OP_WRITE_RESPONSE
            | OP_NOTIFICATION
            | OP_INDICATION => self.client.on_pdu(&pdu).await,
            _ => self.server.on_pdu(&pdu).await,
        }
    }
}
