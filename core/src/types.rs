// Core identifier types shared by every layer of the stack

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one live link to a peer, as assigned by the controller.
///
/// Handles are unique among live connections and become reusable after the
/// disconnection-complete event for the old connection has been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u16);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// A peer device address (6 bytes, transmitted little-endian on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress(pub [u8; 6]);

impl PeerAddress {
    pub const ANY: PeerAddress = PeerAddress([0; 6]);

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Conventional big-endian display, most significant byte first
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[5], self.0[4], self.0[3], self.0[2], self.0[1], self.0[0]
        )
    }
}

/// Which side of the link this stack is on for a given connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// We initiated the connection
    Initiator,
    /// The peer initiated the connection
    Responder,
}

impl Role {
    pub fn from_u8(value: u8) -> Self {
        if value == 0 {
            Role::Initiator
        } else {
            Role::Responder
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Role::Initiator => 0,
            Role::Responder => 1,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "Initiator"),
            Role::Responder => write!(f, "Responder"),
        }
    }
}

/// Security level of a connection, ordered from weakest to strongest.
///
/// Attribute permissions compare against this; pairing and encryption raise
/// it. Comparisons use the derived `Ord`, so the variant order matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SecurityLevel {
    /// No pairing, no encryption
    Open,
    /// Link encrypted with an unauthenticated key (just-works pairing)
    Encrypted,
    /// Link encrypted with an authenticated key (passkey / numeric comparison)
    Authenticated,
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityLevel::Open => write!(f, "Open"),
            SecurityLevel::Encrypted => write!(f, "Encrypted"),
            SecurityLevel::Authenticated => write!(f, "Authenticated"),
        }
    }
}

/// Live security status of one connection, shared between the channel
/// multiplexer (open-request checks), the attribute server (permission
/// checks), and the security manager (which raises it).
#[derive(Debug)]
pub struct LinkSecurity {
    level: parking_lot::Mutex<SecurityLevel>,
}

impl Default for LinkSecurity {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkSecurity {
    pub fn new() -> Self {
        Self {
            level: parking_lot::Mutex::new(SecurityLevel::Open),
        }
    }

    pub fn level(&self) -> SecurityLevel {
        *self.level.lock()
    }

    pub fn set_level(&self, level: SecurityLevel) {
        *self.level.lock() = level;
    }

    /// True once the link is encrypted (at any level above Open).
    pub fn is_encrypted(&self) -> bool {
        self.level() > SecurityLevel::Open
    }
}
