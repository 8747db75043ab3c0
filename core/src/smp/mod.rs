//! Security manager
//!
//! Per-connection pairing: capability exchange, deterministic method
//! selection, key agreement (elliptic-curve with commit-before-reveal, or
//! the legacy temporary-key path), key distribution, and bonding-record
//! production.
//!
//! - pdu.rs: pairing PDU codec
//! - crypto.rs: key agreement, confirmation MACs, key derivation
//! - pairing.rs: the state machine itself

pub mod crypto;
pub mod pairing;
pub mod pdu;

pub use pairing::{PairingDelegate, SecurityManager, SecurityNotice};
pub use pdu::{PairingFeatures, SmpPdu};

use crate::types::PeerAddress;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// PDU codes
pub const OP_PAIRING_REQUEST: u8 = 0x01;
pub const OP_PAIRING_RESPONSE: u8 = 0x02;
pub const OP_PAIRING_CONFIRM: u8 = 0x03;
pub const OP_PAIRING_RANDOM: u8 = 0x04;
pub const OP_PAIRING_FAILED: u8 = 0x05;
pub const OP_ENCRYPTION_INFORMATION: u8 = 0x06;
pub const OP_CENTRAL_IDENTIFICATION: u8 = 0x07;
pub const OP_IDENTITY_INFORMATION: u8 = 0x08;
pub const OP_IDENTITY_ADDRESS_INFORMATION: u8 = 0x09;
pub const OP_SIGNING_INFORMATION: u8 = 0x0A;
pub const OP_SECURITY_REQUEST: u8 = 0x0B;
pub const OP_PUBLIC_KEY: u8 = 0x0C;
pub const OP_DHKEY_CHECK: u8 = 0x0D;

// Authentication-requirement bits
pub const AUTH_REQ_BONDING: u8 = 0x01;
pub const AUTH_REQ_MITM: u8 = 0x04;
pub const AUTH_REQ_SECURE_CONNECTIONS: u8 = 0x08;

// Key-distribution bits
pub const KEY_DIST_ENCRYPTION: u8 = 0x01;
pub const KEY_DIST_IDENTITY: u8 = 0x02;
pub const KEY_DIST_SIGNING: u8 = 0x04;

pub const MAX_KEY_SIZE: u8 = 16;

/// Input/output capability advertised during the feature exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoCapability {
    DisplayOnly,
    DisplayYesNo,
    KeyboardOnly,
    NoInputNoOutput,
    KeyboardDisplay,
}

impl IoCapability {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::DisplayOnly),
            0x01 => Some(Self::DisplayYesNo),
            0x02 => Some(Self::KeyboardOnly),
            0x03 => Some(Self::NoInputNoOutput),
            0x04 => Some(Self::KeyboardDisplay),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::DisplayOnly => 0x00,
            Self::DisplayYesNo => 0x01,
            Self::KeyboardOnly => 0x02,
            Self::NoInputNoOutput => 0x03,
            Self::KeyboardDisplay => 0x04,
        }
    }

    pub fn can_input(&self) -> bool {
        matches!(
            self,
            Self::KeyboardOnly | Self::KeyboardDisplay | Self::DisplayYesNo
        )
    }

    pub fn can_display(&self) -> bool {
        matches!(
            self,
            Self::DisplayOnly | Self::DisplayYesNo | Self::KeyboardDisplay
        )
    }
}

/// Reason codes carried in a pairing-failed PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingFailedReason {
    PasskeyEntryFailed,
    OobNotAvailable,
    AuthenticationRequirements,
    ConfirmValueFailed,
    PairingNotSupported,
    EncryptionKeySize,
    CommandNotSupported,
    UnspecifiedReason,
    InvalidParameters,
    DhKeyCheckFailed,
    NumericComparisonFailed,
    /// The two sides' independently computed methods diverged. Never put on
    /// the wire by this stack, but a peer may report it.
    MethodMismatch,
    Other(u8),
}

impl PairingFailedReason {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Self::PasskeyEntryFailed,
            0x02 => Self::OobNotAvailable,
            0x03 => Self::AuthenticationRequirements,
            0x04 => Self::ConfirmValueFailed,
            0x05 => Self::PairingNotSupported,
            0x06 => Self::EncryptionKeySize,
            0x07 => Self::CommandNotSupported,
            0x08 => Self::UnspecifiedReason,
            0x0A => Self::InvalidParameters,
            0x0B => Self::DhKeyCheckFailed,
            0x0C => Self::NumericComparisonFailed,
            0x0E => Self::MethodMismatch,
            other => Self::Other(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::PasskeyEntryFailed => 0x01,
            Self::OobNotAvailable => 0x02,
            Self::AuthenticationRequirements => 0x03,
            Self::ConfirmValueFailed => 0x04,
            Self::PairingNotSupported => 0x05,
            Self::EncryptionKeySize => 0x06,
            Self::CommandNotSupported => 0x07,
            Self::UnspecifiedReason => 0x08,
            Self::InvalidParameters => 0x0A,
            Self::DhKeyCheckFailed => 0x0B,
            Self::NumericComparisonFailed => 0x0C,
            Self::MethodMismatch => 0x0E,
            Self::Other(code) => *code,
        }
    }
}

/// Security-manager errors, as seen by the caller that requested pairing.
#[derive(Debug, Error, Clone)]
pub enum SmpError {
    /// A nonce/confirmation/key-check mismatch, or the peer reported one.
    /// The session is dead; pairing must restart from idle.
    #[error("Authentication failure: {0:?}")]
    AuthenticationFailure(PairingFailedReason),

    /// The two sides could not converge on a pairing method
    #[error("Pairing method mismatch")]
    MethodMismatch,

    /// Pairing aborted for a non-cryptographic reason
    #[error("Pairing failed: {0:?}")]
    Failed(PairingFailedReason),

    #[error("Pairing already in progress")]
    InProgress,

    #[error("No pairing response within the timeout")]
    Timeout,

    /// The connection went away mid-pairing
    #[error("Connection lost during pairing")]
    Disconnected,

    #[error("Malformed pairing PDU (code 0x{0:02X})")]
    Malformed(u8),

    #[error(transparent)]
    L2cap(#[from] crate::l2cap::L2capError),
}

/// How the two sides will authenticate the key agreement. Both sides
/// compute this independently from the exchanged capabilities; the table is
/// deterministic, so they converge or pairing fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingMethod {
    JustWorks,
    /// One side displays a passkey, the other types it
    PasskeyEntry { initiator_displays: bool },
    /// Both sides display a code and the users compare (secure path only)
    NumericComparison,
}

impl PairingMethod {
    pub fn is_authenticated(&self) -> bool {
        !matches!(self, PairingMethod::JustWorks)
    }
}

/// Select the pairing method from the exchanged capabilities.
///
/// Symmetric by construction: both sides evaluate the same inputs in the
/// same order. MITM not requested by either side short-circuits to
/// just-works regardless of capability.
pub fn select_method(
    secure: bool,
    initiator_io: IoCapability,
    responder_io: IoCapability,
    initiator_mitm: bool,
    responder_mitm: bool,
) -> PairingMethod {
    use IoCapability::*;

    if !initiator_mitm && !responder_mitm {
        return PairingMethod::JustWorks;
    }
    match (initiator_io, responder_io) {
        (NoInputNoOutput, _) | (_, NoInputNoOutput) => PairingMethod::JustWorks,
        (DisplayOnly, DisplayOnly)
        | (DisplayOnly, DisplayYesNo)
        | (DisplayYesNo, DisplayOnly) => PairingMethod::JustWorks,
        (DisplayYesNo, DisplayYesNo) => {
            if secure {
                PairingMethod::NumericComparison
            } else {
                PairingMethod::JustWorks
            }
        }
        (DisplayYesNo, KeyboardDisplay)
        | (KeyboardDisplay, DisplayYesNo)
        | (KeyboardDisplay, KeyboardDisplay)
            if secure =>
        {
            PairingMethod::NumericComparison
        }
        // Keyboard/display combinations: the side that can display shows
        // the passkey, the other types it
        (DisplayOnly | DisplayYesNo | KeyboardDisplay, KeyboardOnly) => {
            PairingMethod::PasskeyEntry {
                initiator_displays: true,
            }
        }
        (KeyboardOnly, _) => PairingMethod::PasskeyEntry {
            // Covers keyboard-vs-keyboard too: the initiator side's
            // delegate supplies the code both users type
            initiator_displays: false,
        },
        (KeyboardDisplay, DisplayOnly | DisplayYesNo) => PairingMethod::PasskeyEntry {
            initiator_displays: false,
        },
        (DisplayOnly | DisplayYesNo | KeyboardDisplay, KeyboardDisplay) => {
            PairingMethod::PasskeyEntry {
                initiator_displays: true,
            }
        }
    }
}

/// Peer identity carried in a bonding record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub address: PeerAddress,
    pub irk: Option<[u8; 16]>,
}

/// Keys and identity produced by a completed pairing. Owned by the security
/// manager only for the duration of pairing, then handed to the persistence
/// collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BondingRecord {
    pub peer: PeerIdentity,
    pub ltk: [u8; 16],
    /// Legacy-path encryption identifiers; absent for the secure path
    pub ediv: Option<u16>,
    pub rand: Option<[u8; 8]>,
    pub csrk: Option<[u8; 16]>,
    /// True when an authenticated (MITM-protected) method produced the key
    pub authenticated: bool,
    pub secure: bool,
    pub key_size: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_just_works_without_mitm() {
        let method = select_method(
            true,
            IoCapability::KeyboardDisplay,
            IoCapability::KeyboardDisplay,
            false,
            false,
        );
        assert_eq!(method, PairingMethod::JustWorks);
    }

    #[test]
    fn test_no_input_no_output_selects_just_works() {
        let method = select_method(
            true,
            IoCapability::NoInputNoOutput,
            IoCapability::NoInputNoOutput,
            true,
            true,
        );
        assert_eq!(method, PairingMethod::JustWorks);
    }

    #[test]
    fn test_keyboard_display_vs_display_selects_passkey() {
        let method = select_method(
            true,
            IoCapability::KeyboardDisplay,
            IoCapability::DisplayOnly,
            true,
            true,
        );
        // The display-only side shows the passkey; the keyboard side types
        assert_eq!(
            method,
            PairingMethod::PasskeyEntry {
                initiator_displays: false,
            }
        );
    }

    #[test]
    fn test_display_yes_no_pair_selects_numeric_comparison() {
        let method = select_method(
            true,
            IoCapability::DisplayYesNo,
            IoCapability::DisplayYesNo,
            true,
            true,
        );
        assert_eq!(method, PairingMethod::NumericComparison);
    }

    #[test]
    fn test_selection_is_symmetric() {
        use IoCapability::*;
        let all = [
            DisplayOnly,
            DisplayYesNo,
            KeyboardOnly,
            NoInputNoOutput,
            KeyboardDisplay,
        ];
        for a in all {
            for b in all {
                let forward = select_method(true, a, b, true, true);
                let backward = select_method(true, b, a, true, true);
                // Same method kind either way; only the display side flips
                assert_eq!(
                    std::mem::discriminant(&forward),
                    std::mem::discriminant(&backward),
                    "asymmetric selection for {:?}/{:?}",
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn test_reason_code_roundtrip() {
        for code in [0x01, 0x04, 0x0B, 0x0C, 0x0E, 0x55] {
            assert_eq!(PairingFailedReason::from_u8(code).as_u8(), code);
        }
    }
}
