// BlueHost Core — host-side short-range wireless protocol engine
//
// Usable against real controllers or in-process virtual ones. The layers,
// leaf to root: frame codec and controller link (hci), channel multiplexer
// (l2cap), attribute exchange (att), security manager (smp), and the
// session registry (host) that owns one context per live connection.
//
// Everything is driven by whoever feeds the link inbound bytes; waiting
// always means yielding, never blocking the dispatch context.

pub mod att;
pub mod config;
pub mod hci;
pub mod host;
pub mod l2cap;
pub mod smp;
pub mod transport;
pub mod types;

use thiserror::Error;

pub use att::{AttError, AttPdu, AttUuid, Attribute, AttributePermissions, AttributeServer};
pub use config::{ConfigError, StackConfig};
pub use hci::{ControllerLink, Event, FrameCodec, FrameError, HciError, Packet};
pub use host::{
    BondingStore, ConnectionContext, Host, HostError, MemoryBondingStore, StackEvent,
};
pub use l2cap::{ChannelState, CreditChannel, L2capError};
pub use smp::{BondingRecord, IoCapability, PairingDelegate, SmpError};
pub use transport::{PipeTransport, Transport, TransportError};
pub use types::{ConnectionHandle, PeerAddress, Role, SecurityLevel};

/// Catch-all error for embedders that want a single type across the stack.
/// Each layer keeps its own error enum; this only aggregates them.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Framing(#[from] FrameError),
    #[error(transparent)]
    Hci(#[from] HciError),
    #[error(transparent)]
    L2cap(#[from] L2capError),
    #[error(transparent)]
    Att(#[from] AttError),
    #[error(transparent)]
    Smp(#[from] SmpError),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
