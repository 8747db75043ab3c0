//! Session registry and per-connection wiring
//!
//! The `Host` owns the only process-wide mutable state: the table mapping
//! connection handles to live connection contexts. Each context exclusively
//! owns its channel multiplexer, attribute bearer, and security manager;
//! everything is driven serialized from the controller link's dispatch, so
//! no context is ever touched concurrently from two connections' processing.

use crate::att::{AttBearer, AttributeClient, AttributeServer, AttributeUpdate, ServerSession};
use crate::config::{ConfigError, StackConfig, ATT_MIN_MTU};
use crate::hci::{
    ControllerLink, Event, HciError, LinkClient, CMD_DISCONNECT, CMD_START_ENCRYPTION,
    EVT_ENCRYPTION_CHANGE, STATUS_SUCCESS,
};
use crate::l2cap::manager::ChannelNotice;
use crate::l2cap::{ChannelManager, ChannelServerRegistry, FixedChannelSink, IncomingChannel};
use crate::smp::pairing::{AutoAcceptDelegate, SecurityNotice};
use crate::smp::{BondingRecord, PairingDelegate, SecurityManager, SmpError};
use crate::types::{ConnectionHandle, LinkSecurity, PeerAddress, Role, SecurityLevel};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::AtomicU16;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Host-level errors for operations on the session registry.
#[derive(Debug, Error, Clone)]
pub enum HostError {
    #[error("No connection with handle {0}")]
    NoSuchConnection(ConnectionHandle),

    #[error("No stored bond for this peer")]
    NoStoredBond,

    #[error("Only the connection initiator may start encryption")]
    NotInitiator,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Hci(#[from] HciError),
}

/// Events delivered upward to the application/profile layer, ordered per
/// connection.
#[derive(Debug, Clone)]
pub enum StackEvent {
    ConnectionEstablished {
        conn: ConnectionHandle,
        peer: PeerAddress,
        role: Role,
    },
    ConnectionLost {
        conn: ConnectionHandle,
        reason: u8,
    },
    ChannelOpened {
        conn: ConnectionHandle,
        cid: u16,
        psm: u16,
    },
    ChannelClosed {
        conn: ConnectionHandle,
        cid: u16,
        psm: u16,
    },
    AttributeChanged {
        conn: ConnectionHandle,
        handle: u16,
        value: Vec<u8>,
        indicated: bool,
    },
    PairingCompleted {
        conn: ConnectionHandle,
        authenticated: bool,
    },
    PairingFailed {
        conn: ConnectionHandle,
        error: SmpError,
    },
}

/// Publish/subscribe fan-out for stack events. Emission is synchronous, so
/// per-connection ordering follows processing order exactly.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<StackEvent>>>,
}

impl EventBus {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StackEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: StackEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Persistence boundary for bonding records. The core calls this at pairing
/// completion and at connection establishment; it never touches storage
/// itself.
#[async_trait]
pub trait BondingStore: Send + Sync {
    async fn load(&self, peer: &PeerAddress) -> Option<BondingRecord>;
    async fn store(&self, record: BondingRecord);
    async fn delete(&self, peer: &PeerAddress);
}

/// In-memory store, for tests and ephemeral embedders.
#[derive(Default)]
pub struct MemoryBondingStore {
    records: Mutex<HashMap<PeerAddress, BondingRecord>>,
}

impl MemoryBondingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl BondingStore for MemoryBondingStore {
    async fn load(&self, peer: &PeerAddress) -> Option<BondingRecord> {
        self.records.lock().get(peer).cloned()
    }

    async fn store(&self, record: BondingRecord) {
        self.records.lock().insert(record.peer.address, record);
    }

    async fn delete(&self, peer: &PeerAddress) {
        self.records.lock().remove(peer);
    }
}

/// Everything owned by one live connection.
pub struct ConnectionContext {
    pub handle: ConnectionHandle,
    pub peer_address: PeerAddress,
    pub role: Role,
    pub security: Arc<LinkSecurity>,
    pub channels: Arc<ChannelManager>,
    pub smp: Arc<SecurityManager>,
    pub att_client: Arc<AttributeClient>,
    pub att_server: Arc<ServerSession>,
    stored_bond: Mutex<Option<BondingRecord>>,
}

impl ConnectionContext {
    /// The bond loaded from the persistence collaborator at connection
    /// establishment, if the peer was known.
    pub fn stored_bond(&self) -> Option<BondingRecord> {
        self.stored_bond.lock().clone()
    }
}

/// Routes security-channel PDUs into the pairing state machine.
struct SecurityChannelSink(Arc<SecurityManager>);

#[async_trait]
impl FixedChannelSink for SecurityChannelSink {
    async fn on_pdu(&self, pdu: Vec<u8>) {
        self.0.handle_pdu(&pdu).await;
    }
}

/// The session registry: one per controller link.
pub struct Host {
    link: Arc<ControllerLink>,
    config: StackConfig,
    local_address: PeerAddress,
    events: Arc<EventBus>,
    attributes: Arc<AttributeServer>,
    channel_servers: Arc<ChannelServerRegistry>,
    bond_store: Arc<dyn BondingStore>,
    delegate: Arc<dyn PairingDelegate>,
    connections: Mutex<HashMap<ConnectionHandle, Arc<ConnectionContext>>>,
}

impl Host {
    /// Create the host and attach it to the link's dispatch.
    pub fn new(
        link: Arc<ControllerLink>,
        config: StackConfig,
        local_address: PeerAddress,
        bond_store: Arc<dyn BondingStore>,
        delegate: Option<Arc<dyn PairingDelegate>>,
    ) -> Result<Arc<Self>, HostError> {
        config.validate()?;
        let host = Arc::new(Self {
            link: link.clone(),
            config,
            local_address,
            events: Arc::new(EventBus::default()),
            attributes: AttributeServer::new(),
            channel_servers: ChannelServerRegistry::new(),
            bond_store,
            delegate: delegate.unwrap_or_else(|| Arc::new(AutoAcceptDelegate)),
            connections: Mutex::new(HashMap::new()),
        });
        link.set_client(host.clone());
        Ok(host)
    }

    /// Subscribe to the upward event surface.
    pub fn events(&self) -> mpsc::UnboundedReceiver<StackEvent> {
        self.events.subscribe()
    }

    /// The local attribute table, shared by every connection.
    pub fn attributes(&self) -> Arc<AttributeServer> {
        self.attributes.clone()
    }

    /// Accept inbound channel-open requests on a service identifier.
    pub fn register_channel_server(
        &self,
        psm: u16,
        required_security: SecurityLevel,
    ) -> mpsc::UnboundedReceiver<IncomingChannel> {
        self.channel_servers.register(psm, required_security)
    }

    pub fn connection(&self, handle: ConnectionHandle) -> Option<Arc<ConnectionContext>> {
        self.connections.lock().get(&handle).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Ask the controller to disconnect. Teardown happens when the
    /// disconnection-complete event arrives.
    pub async fn disconnect(&self, handle: ConnectionHandle, reason: u8) -> Result<(), HostError> {
        let mut params = Vec::with_capacity(3);
        params.extend_from_slice(&handle.0.to_le_bytes());
        params.push(reason);
        self.link.send_command(CMD_DISCONNECT, &params).await?;
        Ok(())
    }

    /// Re-encrypt with a previously stored bond instead of re-pairing.
    /// Resolves once the encryption-change event lands and the connection's
    /// security level has risen.
    pub async fn start_encryption(&self, handle: ConnectionHandle) -> Result<(), HostError> {
        let ctx = self
            .connection(handle)
            .ok_or(HostError::NoSuchConnection(handle))?;
        if ctx.role != Role::Initiator {
            return Err(HostError::NotInitiator);
        }
        let record = ctx.stored_bond().ok_or(HostError::NoStoredBond)?;

        // Listen before issuing the command so the event can't slip past
        let mut changes = self.link.register_listener(Some(EVT_ENCRYPTION_CHANGE));

        // handle(2) rand(8) ediv(2) ltk(16)
        let mut params = Vec::with_capacity(28);
        params.extend_from_slice(&handle.0.to_le_bytes());
        params.extend_from_slice(&record.rand.unwrap_or_default());
        params.extend_from_slice(&record.ediv.unwrap_or_default().to_le_bytes());
        params.extend_from_slice(&record.ltk);
        self.link.send_command(CMD_START_ENCRYPTION, &params).await?;

        // The status event only acknowledges the command; encryption is up
        // when the change event for this handle arrives
        let outcome = tokio::time::timeout(self.config.command_timeout, async {
            while let Some(event) = changes.recv().await {
                if let Event::EncryptionChange {
                    status,
                    handle: changed,
                    enabled,
                } = event
                {
                    if changed == handle {
                        return Some((status, enabled));
                    }
                }
            }
            None
        })
        .await;

        match outcome {
            Ok(Some((STATUS_SUCCESS, true))) => Ok(()),
            Ok(Some((status, _))) => Err(HostError::Hci(HciError::CommandFailed {
                opcode: CMD_START_ENCRYPTION,
                status,
            })),
            Ok(None) => Err(HostError::Hci(HciError::LinkLost)),
            Err(_) => Err(HostError::Hci(HciError::CommandTimeout {
                opcode: CMD_START_ENCRYPTION,
            })),
        }
    }

    async fn add_connection(&self, handle: ConnectionHandle, peer: PeerAddress, role: Role) {
        if self.connections.lock().contains_key(&handle) {
            warn!("connection complete for live handle {}, ignoring", handle);
            return;
        }
        info!("connection {} established with {} as {}", handle, peer, role);

        let security = Arc::new(LinkSecurity::new());
        let events = self.events.clone();
        let channel_notices: crate::l2cap::manager::ChannelNoticeSink = {
            let events = events.clone();
            Arc::new(move |notice| {
                events.emit(match notice {
                    ChannelNotice::Opened { cid, psm } => StackEvent::ChannelOpened {
                        conn: handle,
                        cid,
                        psm,
                    },
                    ChannelNotice::Closed { cid, psm } => StackEvent::ChannelClosed {
                        conn: handle,
                        cid,
                        psm,
                    },
                })
            })
        };
        let channels = ChannelManager::new(
            self.link.clone(),
            handle,
            self.config.clone(),
            security.clone(),
            self.channel_servers.clone(),
            channel_notices,
        );

        let io = channels.sender();
        let mtu = Arc::new(AtomicU16::new(ATT_MIN_MTU));
        let update_sink: crate::att::client::AttributeUpdateSink = {
            let events = events.clone();
            Arc::new(move |update: AttributeUpdate| {
                events.emit(StackEvent::AttributeChanged {
                    conn: update.conn,
                    handle: update.handle,
                    value: update.value,
                    indicated: update.indicated,
                })
            })
        };
        let att_client = AttributeClient::new(
            io.clone(),
            mtu.clone(),
            self.config.att_mtu,
            self.config.request_timeout,
            update_sink,
        );
        let att_server = ServerSession::new(
            self.attributes.clone(),
            io.clone(),
            security.clone(),
            mtu,
            self.config.att_mtu,
            self.config.request_timeout,
        );
        channels.register_fixed(
            crate::l2cap::CID_ATTRIBUTE,
            Arc::new(AttBearer {
                server: att_server.clone(),
                client: att_client.clone(),
            }),
        );

        let security_notices: crate::smp::pairing::SecurityNoticeSink = {
            let events = events.clone();
            Arc::new(move |notice| {
                events.emit(match notice {
                    SecurityNotice::Completed { authenticated } => StackEvent::PairingCompleted {
                        conn: handle,
                        authenticated,
                    },
                    SecurityNotice::Failed { error } => StackEvent::PairingFailed {
                        conn: handle,
                        error,
                    },
                })
            })
        };
        let smp = SecurityManager::new(
            io,
            self.config.clone(),
            role,
            self.local_address,
            peer,
            security.clone(),
            self.delegate.clone(),
            self.bond_store.clone(),
            security_notices,
        );
        channels.register_fixed(
            crate::l2cap::CID_SECURITY,
            Arc::new(SecurityChannelSink(smp.clone())),
        );

        // A known peer's keys are pre-armed for encryption without
        // re-pairing
        let stored = self.bond_store.load(&peer).await;
        if stored.is_some() {
            debug!("found stored bond for {}", peer);
        }

        let ctx = Arc::new(ConnectionContext {
            handle,
            peer_address: peer,
            role,
            security,
            channels,
            smp,
            att_client,
            att_server,
            stored_bond: Mutex::new(stored),
        });
        self.connections.lock().insert(handle, ctx);
        self.events.emit(StackEvent::ConnectionEstablished {
            conn: handle,
            peer,
            role,
        });
    }

    async fn remove_connection(&self, handle: ConnectionHandle, reason: u8) {
        let Some(ctx) = self.connections.lock().remove(&handle) else {
            warn!("disconnection for unknown handle {}", handle);
            return;
        };
        info!("connection {} lost (reason 0x{:02X})", handle, reason);

        // Channels close (and report) before the connection-lost event;
        // every outstanding waiter resolves with an error
        ctx.channels.shutdown();
        ctx.att_client
            .fail_pending(crate::att::AttError::Closed);
        ctx.att_server.fail_pending();
        ctx.smp.handle_disconnect().await;

        self.events
            .emit(StackEvent::ConnectionLost { conn: handle, reason });
    }
}

#[async_trait]
impl LinkClient for Host {
    async fn on_event(&self, event: Event) {
        match event {
            Event::ConnectionComplete {
                status,
                handle,
                peer_address,
                role,
            } => {
                if status == STATUS_SUCCESS {
                    self.add_connection(handle, peer_address, role).await;
                } else {
                    debug!("connection attempt failed with status 0x{:02X}", status);
                }
            }
            Event::DisconnectionComplete {
                status,
                handle,
                reason,
            } => {
                if status == STATUS_SUCCESS {
                    self.remove_connection(handle, reason).await;
                }
            }
            Event::EncryptionChange {
                status,
                handle,
                enabled,
            } => {
                let Some(ctx) = self.connection(handle) else {
                    return;
                };
                if status != STATUS_SUCCESS {
                    warn!(
                        "encryption change failed on {} (status 0x{:02X})",
                        handle, status
                    );
                    return;
                }
                let level = if !enabled {
                    SecurityLevel::Open
                } else if ctx.stored_bond().is_some_and(|bond| bond.authenticated) {
                    SecurityLevel::Authenticated
                } else {
                    SecurityLevel::Encrypted
                };
                debug!("connection {} security level now {}", handle, level);
                ctx.security.set_level(level);
            }
            other => {
                debug!("unhandled controller event 0x{:02X}", other.code());
            }
        }
    }

    async fn on_data(&self, handle: ConnectionHandle, payload: Vec<u8>) {
        match self.connection(handle) {
            Some(ctx) => ctx.channels.on_data(&payload).await,
            None => warn!("data for unknown connection {}", handle),
        }
    }

    async fn on_link_lost(&self) {
        let handles: Vec<ConnectionHandle> = self.connections.lock().keys().copied().collect();
        for handle in handles {
            // Transport loss has no controller reason code; report it as a
            // connection-timeout class failure
            self.remove_connection(handle, 0x08).await;
        }
    }
}
