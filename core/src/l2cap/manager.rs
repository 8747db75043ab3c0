//! Channel manager — one per connection
//!
//! Owns the channel table (fixed and dynamic), allocates local channel
//! identifiers and signaling identifiers, correlates signaling responses to
//! requests, and routes inbound PDUs to the right channel.

use super::channel::{CreditChannel, PduSender};
use super::signaling::{ControlFrame, SignalingPacket};
use super::{
    ConnectionResult, L2capError, CID_ATTRIBUTE, CID_SECURITY, CID_SIGNALING, DYNAMIC_CID_END,
    DYNAMIC_CID_START, PDU_HEADER_SIZE, REJECT_COMMAND_NOT_UNDERSTOOD, REJECT_INVALID_CID,
};
use crate::config::StackConfig;
use crate::hci::ControllerLink;
use crate::types::{ConnectionHandle, LinkSecurity, SecurityLevel};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Inbound PDU consumer for a fixed channel (attribute, security).
#[async_trait]
pub trait FixedChannelSink: Send + Sync {
    async fn on_pdu(&self, pdu: Vec<u8>);
}

/// A dynamic channel opened by a remote peer, handed to the registered
/// service along with its inbound payload stream.
pub struct IncomingChannel {
    pub conn: ConnectionHandle,
    pub psm: u16,
    pub channel: Arc<CreditChannel>,
    pub rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Channel lifecycle notices surfaced to the session registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelNotice {
    Opened { cid: u16, psm: u16 },
    Closed { cid: u16, psm: u16 },
}

/// Synchronous notice delivery, so teardown ordering is preserved: every
/// channel-closed notice lands before the caller emits connection-lost.
pub type ChannelNoticeSink = Arc<dyn Fn(ChannelNotice) + Send + Sync>;

struct ServerEntry {
    required_security: SecurityLevel,
    tx: mpsc::UnboundedSender<IncomingChannel>,
}

/// Process-wide table of services accepting inbound channel-open requests,
/// keyed by protocol/service identifier. Shared by every connection.
#[derive(Default)]
pub struct ChannelServerRegistry {
    servers: Mutex<HashMap<u16, ServerEntry>>,
}

impl ChannelServerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Accept channels on `psm`, refusing peers below `required_security`.
    pub fn register(
        &self,
        psm: u16,
        required_security: SecurityLevel,
    ) -> mpsc::UnboundedReceiver<IncomingChannel> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.servers.lock().insert(
            psm,
            ServerEntry {
                required_security,
                tx,
            },
        );
        rx
    }

    fn lookup(&self, psm: u16) -> Option<(SecurityLevel, mpsc::UnboundedSender<IncomingChannel>)> {
        self.servers
            .lock()
            .get(&psm)
            .map(|entry| (entry.required_security, entry.tx.clone()))
    }
}

struct ManagerInner {
    /// Local CID -> channel
    channels: HashMap<u16, Arc<CreditChannel>>,
    /// Remote CID -> local CID (credit frames name the sender's endpoint)
    by_remote: HashMap<u16, u16>,
    /// Signaling identifier -> local CID of the open request awaiting reply
    pending_opens: HashMap<u8, u16>,
    fixed: HashMap<u16, Arc<dyn FixedChannelSink>>,
}

/// The channel multiplexer for one connection.
pub struct ChannelManager {
    io: Arc<PduSender>,
    config: StackConfig,
    security: Arc<LinkSecurity>,
    servers: Arc<ChannelServerRegistry>,
    notices: ChannelNoticeSink,
    inner: Mutex<ManagerInner>,
}

impl ChannelManager {
    pub fn new(
        link: Arc<ControllerLink>,
        conn: ConnectionHandle,
        config: StackConfig,
        security: Arc<LinkSecurity>,
        servers: Arc<ChannelServerRegistry>,
        notices: ChannelNoticeSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            io: PduSender::new(link, conn),
            config,
            security,
            servers,
            notices,
            inner: Mutex::new(ManagerInner {
                channels: HashMap::new(),
                by_remote: HashMap::new(),
                pending_opens: HashMap::new(),
                fixed: HashMap::new(),
            }),
        })
    }

    pub fn conn(&self) -> ConnectionHandle {
        self.io.conn
    }

    /// Outbound path shared with the fixed-channel protocols.
    pub fn sender(&self) -> Arc<PduSender> {
        self.io.clone()
    }

    /// Attach the protocol that consumes a fixed channel's PDUs.
    pub fn register_fixed(&self, cid: u16, sink: Arc<dyn FixedChannelSink>) {
        debug_assert!(cid == CID_ATTRIBUTE || cid == CID_SECURITY);
        self.inner.lock().fixed.insert(cid, sink);
    }

    /// Largest fragment that fits one data frame after the PDU header.
    fn clamped_mps(&self) -> u16 {
        let frame_limit = self.config.max_frame_payload.saturating_sub(PDU_HEADER_SIZE);
        let frame_limit = u16::try_from(frame_limit).unwrap_or(u16::MAX);
        self.config.channel_mps.min(frame_limit)
    }

    fn allocate_cid(inner: &ManagerInner) -> Option<u16> {
        // Smallest free identifier; the space is small enough to scan
        (DYNAMIC_CID_START..=DYNAMIC_CID_END).find(|cid| !inner.channels.contains_key(cid))
    }

    /// Open a credit-based channel to the peer's service `psm`.
    pub async fn open_channel(
        &self,
        psm: u16,
    ) -> Result<(Arc<CreditChannel>, mpsc::UnboundedReceiver<Vec<u8>>), L2capError> {
        let (channel, rx, request, waiter, identifier) = {
            let mut inner = self.inner.lock();
            let source_cid = Self::allocate_cid(&inner).ok_or(L2capError::NoFreeCid)?;
            let (channel, rx) = CreditChannel::new_initiator(
                self.io.clone(),
                psm,
                source_cid,
                self.config.channel_mtu,
                self.clamped_mps(),
                self.config.initial_credits,
                self.config.max_reassembly_size,
            );
            let identifier = self.io.next_identifier();
            let (request, waiter) = channel.begin_open(identifier)?;
            inner.channels.insert(source_cid, channel.clone());
            inner.pending_opens.insert(identifier, source_cid);
            (channel, rx, request, waiter, identifier)
        };

        self.io.send_control(request).await?;

        let result = tokio::time::timeout(self.config.request_timeout, waiter).await;
        match result {
            Ok(Ok(Ok(()))) => {
                (self.notices)(ChannelNotice::Opened {
                    cid: channel.source_cid(),
                    psm,
                });
                info!(
                    "channel 0x{:04X} open on {} (PSM 0x{:04X}, MTU {})",
                    channel.source_cid(),
                    self.io.conn,
                    psm,
                    channel.mtu()
                );
                Ok((channel, rx))
            }
            Ok(Ok(Err(err))) => {
                self.remove_channel(&channel);
                Err(err)
            }
            Ok(Err(_)) | Err(_) => {
                channel.force_close();
                self.remove_channel(&channel);
                self.inner.lock().pending_opens.remove(&identifier);
                Err(L2capError::RequestTimeout)
            }
        }
    }

    /// Disconnect a channel with the full handshake. The identifier becomes
    /// reusable once the response (or a timeout) closes it.
    pub async fn close_channel(&self, channel: &Arc<CreditChannel>) -> Result<(), L2capError> {
        let identifier = self.io.next_identifier();
        let (request, waiter) = channel.begin_disconnect(identifier)?;
        self.io.send_control(request).await?;
        if tokio::time::timeout(self.config.request_timeout, waiter)
            .await
            .is_err()
        {
            warn!(
                "no disconnection response for channel 0x{:04X}, closing anyway",
                channel.source_cid()
            );
            channel.force_close();
        }
        self.remove_and_notify(channel);
        Ok(())
    }

    /// Tear down every dynamic channel without handshakes (connection loss).
    pub fn shutdown(&self) {
        let channels: Vec<Arc<CreditChannel>> = {
            let mut inner = self.inner.lock();
            inner.by_remote.clear();
            inner.pending_opens.clear();
            inner.channels.drain().map(|(_, c)| c).collect()
        };
        for channel in channels {
            if channel.force_close() {
                (self.notices)(ChannelNotice::Closed {
                    cid: channel.source_cid(),
                    psm: channel.psm(),
                });
            }
        }
    }

    fn remove_channel(&self, channel: &Arc<CreditChannel>) -> bool {
        let mut inner = self.inner.lock();
        inner.by_remote.remove(&channel.destination_cid());
        inner.channels.remove(&channel.source_cid()).is_some()
    }

    fn remove_and_notify(&self, channel: &Arc<CreditChannel>) {
        if self.remove_channel(channel) {
            (self.notices)(ChannelNotice::Closed {
                cid: channel.source_cid(),
                psm: channel.psm(),
            });
        }
    }

    /// Route one inbound data-frame payload: `[len u16][cid u16][pdu]`.
    pub async fn on_data(&self, payload: &[u8]) {
        if payload.len() < PDU_HEADER_SIZE {
            warn!("data frame shorter than the PDU header, dropping");
            return;
        }
        let declared = u16::from_le_bytes([payload[0], payload[1]]) as usize;
        let cid = u16::from_le_bytes([payload[2], payload[3]]);
        let pdu = &payload[PDU_HEADER_SIZE..];
        if pdu.len() != declared {
            warn!(
                "PDU length mismatch on CID 0x{:04X}: declared {}, got {}",
                cid,
                declared,
                pdu.len()
            );
            return;
        }

        if cid == CID_SIGNALING {
            self.on_signaling(pdu).await;
            return;
        }

        let fixed = self.inner.lock().fixed.get(&cid).cloned();
        if let Some(sink) = fixed {
            sink.on_pdu(pdu.to_vec()).await;
            return;
        }

        let channel = self.inner.lock().channels.get(&cid).cloned();
        match channel {
            Some(channel) => match channel.on_pdu(pdu).await {
                Ok(()) => {}
                Err(L2capError::PayloadTooLarge { size, max }) => {
                    // The declared payload is oversized: drop the message,
                    // keep the channel usable
                    warn!(
                        "dropping oversized payload on CID 0x{:04X}: {} bytes (max {})",
                        cid, size, max
                    );
                }
                Err(err) => {
                    // Corrupt reassembly state: disconnect the channel, not
                    // the connection. The response can't be awaited here —
                    // this runs on the dispatch task that would deliver it.
                    warn!("closing channel 0x{:04X}: {}", cid, err);
                    let identifier = self.io.next_identifier();
                    if let Ok((request, _waiter)) = channel.begin_disconnect(identifier) {
                        let _ = self.io.send_control(request).await;
                    }
                    channel.force_close();
                    self.remove_and_notify(&channel);
                }
            },
            None => warn!("PDU for unknown CID 0x{:04X}, dropping", cid),
        }
    }

    async fn on_signaling(&self, pdu: &[u8]) {
        let packet = match SignalingPacket::from_bytes(pdu) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("rejecting control frame: {}", err);
                let identifier = if pdu.len() >= 2 { pdu[1] } else { 0 };
                let reject = SignalingPacket::new(
                    identifier,
                    ControlFrame::CommandReject {
                        reason: REJECT_COMMAND_NOT_UNDERSTOOD,
                        data: Vec::new(),
                    },
                );
                let _ = self.io.send_control(reject).await;
                return;
            }
        };

        match packet.frame {
            ControlFrame::CreditConnectionRequest {
                psm,
                source_cid,
                mtu,
                mps,
                initial_credits,
            } => {
                self.on_open_request(packet.identifier, psm, source_cid, mtu, mps, initial_credits)
                    .await;
            }
            ControlFrame::CreditConnectionResponse { .. } => {
                let channel = {
                    let mut inner = self.inner.lock();
                    inner
                        .pending_opens
                        .remove(&packet.identifier)
                        .and_then(|cid| inner.channels.get(&cid).cloned())
                };
                match channel {
                    Some(channel) => {
                        channel.on_open_response(&packet.frame);
                        if channel.state() == super::ChannelState::Open {
                            // Map the peer's endpoint before any credit
                            // frame can race the opener's task
                            let mut inner = self.inner.lock();
                            inner
                                .by_remote
                                .insert(channel.destination_cid(), channel.source_cid());
                        }
                    }
                    None => warn!(
                        "configuration response for unknown request (id {})",
                        packet.identifier
                    ),
                }
            }
            ControlFrame::FlowControlCredit { cid, credits } => {
                let channel = {
                    let inner = self.inner.lock();
                    inner
                        .by_remote
                        .get(&cid)
                        .and_then(|local| inner.channels.get(local).cloned())
                };
                match channel {
                    Some(channel) => channel.on_credits(credits),
                    None => warn!("credits for unknown remote CID 0x{:04X}", cid),
                }
            }
            ControlFrame::DisconnectionRequest {
                destination_cid,
                source_cid,
            } => {
                let channel = self.inner.lock().channels.get(&destination_cid).cloned();
                match channel {
                    Some(channel) if channel.destination_cid() == source_cid => {
                        let response = channel.on_disconnection_request(packet.identifier);
                        let _ = self.io.send_control(response).await;
                        self.remove_and_notify(&channel);
                    }
                    _ => {
                        warn!(
                            "disconnection request for unknown channel pair \
                             (0x{:04X}, 0x{:04X})",
                            destination_cid, source_cid
                        );
                        let reject = SignalingPacket::new(
                            packet.identifier,
                            ControlFrame::CommandReject {
                                reason: REJECT_INVALID_CID,
                                data: Vec::new(),
                            },
                        );
                        let _ = self.io.send_control(reject).await;
                    }
                }
            }
            ControlFrame::DisconnectionResponse {
                destination_cid,
                source_cid,
            } => {
                let channel = self.inner.lock().channels.get(&source_cid).cloned();
                match channel {
                    Some(channel) => {
                        channel.on_disconnection_response(destination_cid, source_cid);
                        if channel.state() == super::ChannelState::Closed {
                            self.remove_and_notify(&channel);
                        }
                    }
                    None => warn!("disconnection response for unknown channel"),
                }
            }
            ControlFrame::EchoRequest { data } => {
                let response =
                    SignalingPacket::new(packet.identifier, ControlFrame::EchoResponse { data });
                let _ = self.io.send_control(response).await;
            }
            ControlFrame::EchoResponse { .. } => {
                debug!("echo response (id {})", packet.identifier);
            }
            ControlFrame::CommandReject { reason, .. } => {
                warn!(
                    "peer rejected signaling command (id {}, reason 0x{:04X})",
                    packet.identifier, reason
                );
                let channel = {
                    let mut inner = self.inner.lock();
                    inner
                        .pending_opens
                        .remove(&packet.identifier)
                        .and_then(|cid| inner.channels.get(&cid).cloned())
                };
                if let Some(channel) = channel {
                    // Treat a rejected open request as a refusal
                    channel.on_open_response(&ControlFrame::CreditConnectionResponse {
                        destination_cid: 0,
                        mtu: 0,
                        mps: 0,
                        initial_credits: 0,
                        result: ConnectionResult::NoResources as u16,
                    });
                    self.remove_channel(&channel);
                }
            }
        }
    }

    async fn on_open_request(
        &self,
        identifier: u8,
        psm: u16,
        remote_cid: u16,
        peer_mtu: u16,
        peer_mps: u16,
        peer_credits: u16,
    ) {
        let refuse = |result: ConnectionResult| {
            SignalingPacket::new(
                identifier,
                ControlFrame::CreditConnectionResponse {
                    destination_cid: 0,
                    mtu: self.config.channel_mtu,
                    mps: self.clamped_mps(),
                    initial_credits: 0,
                    result: result as u16,
                },
            )
        };

        let Some((required_security, server_tx)) = self.servers.lookup(psm) else {
            info!("no service on PSM 0x{:04X} for {}", psm, self.io.conn);
            let _ = self.io.send_control(refuse(ConnectionResult::PsmNotSupported)).await;
            return;
        };

        if self.security.level() < required_security {
            let result = match required_security {
                SecurityLevel::Authenticated => ConnectionResult::InsufficientAuthentication,
                _ => ConnectionResult::InsufficientEncryption,
            };
            info!(
                "refusing PSM 0x{:04X} open on {}: security {} < {}",
                psm,
                self.io.conn,
                self.security.level(),
                required_security
            );
            let _ = self.io.send_control(refuse(result)).await;
            return;
        }

        if remote_cid == 0 {
            let _ = self.io.send_control(refuse(ConnectionResult::InvalidSourceCid)).await;
            return;
        }

        let outcome = {
            let mut inner = self.inner.lock();
            if inner.by_remote.contains_key(&remote_cid) {
                warn!("remote CID 0x{:04X} already in use", remote_cid);
                Err(ConnectionResult::SourceCidAlreadyAllocated)
            } else if let Some(local_cid) = Self::allocate_cid(&inner) {
                let local_mtu = self.config.channel_mtu;
                let local_mps = self.clamped_mps();
                let (channel, rx) = CreditChannel::new_accepted(
                    self.io.clone(),
                    psm,
                    local_cid,
                    remote_cid,
                    local_mtu.min(peer_mtu),
                    local_mps.min(peer_mps),
                    peer_credits,
                    self.config.initial_credits,
                    self.config.max_reassembly_size,
                );
                inner.channels.insert(local_cid, channel.clone());
                inner.by_remote.insert(remote_cid, local_cid);
                let response = SignalingPacket::new(
                    identifier,
                    ControlFrame::CreditConnectionResponse {
                        destination_cid: local_cid,
                        mtu: local_mtu,
                        mps: local_mps,
                        initial_credits: self.config.initial_credits,
                        result: ConnectionResult::Success as u16,
                    },
                );
                Ok((channel, rx, response))
            } else {
                Err(ConnectionResult::NoResources)
            }
        };

        let (channel, rx, response) = match outcome {
            Ok(triple) => triple,
            Err(result) => {
                let _ = self.io.send_control(refuse(result)).await;
                return;
            }
        };

        let _ = self.io.send_control(response).await;
        info!(
            "accepted channel 0x{:04X} on {} (PSM 0x{:04X}, MTU {})",
            channel.source_cid(),
            self.io.conn,
            psm,
            channel.mtu()
        );
        (self.notices)(ChannelNotice::Opened {
            cid: channel.source_cid(),
            psm,
        });
        let _ = server_tx.send(IncomingChannel {
            conn: self.io.conn,
            psm,
            channel,
            rx,
        });
    }
}
