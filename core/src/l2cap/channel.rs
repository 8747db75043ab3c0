//! Credit-based channel — lifecycle state machine, segmentation/reassembly,
//! and credit flow control
//!
//! Outbound payloads are split into fragments of at most the negotiated MPS;
//! the first fragment carries a total-length prefix so the receiver knows
//! when reassembly is complete. Each fragment costs one credit; a sender
//! with no credits suspends until the peer grants more. Exhaustion is
//! backpressure, not an error.

use super::signaling::{ControlFrame, SignalingPacket};
use super::{L2capError, SDU_LENGTH_PREFIX_SIZE};
use crate::hci::ControllerLink;
use crate::types::ConnectionHandle;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

/// Lifecycle of a dynamic channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not yet opened, or fully torn down
    Closed,
    /// Open request sent, awaiting the peer's configuration response
    ConfigRequested,
    /// Configured and carrying data
    Open,
    /// Disconnect request sent, awaiting the response
    Disconnecting,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Closed => write!(f, "Closed"),
            ChannelState::ConfigRequested => write!(f, "ConfigRequested"),
            ChannelState::Open => write!(f, "Open"),
            ChannelState::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Shared outbound path for one connection: data PDUs and signaling frames.
///
/// Channels and the manager both send through this; it also hands out
/// signaling identifiers (1..=255, wrapping, never 0).
pub struct PduSender {
    pub link: Arc<ControllerLink>,
    pub conn: ConnectionHandle,
    next_identifier: AtomicU8,
}

impl std::fmt::Debug for PduSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PduSender")
            .field("conn", &self.conn)
            .field("next_identifier", &self.next_identifier)
            .finish_non_exhaustive()
    }
}

impl PduSender {
    pub fn new(link: Arc<ControllerLink>, conn: ConnectionHandle) -> Arc<Self> {
        Arc::new(Self {
            link,
            conn,
            next_identifier: AtomicU8::new(1),
        })
    }

    pub fn next_identifier(&self) -> u8 {
        loop {
            let id = self.next_identifier.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Send one channel PDU: `[len u16][cid u16][payload]`.
    pub async fn send_pdu(&self, cid: u16, payload: &[u8]) -> Result<(), L2capError> {
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(&cid.to_le_bytes());
        frame.extend_from_slice(payload);
        self.link.send_data(self.conn, frame).await?;
        Ok(())
    }

    pub async fn send_control(&self, packet: SignalingPacket) -> Result<(), L2capError> {
        self.send_pdu(super::CID_SIGNALING, &packet.to_bytes()).await
    }
}

/// Split an SDU into MPS-sized fragments, length prefix in the first.
pub fn segment_sdu(data: &[u8], mps: u16) -> Vec<Vec<u8>> {
    let mut sdu = Vec::with_capacity(SDU_LENGTH_PREFIX_SIZE + data.len());
    sdu.extend_from_slice(&(data.len() as u16).to_le_bytes());
    sdu.extend_from_slice(data);
    sdu.chunks(mps as usize).map(|chunk| chunk.to_vec()).collect()
}

#[derive(Debug)]
struct ChannelInner {
    state: ChannelState,
    psm: u16,
    source_cid: u16,
    destination_cid: u16,
    /// Largest SDU either side may send (min of both proposals once open)
    mtu: u16,
    /// Largest fragment either side may send (min of both proposals)
    mps: u16,
    /// Credits we may spend sending fragments
    tx_credits: u16,
    /// Credits the peer still holds against us
    peer_credits: u16,
    initial_peer_credits: u16,
    rx_sdu: Option<Vec<u8>>,
    rx_sdu_len: usize,
    max_reassembly: usize,
    incoming: Option<mpsc::UnboundedSender<Vec<u8>>>,
    open_waiter: Option<oneshot::Sender<Result<(), L2capError>>>,
    disconnect_waiter: Option<oneshot::Sender<()>>,
}

/// One credit-based logical channel over a connection.
#[derive(Debug)]
pub struct CreditChannel {
    io: Arc<PduSender>,
    inner: Mutex<ChannelInner>,
    credit_granted: Notify,
    /// Serializes senders so one SDU's fragments never interleave another's
    send_lock: tokio::sync::Mutex<()>,
}

impl CreditChannel {
    /// Create the initiator side; `open` completes the handshake.
    #[allow(clippy::too_many_arguments)]
    pub fn new_initiator(
        io: Arc<PduSender>,
        psm: u16,
        source_cid: u16,
        mtu: u16,
        mps: u16,
        initial_peer_credits: u16,
        max_reassembly: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            io,
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Closed,
                psm,
                source_cid,
                destination_cid: 0,
                mtu,
                mps,
                tx_credits: 0,
                peer_credits: initial_peer_credits,
                initial_peer_credits,
                rx_sdu: None,
                rx_sdu_len: 0,
                max_reassembly,
                incoming: Some(tx),
                open_waiter: None,
                disconnect_waiter: None,
            }),
            credit_granted: Notify::new(),
            send_lock: tokio::sync::Mutex::new(()),
        });
        (channel, rx)
    }

    /// Create the responder side, already configured by the peer's request.
    #[allow(clippy::too_many_arguments)]
    pub fn new_accepted(
        io: Arc<PduSender>,
        psm: u16,
        source_cid: u16,
        destination_cid: u16,
        mtu: u16,
        mps: u16,
        tx_credits: u16,
        initial_peer_credits: u16,
        max_reassembly: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            io,
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Open,
                psm,
                source_cid,
                destination_cid,
                mtu,
                mps,
                tx_credits,
                peer_credits: initial_peer_credits,
                initial_peer_credits,
                rx_sdu: None,
                rx_sdu_len: 0,
                max_reassembly,
                incoming: Some(tx),
                open_waiter: None,
                disconnect_waiter: None,
            }),
            credit_granted: Notify::new(),
            send_lock: tokio::sync::Mutex::new(()),
        });
        (channel, rx)
    }

    pub fn state(&self) -> ChannelState {
        self.inner.lock().state
    }

    pub fn source_cid(&self) -> u16 {
        self.inner.lock().source_cid
    }

    pub fn destination_cid(&self) -> u16 {
        self.inner.lock().destination_cid
    }

    pub fn psm(&self) -> u16 {
        self.inner.lock().psm
    }

    /// Effective (negotiated) MTU. Meaningful once open.
    pub fn mtu(&self) -> u16 {
        self.inner.lock().mtu
    }

    /// Credits currently available for sending.
    pub fn tx_credits(&self) -> u16 {
        self.inner.lock().tx_credits
    }

    fn change_state(inner: &mut ChannelInner, new_state: ChannelState) {
        debug!(
            "channel 0x{:04X} state change {} -> {}",
            inner.source_cid, inner.state, new_state
        );
        inner.state = new_state;
    }

    /// Begin the open handshake: transition to ConfigRequested and produce
    /// the request frame. The manager correlates the response by identifier.
    pub fn begin_open(
        &self,
        identifier: u8,
    ) -> Result<(SignalingPacket, oneshot::Receiver<Result<(), L2capError>>), L2capError> {
        let mut inner = self.inner.lock();
        if inner.state != ChannelState::Closed {
            return Err(L2capError::InvalidState("channel already opening or open"));
        }
        Self::change_state(&mut inner, ChannelState::ConfigRequested);
        let (tx, rx) = oneshot::channel();
        inner.open_waiter = Some(tx);
        let request = SignalingPacket::new(
            identifier,
            ControlFrame::CreditConnectionRequest {
                psm: inner.psm,
                source_cid: inner.source_cid,
                mtu: inner.mtu,
                mps: inner.mps,
                initial_credits: inner.initial_peer_credits,
            },
        );
        Ok((request, rx))
    }

    /// Apply the peer's configuration response.
    pub fn on_open_response(&self, frame: &ControlFrame) {
        let ControlFrame::CreditConnectionResponse {
            destination_cid,
            mtu,
            mps,
            initial_credits,
            result,
        } = frame
        else {
            return;
        };
        let waiter = {
            let mut inner = self.inner.lock();
            if inner.state != ChannelState::ConfigRequested {
                warn!("unexpected configuration response in state {}", inner.state);
                return;
            }
            match super::ConnectionResult::from_u16(*result) {
                Some(super::ConnectionResult::Success) => {
                    inner.destination_cid = *destination_cid;
                    // Both sides converge on the minimum of the proposals
                    inner.mtu = inner.mtu.min(*mtu);
                    inner.mps = inner.mps.min(*mps);
                    inner.tx_credits = *initial_credits;
                    Self::change_state(&mut inner, ChannelState::Open);
                    inner.open_waiter.take().map(|w| (w, Ok(())))
                }
                Some(refusal) => {
                    Self::change_state(&mut inner, ChannelState::Closed);
                    inner.incoming = None;
                    inner
                        .open_waiter
                        .take()
                        .map(|w| (w, Err(L2capError::ChannelRefused(refusal))))
                }
                None => {
                    Self::change_state(&mut inner, ChannelState::Closed);
                    inner.incoming = None;
                    inner.open_waiter.take().map(|w| {
                        (
                            w,
                            Err(L2capError::ChannelRefused(
                                super::ConnectionResult::NoResources,
                            )),
                        )
                    })
                }
            }
        };
        if let Some((waiter, result)) = waiter {
            let _ = waiter.send(result);
        }
    }

    /// Send one payload, fragmenting and consuming one credit per fragment.
    ///
    /// Suspends while the credit count is zero; a credit grant resumes it.
    /// Concurrent senders are serialized so fragments never interleave.
    pub async fn send(&self, data: &[u8]) -> Result<(), L2capError> {
        let _guard = self.send_lock.lock().await;

        let (destination_cid, mps) = {
            let inner = self.inner.lock();
            if inner.state != ChannelState::Open {
                return Err(L2capError::ChannelClosed);
            }
            if data.len() > inner.mtu as usize {
                return Err(L2capError::SduTooLarge {
                    size: data.len(),
                    mtu: inner.mtu,
                });
            }
            (inner.destination_cid, inner.mps)
        };

        for fragment in segment_sdu(data, mps) {
            // One credit per fragment; zero credits means wait, not fail
            loop {
                let notified = self.credit_granted.notified();
                {
                    let mut inner = self.inner.lock();
                    if inner.state != ChannelState::Open {
                        return Err(L2capError::ChannelClosed);
                    }
                    if inner.tx_credits > 0 {
                        inner.tx_credits -= 1;
                        break;
                    }
                    debug!(
                        "channel 0x{:04X} out of credits, sender waiting",
                        inner.source_cid
                    );
                }
                notified.await;
            }
            self.io.send_pdu(destination_cid, &fragment).await?;
        }
        Ok(())
    }

    /// Accept one inbound fragment; reassemble and deliver complete SDUs.
    ///
    /// Credit bookkeeping happens even when the fragment is discarded, so a
    /// dropped message never strands the peer's flow control.
    pub async fn on_pdu(&self, pdu: &[u8]) -> Result<(), L2capError> {
        let (result, top_up) = {
            let mut inner = self.inner.lock();
            if inner.state != ChannelState::Open {
                warn!(
                    "fragment on channel 0x{:04X} in state {}, dropping",
                    inner.source_cid, inner.state
                );
                return Ok(());
            }

            // Peer credit bookkeeping: each accepted fragment consumes one;
            // top the peer back up once half the grant is spent.
            let top_up = if inner.peer_credits == 0 {
                warn!(
                    "fragment on channel 0x{:04X} with no peer credits",
                    inner.source_cid
                );
                None
            } else {
                inner.peer_credits -= 1;
                if inner.peer_credits <= inner.initial_peer_credits / 2 {
                    let grant = inner.initial_peer_credits - inner.peer_credits;
                    inner.peer_credits = inner.initial_peer_credits;
                    Some((inner.source_cid, grant))
                } else {
                    None
                }
            };

            let result = Self::reassemble(&mut inner, pdu).map(|sdu| {
                sdu.and_then(|sdu| inner.incoming.as_ref().map(|tx| (tx.clone(), sdu)))
            });
            (result, top_up)
        };

        if let Some((cid, grant)) = top_up {
            debug!("granting {} credits on channel 0x{:04X}", grant, cid);
            let packet = SignalingPacket::new(
                self.io.next_identifier(),
                ControlFrame::FlowControlCredit {
                    cid,
                    credits: grant,
                },
            );
            self.io.send_control(packet).await?;
        }
        if let Some((tx, sdu)) = result? {
            debug!("SDU complete: {} bytes", sdu.len());
            let _ = tx.send(sdu);
        }
        Ok(())
    }

    /// Fold one fragment into the partial SDU. The first fragment of an SDU
    /// carries the total-length prefix; a complete SDU pops out once the
    /// declared length is reached.
    fn reassemble(inner: &mut ChannelInner, pdu: &[u8]) -> Result<Option<Vec<u8>>, L2capError> {
        match &mut inner.rx_sdu {
            None => {
                if pdu.len() < SDU_LENGTH_PREFIX_SIZE {
                    warn!("fragment shorter than the length prefix, dropping");
                    return Ok(None);
                }
                let declared = u16::from_le_bytes([pdu[0], pdu[1]]) as usize;
                if declared > inner.max_reassembly {
                    return Err(L2capError::PayloadTooLarge {
                        size: declared,
                        max: inner.max_reassembly,
                    });
                }
                inner.rx_sdu_len = declared;
                inner.rx_sdu = Some(pdu[SDU_LENGTH_PREFIX_SIZE..].to_vec());
            }
            Some(sdu) => sdu.extend_from_slice(pdu),
        }

        let received = inner.rx_sdu.as_ref().map(Vec::len).unwrap_or(0);
        if received > inner.rx_sdu_len {
            let declared = inner.rx_sdu_len;
            inner.rx_sdu = None;
            inner.rx_sdu_len = 0;
            return Err(L2capError::ReassemblyOverflow { declared, received });
        }
        if received == inner.rx_sdu_len {
            let sdu = inner.rx_sdu.take().unwrap_or_default();
            inner.rx_sdu_len = 0;
            return Ok(Some(sdu));
        }
        Ok(None)
    }

    /// Peer granted us credits; wake a waiting sender.
    pub fn on_credits(&self, credits: u16) {
        let mut inner = self.inner.lock();
        inner.tx_credits = inner.tx_credits.saturating_add(credits);
        debug!(
            "channel 0x{:04X} received {} credits, total {}",
            inner.source_cid, credits, inner.tx_credits
        );
        drop(inner);
        self.credit_granted.notify_one();
    }

    /// Begin the disconnect handshake from this side.
    pub fn begin_disconnect(
        &self,
        identifier: u8,
    ) -> Result<(SignalingPacket, oneshot::Receiver<()>), L2capError> {
        let mut inner = self.inner.lock();
        if inner.state != ChannelState::Open {
            return Err(L2capError::InvalidState("channel not open"));
        }
        Self::change_state(&mut inner, ChannelState::Disconnecting);
        let (tx, rx) = oneshot::channel();
        inner.disconnect_waiter = Some(tx);
        let request = SignalingPacket::new(
            identifier,
            ControlFrame::DisconnectionRequest {
                destination_cid: inner.destination_cid,
                source_cid: inner.source_cid,
            },
        );
        Ok((request, rx))
    }

    /// Peer answered our disconnect request.
    pub fn on_disconnection_response(&self, destination_cid: u16, source_cid: u16) {
        let mut inner = self.inner.lock();
        if inner.state != ChannelState::Disconnecting {
            warn!("disconnection response in state {}", inner.state);
            return;
        }
        if destination_cid != inner.destination_cid || source_cid != inner.source_cid {
            warn!("disconnection response with unexpected channel identifiers");
            return;
        }
        Self::finish_close(&mut inner);
        drop(inner);
        self.credit_granted.notify_one();
    }

    /// Peer asked to disconnect; produce the response and close.
    pub fn on_disconnection_request(&self, identifier: u8) -> SignalingPacket {
        let mut inner = self.inner.lock();
        let response = SignalingPacket::new(
            identifier,
            ControlFrame::DisconnectionResponse {
                destination_cid: inner.source_cid,
                source_cid: inner.destination_cid,
            },
        );
        Self::finish_close(&mut inner);
        drop(inner);
        self.credit_granted.notify_one();
        response
    }

    /// Close without a handshake (connection teardown or protocol error).
    /// Returns true if the channel had not already been closed.
    pub fn force_close(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == ChannelState::Closed {
            return false;
        }
        Self::finish_close(&mut inner);
        drop(inner);
        self.credit_granted.notify_one();
        true
    }

    fn finish_close(inner: &mut ChannelInner) {
        Self::change_state(inner, ChannelState::Closed);
        inner.incoming = None;
        inner.rx_sdu = None;
        inner.rx_sdu_len = 0;
        if let Some(waiter) = inner.open_waiter.take() {
            let _ = waiter.send(Err(L2capError::ChannelClosed));
        }
        if let Some(waiter) = inner.disconnect_waiter.take() {
            let _ = waiter.send(());
        }
    }
}
