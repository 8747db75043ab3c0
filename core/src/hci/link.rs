//! Controller link — command queue and event dispatch for one controller
//!
//! Commands are strictly FIFO with a single command in flight: the next
//! queued command is not written to the transport until the in-flight one
//! resolves (completion event, status event, timeout, or link loss). Events
//! that don't correlate with a pending command flow to registered listeners
//! and to the attached client.

use super::codec::{Event, FrameCodec, Packet};
use super::{FrameError, HciError, STATUS_SUCCESS};
use crate::transport::Transport;
use crate::types::ConnectionHandle;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Successful command outcome: the completion event's return parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub params: Vec<u8>,
}

/// Consumer of everything the link produces besides command replies.
///
/// The session registry implements this; dispatch happens inline on the
/// task driving `ingest`, so handlers run serialized in delivery order.
#[async_trait]
pub trait LinkClient: Send + Sync {
    async fn on_event(&self, event: Event);
    async fn on_data(&self, handle: ConnectionHandle, payload: Vec<u8>);
    async fn on_link_lost(&self);
}

type ReplySender = oneshot::Sender<Result<CommandReply, HciError>>;

struct QueuedCommand {
    id: u64,
    opcode: u16,
    params: Vec<u8>,
    reply: ReplySender,
}

struct InFlight {
    id: u64,
    opcode: u16,
    reply: ReplySender,
}

struct Listener {
    code: Option<u8>,
    tx: mpsc::UnboundedSender<Event>,
}

struct LinkState {
    codec: FrameCodec,
    in_flight: Option<InFlight>,
    queue: VecDeque<QueuedCommand>,
    listeners: Vec<Listener>,
    client: Option<Arc<dyn LinkClient>>,
    next_id: u64,
    closed: bool,
}

/// One physical or virtual controller connection.
pub struct ControllerLink {
    transport: Arc<dyn Transport>,
    state: Mutex<LinkState>,
    command_timeout: Duration,
}

impl ControllerLink {
    pub fn new(
        transport: Arc<dyn Transport>,
        command_timeout: Duration,
        max_frame_payload: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            state: Mutex::new(LinkState {
                codec: FrameCodec::new(max_frame_payload),
                in_flight: None,
                queue: VecDeque::new(),
                listeners: Vec::new(),
                client: None,
                next_id: 0,
                closed: false,
            }),
            command_timeout,
        })
    }

    /// Attach the single dispatch client (the session registry).
    pub fn set_client(&self, client: Arc<dyn LinkClient>) {
        self.state.lock().client = Some(client);
    }

    /// Subscribe to spontaneous events, optionally filtered by event code.
    pub fn register_listener(&self, code: Option<u8>) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().listeners.push(Listener { code, tx });
        rx
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Issue a command and await its completion or status event.
    ///
    /// Commands queue FIFO; a command is only written once every earlier
    /// command has resolved. A non-success status resolves the caller with
    /// `CommandFailed`; no event within the configured timeout resolves it
    /// with `CommandTimeout`.
    pub async fn send_command(
        &self,
        opcode: u16,
        params: &[u8],
    ) -> Result<CommandReply, HciError> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(HciError::LinkLost);
            }
            let id = state.next_id;
            state.next_id += 1;
            state.queue.push_back(QueuedCommand {
                id,
                opcode,
                params: params.to_vec(),
                reply: tx,
            });
            id
        };
        self.pump_commands().await;

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without a reply: the link failed underneath us
            Ok(Err(_)) => Err(HciError::LinkLost),
            Err(_) => {
                self.abandon_command(id).await;
                Err(HciError::CommandTimeout { opcode })
            }
        }
    }

    /// Send one data frame. The payload must already carry its channel
    /// header; the multiplexer guarantees it fits the frame limit.
    pub async fn send_data(
        &self,
        handle: ConnectionHandle,
        payload: Vec<u8>,
    ) -> Result<(), HciError> {
        if self.state.lock().closed {
            return Err(HciError::LinkLost);
        }
        let bytes = Packet::Data { handle, payload }.to_bytes();
        self.transport
            .write(&bytes)
            .await
            .map_err(|_| HciError::LinkLost)
    }

    /// Feed raw transport bytes and dispatch every complete packet inline.
    pub async fn ingest(&self, chunk: &[u8]) {
        self.state.lock().codec.feed(chunk);
        loop {
            let next = self.state.lock().codec.next_packet();
            match next {
                Ok(Some(packet)) => self.dispatch(packet).await,
                Ok(None) => break,
                Err(FrameError::FrameTooLong { got, max }) => {
                    warn!("dropping oversized data frame: {} bytes (max {})", got, max);
                }
                Err(err @ FrameError::InvalidPacketType(_)) => {
                    warn!("closing link: {}", err);
                    self.fail().await;
                    break;
                }
            }
        }
    }

    /// Pump the transport until it closes. Spawn this (or select against it)
    /// to drive the link from a real byte stream.
    pub async fn run(self: &Arc<Self>) {
        loop {
            match self.transport.read_chunk().await {
                Ok(chunk) => self.ingest(&chunk).await,
                Err(_) => {
                    self.fail().await;
                    return;
                }
            }
        }
    }

    /// Fail every pending command with `LinkLost` and notify the client.
    pub async fn fail(&self) {
        let (replies, client) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let mut replies: Vec<ReplySender> = Vec::new();
            if let Some(in_flight) = state.in_flight.take() {
                replies.push(in_flight.reply);
            }
            replies.extend(state.queue.drain(..).map(|cmd| cmd.reply));
            (replies, state.client.clone())
        };
        for reply in replies {
            let _ = reply.send(Err(HciError::LinkLost));
        }
        if let Some(client) = client {
            client.on_link_lost().await;
        }
    }

    async fn dispatch(&self, packet: Packet) {
        match packet {
            Packet::Event { code, payload } => match Event::parse(code, &payload) {
                Ok(event) => self.dispatch_event(event).await,
                Err(err) => warn!("dropping malformed event: {}", err),
            },
            Packet::Data { handle, payload } => {
                let client = self.state.lock().client.clone();
                if let Some(client) = client {
                    client.on_data(handle, payload).await;
                } else {
                    warn!("data for {} with no client attached", handle);
                }
            }
            Packet::Command { opcode, .. } => {
                // Commands only flow host-to-controller
                warn!("unexpected inbound command packet (opcode 0x{:04X})", opcode);
            }
        }
    }

    async fn dispatch_event(&self, event: Event) {
        match event {
            Event::CommandComplete {
                opcode,
                status,
                params,
            } => {
                self.resolve_command(opcode, status, params).await;
            }
            Event::CommandStatus { opcode, status } => {
                self.resolve_command(opcode, status, Vec::new()).await;
            }
            other => {
                let code = other.code();
                let client = {
                    let mut state = self.state.lock();
                    state.listeners.retain(|listener| match listener.code {
                        Some(c) if c != code => true,
                        // Drop listeners whose receiver went away
                        _ => listener.tx.send(other.clone()).is_ok(),
                    });
                    state.client.clone()
                };
                if let Some(client) = client {
                    client.on_event(other).await;
                }
            }
        }
    }

    async fn resolve_command(&self, opcode: u16, status: u8, params: Vec<u8>) {
        let reply = {
            let mut state = self.state.lock();
            match &state.in_flight {
                Some(in_flight) if in_flight.opcode == opcode => {
                    state.in_flight.take().map(|in_flight| in_flight.reply)
                }
                _ => None,
            }
        };
        match reply {
            Some(reply) => {
                debug!(
                    "command 0x{:04X} resolved with status 0x{:02X}",
                    opcode, status
                );
                let result = if status == STATUS_SUCCESS {
                    Ok(CommandReply { params })
                } else {
                    Err(HciError::CommandFailed { opcode, status })
                };
                let _ = reply.send(result);
                self.pump_commands().await;
            }
            None => {
                warn!(
                    "completion for 0x{:04X} with no matching pending command",
                    opcode
                );
            }
        }
    }

    /// Drop a command that timed out, wherever it currently is, then let the
    /// queue make progress again.
    async fn abandon_command(&self, id: u64) {
        let was_in_flight = {
            let mut state = self.state.lock();
            if state
                .in_flight
                .as_ref()
                .is_some_and(|in_flight| in_flight.id == id)
            {
                state.in_flight = None;
                true
            } else {
                state.queue.retain(|cmd| cmd.id != id);
                false
            }
        };
        if was_in_flight {
            self.pump_commands().await;
        }
    }

    async fn pump_commands(&self) {
        let to_send = {
            let mut state = self.state.lock();
            if state.closed || state.in_flight.is_some() {
                None
            } else {
                state.queue.pop_front().map(|cmd| {
                    let bytes = Packet::Command {
                        opcode: cmd.opcode,
                        params: cmd.params,
                    }
                    .to_bytes();
                    state.in_flight = Some(InFlight {
                        id: cmd.id,
                        opcode: cmd.opcode,
                        reply: cmd.reply,
                    });
                    (cmd.opcode, bytes)
                })
            }
        };
        if let Some((opcode, bytes)) = to_send {
            debug!("issuing command 0x{:04X}", opcode);
            if self.transport.write(&bytes).await.is_err() {
                self.fail().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PipeTransport;

    // Reads packets off the controller end of a pipe
    struct ControllerEnd {
        transport: PipeTransport,
        codec: Mutex<FrameCodec>,
    }

    impl ControllerEnd {
        fn new(transport: PipeTransport) -> Self {
            Self {
                transport,
                codec: Mutex::new(FrameCodec::new(4096)),
            }
        }

        async fn next_packet(&self) -> Packet {
            use crate::transport::Transport;
            loop {
                if let Some(packet) = self.codec.lock().next_packet().unwrap() {
                    return packet;
                }
                let chunk = self.transport.read_chunk().await.unwrap();
                self.codec.lock().feed(&chunk);
            }
        }

        async fn send_event(&self, event: Event) {
            use crate::transport::Transport;
            self.transport
                .write(&event.to_packet().to_bytes())
                .await
                .unwrap();
        }
    }

    fn link_pair() -> (Arc<ControllerLink>, ControllerEnd) {
        let (host_side, controller_side) = PipeTransport::pair();
        let link = ControllerLink::new(Arc::new(host_side), Duration::from_secs(5), 4096);
        (link, ControllerEnd::new(controller_side))
    }

    #[tokio::test]
    async fn test_command_completes() {
        let (link, controller) = link_pair();
        let driver = link.clone();
        tokio::spawn(async move { driver.run().await });

        let reply = tokio::spawn({
            let link = link.clone();
            async move { link.send_command(0x0C03, &[]).await }
        });

        let packet = controller.next_packet().await;
        assert_eq!(
            packet,
            Packet::Command {
                opcode: 0x0C03,
                params: vec![],
            }
        );
        controller
            .send_event(Event::CommandComplete {
                opcode: 0x0C03,
                status: 0,
                params: vec![0xAB],
            })
            .await;

        let reply = reply.await.unwrap().unwrap();
        assert_eq!(reply.params, vec![0xAB]);
    }

    #[tokio::test]
    async fn test_single_command_in_flight() {
        let (link, controller) = link_pair();
        let driver = link.clone();
        tokio::spawn(async move { driver.run().await });

        let first = tokio::spawn({
            let link = link.clone();
            async move { link.send_command(0x1001, &[]).await }
        });
        tokio::task::yield_now().await;
        let second = tokio::spawn({
            let link = link.clone();
            async move { link.send_command(0x1002, &[]).await }
        });

        // Only the first command reaches the wire
        let packet = controller.next_packet().await;
        assert_eq!(
            packet,
            Packet::Command {
                opcode: 0x1001,
                params: vec![],
            }
        );
        controller
            .send_event(Event::CommandComplete {
                opcode: 0x1001,
                status: 0,
                params: vec![],
            })
            .await;

        // The second is transmitted only after the first resolves
        let packet = controller.next_packet().await;
        assert_eq!(
            packet,
            Packet::Command {
                opcode: 0x1002,
                params: vec![],
            }
        );
        controller
            .send_event(Event::CommandComplete {
                opcode: 0x1002,
                status: 0,
                params: vec![],
            })
            .await;

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_command_error_status() {
        let (link, controller) = link_pair();
        let driver = link.clone();
        tokio::spawn(async move { driver.run().await });

        let reply = tokio::spawn({
            let link = link.clone();
            async move { link.send_command(0x0406, &[0x01, 0x00, 0x13]).await }
        });

        controller.next_packet().await;
        controller
            .send_event(Event::CommandStatus {
                opcode: 0x0406,
                status: 0x0C,
            })
            .await;

        let result = reply.await.unwrap();
        assert!(matches!(
            result,
            Err(HciError::CommandFailed {
                opcode: 0x0406,
                status: 0x0C,
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_timeout_releases_queue() {
        let (link, controller) = link_pair();
        let driver = link.clone();
        tokio::spawn(async move { driver.run().await });

        let first = tokio::spawn({
            let link = link.clone();
            async move { link.send_command(0x1001, &[]).await }
        });
        // Stagger the second so its own timeout window outlives the first's
        tokio::time::sleep(Duration::from_secs(1)).await;
        let second = tokio::spawn({
            let link = link.clone();
            async move { link.send_command(0x1002, &[]).await }
        });

        // Swallow the first command; never answer it
        controller.next_packet().await;

        let result = first.await.unwrap();
        assert!(matches!(
            result,
            Err(HciError::CommandTimeout { opcode: 0x1001 })
        ));

        // The timeout must unblock the queue
        let packet = controller.next_packet().await;
        assert_eq!(
            packet,
            Packet::Command {
                opcode: 0x1002,
                params: vec![],
            }
        );
        controller
            .send_event(Event::CommandComplete {
                opcode: 0x1002,
                status: 0,
                params: vec![],
            })
            .await;
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_link_lost_fails_pending_commands() {
        let (link, controller) = link_pair();
        let driver = link.clone();
        tokio::spawn(async move { driver.run().await });

        let pending = tokio::spawn({
            let link = link.clone();
            async move { link.send_command(0x1001, &[]).await }
        });
        controller.next_packet().await;

        drop(controller);

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(HciError::LinkLost)));
        assert!(link.is_closed());
    }

    #[tokio::test]
    async fn test_spontaneous_event_reaches_listener() {
        let (link, controller) = link_pair();
        let mut events = link.register_listener(Some(super::super::EVT_DISCONNECTION_COMPLETE));
        let driver = link.clone();
        tokio::spawn(async move { driver.run().await });

        controller
            .send_event(Event::DisconnectionComplete {
                status: 0,
                handle: ConnectionHandle(3),
                reason: 0x13,
            })
            .await;

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            Event::DisconnectionComplete {
                status: 0,
                handle: ConnectionHandle(3),
                reason: 0x13,
            }
        );
    }
}
