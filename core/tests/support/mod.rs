//! Test harness: two hosts joined by an emulated controller pair
//!
//! Each host talks to its own virtual controller over an in-memory pipe.
//! The controllers acknowledge every command and shuttle data frames to the
//! peer host, which is all the radio a protocol test needs.
#![allow(dead_code)]

use bluehost_core::hci::{self, ControllerLink, Event, FrameCodec, Packet};
use bluehost_core::host::{BondingStore, Host, MemoryBondingStore, StackEvent};
use bluehost_core::smp::PairingDelegate;
use bluehost_core::transport::{PipeTransport, Transport};
use bluehost_core::types::{ConnectionHandle, PeerAddress, Role};
use bluehost_core::StackConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const CONN: ConnectionHandle = ConnectionHandle(0x0001);
pub const ADDR_A: PeerAddress = PeerAddress([0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6]);
pub const ADDR_B: PeerAddress = PeerAddress([0xB1, 0xB2, 0xB3, 0xB4, 0xB5, 0xB6]);

/// One side's virtual controller: acknowledges commands, forwards data
/// frames to the peer controller, and raises disconnection events on both
/// sides when asked to disconnect.
async fn run_controller(
    host_side: Arc<PipeTransport>,
    peer_side: Arc<PipeTransport>,
    local_events: mpsc::UnboundedSender<Event>,
    peer_events: mpsc::UnboundedSender<Event>,
    forwarding: Arc<AtomicBool>,
) {
    let mut codec = FrameCodec::new(65535);
    loop {
        let chunk = match host_side.read_chunk().await {
            Ok(chunk) => chunk,
            Err(_) => return,
        };
        codec.feed(&chunk);
        loop {
            match codec.next_packet() {
                Ok(Some(Packet::Command { opcode, params })) => {
                    if opcode == hci::CMD_DISCONNECT && params.len() >= 3 {
                        let handle =
                            ConnectionHandle(u16::from_le_bytes([params[0], params[1]]));
                        let _ = local_events.send(Event::CommandStatus { opcode, status: 0 });
                        let _ = local_events.send(Event::DisconnectionComplete {
                            status: 0,
                            handle,
                            reason: params[2],
                        });
                        // The remote controller reports the peer-initiated
                        // disconnect
                        let _ = peer_events.send(Event::DisconnectionComplete {
                            status: 0,
                            handle,
                            reason: 0x13,
                        });
                    } else if opcode == hci::CMD_START_ENCRYPTION {
                        let handle =
                            ConnectionHandle(u16::from_le_bytes([params[0], params[1]]));
                        let _ = local_events.send(Event::CommandStatus { opcode, status: 0 });
                        let _ = local_events.send(Event::EncryptionChange {
                            status: 0,
                            handle,
                            enabled: true,
                        });
                        let _ = peer_events.send(Event::EncryptionChange {
                            status: 0,
                            handle,
                            enabled: true,
                        });
                    } else {
                        let _ = local_events.send(Event::CommandComplete {
                            opcode,
                            status: 0,
                            params: vec![],
                        });
                    }
                }
                Ok(Some(Packet::Data { handle, payload })) => {
                    // Radio hop: deliver to the peer host unchanged. Tests
                    // can cut the radio to leave requests pending.
                    if !forwarding.load(Ordering::Relaxed) {
                        continue;
                    }
                    let frame = Packet::Data { handle, payload }.to_bytes();
                    if peer_side.write(&frame).await.is_err() {
                        return;
                    }
                }
                Ok(Some(Packet::Event { .. })) | Ok(None) => break,
                Err(_) => return,
            }
        }
    }
}

/// Drains queued controller events onto one host's transport.
async fn run_event_pump(events: mpsc::UnboundedReceiver<Event>, host_side: Arc<PipeTransport>) {
    let mut events = events;
    while let Some(event) = events.recv().await {
        if host_side
            .write(&event.to_packet().to_bytes())
            .await
            .is_err()
        {
            return;
        }
    }
}

pub struct TestHost {
    pub host: Arc<Host>,
    pub link: Arc<ControllerLink>,
    pub events: mpsc::UnboundedReceiver<StackEvent>,
    pub bonds: Arc<MemoryBondingStore>,
}

pub struct TestPair {
    pub a: TestHost,
    pub b: TestHost,
    /// Sends events into A's controller (connection setup etc.)
    pub a_ctrl: mpsc::UnboundedSender<Event>,
    pub b_ctrl: mpsc::UnboundedSender<Event>,
    /// Clear to drop data frames leaving A (simulates a dead radio)
    pub a_forwarding: Arc<AtomicBool>,
}

pub struct PairOptions {
    pub config_a: StackConfig,
    pub config_b: StackConfig,
    pub delegate_a: Option<Arc<dyn PairingDelegate>>,
    pub delegate_b: Option<Arc<dyn PairingDelegate>>,
}

impl Default for PairOptions {
    fn default() -> Self {
        Self {
            config_a: StackConfig::default(),
            config_b: StackConfig::default(),
            delegate_a: None,
            delegate_b: None,
        }
    }
}

fn build_host(
    config: StackConfig,
    address: PeerAddress,
    delegate: Option<Arc<dyn PairingDelegate>>,
) -> (TestHost, Arc<PipeTransport>) {
    let (host_side, ctrl_side) = PipeTransport::pair();
    let link = ControllerLink::new(
        Arc::new(host_side),
        config.command_timeout,
        config.max_frame_payload,
    );
    let bonds = MemoryBondingStore::new();
    let host = Host::new(
        link.clone(),
        config,
        address,
        bonds.clone() as Arc<dyn BondingStore>,
        delegate,
    )
    .expect("valid test config");
    let events = host.events();
    let driver = link.clone();
    tokio::spawn(async move { driver.run().await });
    (
        TestHost {
            host,
            link,
            events,
            bonds,
        },
        Arc::new(ctrl_side),
    )
}

/// Opt-in test logging: `RUST_LOG=bluehost_core=debug cargo test -- --nocapture`.
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Build two connected hosts with an established connection between them:
/// A is the initiator, B the responder, both on handle `CONN`.
pub async fn connected_pair(options: PairOptions) -> TestPair {
    init_tracing();
    let (a, a_ctrl_side) = build_host(options.config_a, ADDR_A, options.delegate_a);
    let (b, b_ctrl_side) = build_host(options.config_b, ADDR_B, options.delegate_b);

    let (a_ctrl_tx, a_ctrl_rx) = mpsc::unbounded_channel();
    let (b_ctrl_tx, b_ctrl_rx) = mpsc::unbounded_channel();

    let a_forwarding = Arc::new(AtomicBool::new(true));
    tokio::spawn(run_event_pump(a_ctrl_rx, a_ctrl_side.clone()));
    tokio::spawn(run_event_pump(b_ctrl_rx, b_ctrl_side.clone()));
    tokio::spawn(run_controller(
        a_ctrl_side.clone(),
        b_ctrl_side.clone(),
        a_ctrl_tx.clone(),
        b_ctrl_tx.clone(),
        a_forwarding.clone(),
    ));
    tokio::spawn(run_controller(
        b_ctrl_side,
        a_ctrl_side,
        b_ctrl_tx.clone(),
        a_ctrl_tx.clone(),
        Arc::new(AtomicBool::new(true)),
    ));

    let mut pair = TestPair {
        a,
        b,
        a_ctrl: a_ctrl_tx,
        b_ctrl: b_ctrl_tx,
        a_forwarding,
    };

    pair.a_ctrl
        .send(Event::ConnectionComplete {
            status: 0,
            handle: CONN,
            peer_address: ADDR_B,
            role: Role::Initiator,
        })
        .unwrap();
    pair.b_ctrl
        .send(Event::ConnectionComplete {
            status: 0,
            handle: CONN,
            peer_address: ADDR_A,
            role: Role::Responder,
        })
        .unwrap();

    assert!(matches!(
        next_event(&mut pair.a.events).await,
        StackEvent::ConnectionEstablished { .. }
    ));
    assert!(matches!(
        next_event(&mut pair.b.events).await,
        StackEvent::ConnectionEstablished { .. }
    ));
    pair
}

/// Receive the next stack event, failing the test after a bounded wait.
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<StackEvent>) -> StackEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a stack event")
        .expect("event bus closed")
}
