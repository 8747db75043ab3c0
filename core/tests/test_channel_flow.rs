//! Channel multiplexer behavior over the virtual wire: open/refuse,
//! segmentation round-trips, credit backpressure, and disconnects.

mod support;

use bluehost_core::hci::ControllerLink;
use bluehost_core::l2cap::channel::{segment_sdu, CreditChannel, PduSender};
use bluehost_core::l2cap::{ChannelState, ConnectionResult, L2capError};
use bluehost_core::host::StackEvent;
use bluehost_core::transport::{PipeTransport, Transport};
use bluehost_core::types::{ConnectionHandle, SecurityLevel};
use bluehost_core::StackConfig;
use std::sync::Arc;
use std::time::Duration;
use support::{connected_pair, next_event, PairOptions, CONN};

#[tokio::test]
async fn test_open_send_receive_roundtrip() -> anyhow::Result<()> {
    let mut pair = connected_pair(PairOptions::default()).await;
    let mut incoming = pair
        .b
        .host
        .register_channel_server(0x0080, SecurityLevel::Open);

    let a_conn = pair.a.host.connection(CONN).unwrap();
    let (channel, mut rx) = a_conn.channels.open_channel(0x0080).await?;
    assert_eq!(channel.state(), ChannelState::Open);

    let mut inbound = incoming.recv().await.unwrap();
    assert_eq!(inbound.psm, 0x0080);

    assert!(matches!(
        next_event(&mut pair.a.events).await,
        StackEvent::ChannelOpened { psm: 0x0080, .. }
    ));
    assert!(matches!(
        next_event(&mut pair.b.events).await,
        StackEvent::ChannelOpened { psm: 0x0080, .. }
    ));

    // Small payload, one fragment
    channel.send(b"ping").await?;
    assert_eq!(inbound.rx.recv().await.unwrap(), b"ping");

    // Payload spanning many fragments reassembles exactly
    let big: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
    channel.send(&big).await?;
    assert_eq!(inbound.rx.recv().await.unwrap(), big);

    // And the reverse direction works the same way
    inbound.channel.send(b"pong").await?;
    assert_eq!(rx.recv().await.unwrap(), b"pong");

    // Empty payloads are legal
    channel.send(&[]).await?;
    assert_eq!(inbound.rx.recv().await.unwrap(), Vec::<u8>::new());
    Ok(())
}

#[tokio::test]
async fn test_open_unknown_service_refused() {
    let pair = connected_pair(PairOptions::default()).await;
    let a_conn = pair.a.host.connection(CONN).unwrap();
    let err = a_conn.channels.open_channel(0x00AA).await.unwrap_err();
    assert!(matches!(
        err,
        L2capError::ChannelRefused(ConnectionResult::PsmNotSupported)
    ));
}

#[tokio::test]
async fn test_open_refused_below_required_security() {
    let mut pair = connected_pair(PairOptions::default()).await;
    let _incoming = pair
        .b
        .host
        .register_channel_server(0x0081, SecurityLevel::Encrypted);

    let a_conn = pair.a.host.connection(CONN).unwrap();
    let err = a_conn.channels.open_channel(0x0081).await.unwrap_err();
    assert!(matches!(err, L2capError::ChannelRefused(_)));

    // Pairing raises the level; the same open then succeeds
    a_conn.smp.pair().await.unwrap();
    assert!(matches!(
        next_event(&mut pair.a.events).await,
        StackEvent::PairingCompleted { .. }
    ));
    let (channel, _rx) = a_conn.channels.open_channel(0x0081).await.unwrap();
    assert_eq!(channel.state(), ChannelState::Open);
}

#[tokio::test]
async fn test_oversized_payload_dropped_channel_survives() {
    // B accepts at most 100 reassembled bytes
    let mut config_b = StackConfig::default();
    config_b.max_reassembly_size = 100;
    let pair = connected_pair(PairOptions {
        config_b,
        ..Default::default()
    })
    .await;

    let mut incoming = pair
        .b
        .host
        .register_channel_server(0x0080, SecurityLevel::Open);
    let a_conn = pair.a.host.connection(CONN).unwrap();
    let (channel, _rx) = a_conn.channels.open_channel(0x0080).await.unwrap();
    let mut inbound = incoming.recv().await.unwrap();

    // Declared length exceeds B's cap: the message vanishes, the channel
    // stays open
    channel.send(&[0xEE; 200]).await.unwrap();
    channel.send(b"still alive").await.unwrap();
    assert_eq!(inbound.rx.recv().await.unwrap(), b"still alive");
    assert_eq!(channel.state(), ChannelState::Open);
}

#[tokio::test]
async fn test_sdu_larger_than_peer_mtu_rejected_locally() {
    let mut config_b = StackConfig::default();
    config_b.channel_mtu = 64;
    let pair = connected_pair(PairOptions {
        config_b,
        ..Default::default()
    })
    .await;

    let _incoming = pair
        .b
        .host
        .register_channel_server(0x0080, SecurityLevel::Open);
    let a_conn = pair.a.host.connection(CONN).unwrap();
    let (channel, _rx) = a_conn.channels.open_channel(0x0080).await.unwrap();

    // Negotiated MTU is the minimum of the two proposals
    assert_eq!(channel.mtu(), 64);
    let err = channel.send(&[0u8; 65]).await.unwrap_err();
    assert!(matches!(err, L2capError::SduTooLarge { size: 65, mtu: 64 }));
}

#[tokio::test]
async fn test_explicit_disconnect_frees_identifier() {
    let mut pair = connected_pair(PairOptions::default()).await;
    let mut incoming = pair
        .b
        .host
        .register_channel_server(0x0080, SecurityLevel::Open);
    let a_conn = pair.a.host.connection(CONN).unwrap();

    let (channel, _rx) = a_conn.channels.open_channel(0x0080).await.unwrap();
    let first_cid = channel.source_cid();
    let _inbound = incoming.recv().await.unwrap();
    assert!(matches!(
        next_event(&mut pair.a.events).await,
        StackEvent::ChannelOpened { .. }
    ));

    a_conn.channels.close_channel(&channel).await.unwrap();
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(matches!(
        next_event(&mut pair.a.events).await,
        StackEvent::ChannelClosed { .. }
    ));

    // The identifier is reusable after close
    let (channel2, _rx2) = a_conn.channels.open_channel(0x0080).await.unwrap();
    assert_eq!(channel2.source_cid(), first_cid);
}

// ---------------------------------------------------------------------------
// Credit flow control, at the channel level where grants can be controlled
// ---------------------------------------------------------------------------

struct CreditHarness {
    channel: Arc<CreditChannel>,
    ctrl: Arc<PipeTransport>,
}

/// A hand-built open channel with a fixed credit budget and no peer to
/// auto-replenish it.
fn credit_channel(tx_credits: u16, mps: u16) -> CreditHarness {
    let (host_side, ctrl_side) = PipeTransport::pair();
    let link = ControllerLink::new(Arc::new(host_side), Duration::from_secs(5), 4096);
    let io = PduSender::new(link, ConnectionHandle(1));
    let (channel, _rx) = CreditChannel::new_accepted(
        io,
        0x0080,
        0x0040,
        0x0041,
        1000,
        mps,
        tx_credits,
        8,
        65535,
    );
    CreditHarness {
        channel,
        ctrl: Arc::new(ctrl_side),
    }
}

/// Count data frames currently sitting on the wire.
async fn drain_frames(ctrl: &PipeTransport) -> usize {
    let mut frames = 0;
    loop {
        match tokio::time::timeout(Duration::from_millis(50), ctrl.read_chunk()).await {
            Ok(Ok(_)) => frames += 1,
            _ => return frames,
        }
    }
}

#[tokio::test]
async fn test_credit_exhaustion_suspends_sender() {
    let harness = credit_channel(2, 10);
    let channel = harness.channel.clone();

    // 25-byte SDU + 2-byte prefix over MPS 10 = 3 fragments, 2 credits
    let sender = tokio::spawn(async move { channel.send(&[7u8; 25]).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(drain_frames(&harness.ctrl).await, 2);
    assert!(!sender.is_finished(), "sender must wait for credits");

    // One credit releases exactly one fragment
    harness.channel.on_credits(1);
    sender.await.unwrap().unwrap();
    assert_eq!(drain_frames(&harness.ctrl).await, 1);
    assert_eq!(harness.channel.tx_credits(), 0);
}

#[tokio::test]
async fn test_one_fragment_per_granted_credit() {
    let harness = credit_channel(0, 10);
    let channel = harness.channel.clone();

    // 4 fragments needed (2 + 38 bytes over MPS 10), zero credits to start
    let sender = tokio::spawn(async move { channel.send(&[1u8; 38]).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(drain_frames(&harness.ctrl).await, 0);

    for expected in [1, 1, 1] {
        harness.channel.on_credits(1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(drain_frames(&harness.ctrl).await, expected);
        assert!(!sender.is_finished());
    }

    harness.channel.on_credits(1);
    sender.await.unwrap().unwrap();
    assert_eq!(drain_frames(&harness.ctrl).await, 1);
}

#[tokio::test]
async fn test_close_wakes_waiting_sender() {
    let harness = credit_channel(0, 10);
    let channel = harness.channel.clone();
    let sender = tokio::spawn(async move { channel.send(b"blocked").await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!sender.is_finished());

    harness.channel.force_close();
    let result = sender.await.unwrap();
    assert!(matches!(result, Err(L2capError::ChannelClosed)));
}

#[test]
fn test_segmentation_counts() {
    // 0..N*MPS payloads produce ceil((len+2)/mps) fragments
    for len in [0usize, 1, 8, 9, 19, 100] {
        let fragments = segment_sdu(&vec![0u8; len], 10);
        assert_eq!(fragments.len(), (len + 2).div_ceil(10));
        let total: usize = fragments.iter().map(Vec::len).sum();
        assert_eq!(total, len + 2);
    }
}
