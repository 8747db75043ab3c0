//! End-to-end stack tests: frame properties, connection lifecycle, and the
//! teardown cascade.

mod support;

use bluehost_core::hci::{Event, FrameCodec, Packet};
use bluehost_core::host::StackEvent;
use bluehost_core::types::{ConnectionHandle, PeerAddress, Role, SecurityLevel};
use proptest::prelude::*;
use support::{connected_pair, next_event, PairOptions, CONN};

// ---------------------------------------------------------------------------
// Frame codec properties
// ---------------------------------------------------------------------------

fn arbitrary_packet() -> impl Strategy<Value = Packet> {
    prop_oneof![
        (any::<u16>(), proptest::collection::vec(any::<u8>(), 0..=255))
            .prop_map(|(opcode, params)| Packet::Command { opcode, params }),
        (any::<u16>(), proptest::collection::vec(any::<u8>(), 0..=1024)).prop_map(
            |(handle, payload)| Packet::Data {
                handle: ConnectionHandle(handle),
                payload,
            }
        ),
        (any::<u8>(), proptest::collection::vec(any::<u8>(), 0..=255))
            .prop_map(|(code, payload)| Packet::Event { code, payload }),
    ]
}

proptest! {
    #[test]
    fn prop_frame_roundtrip(packet in arbitrary_packet()) {
        let mut codec = FrameCodec::new(2048);
        codec.feed(&packet.to_bytes());
        prop_assert_eq!(codec.next_packet().unwrap(), Some(packet));
        prop_assert_eq!(codec.next_packet().unwrap(), None);
    }

    #[test]
    fn prop_fragmentation_independence(
        packets in proptest::collection::vec(arbitrary_packet(), 1..5),
        chunk_sizes in proptest::collection::vec(1usize..17, 1..64),
    ) {
        let mut wire = Vec::new();
        for packet in &packets {
            wire.extend_from_slice(&packet.to_bytes());
        }

        // Deliver the same bytes in arbitrary chunks; decoding must not care
        let mut codec = FrameCodec::new(2048);
        let mut decoded = Vec::new();
        let mut offset = 0;
        let mut sizes = chunk_sizes.iter().cycle();
        while offset < wire.len() {
            let take = (*sizes.next().unwrap()).min(wire.len() - offset);
            codec.feed(&wire[offset..offset + take]);
            offset += take;
            while let Ok(Some(packet)) = codec.next_packet() {
                decoded.push(packet);
            }
        }
        prop_assert_eq!(decoded, packets);
    }
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_connection_established_both_sides() {
    let pair = connected_pair(PairOptions::default()).await;
    let a_conn = pair.a.host.connection(CONN).expect("registered connection");
    assert_eq!(a_conn.role, Role::Initiator);
    assert_eq!(a_conn.peer_address, support::ADDR_B);
    assert_eq!(a_conn.security.level(), SecurityLevel::Open);

    let b_conn = pair.b.host.connection(CONN).expect("registered connection");
    assert_eq!(b_conn.role, Role::Responder);
    assert_eq!(b_conn.peer_address, support::ADDR_A);
}

#[tokio::test]
async fn test_failed_connection_event_creates_nothing() {
    let mut pair = connected_pair(PairOptions::default()).await;
    pair.a_ctrl
        .send(Event::ConnectionComplete {
            status: 0x3E,
            handle: ConnectionHandle(0x0002),
            peer_address: PeerAddress([9; 6]),
            role: Role::Initiator,
        })
        .unwrap();
    // Give the dispatch a chance to process, then confirm nothing appeared
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(pair.a.host.connection_count(), 1);
}

#[tokio::test]
async fn test_disconnect_tears_down_peer_too() {
    let mut pair = connected_pair(PairOptions::default()).await;
    pair.a.host.disconnect(CONN, 0x13).await.unwrap();

    assert!(matches!(
        next_event(&mut pair.a.events).await,
        StackEvent::ConnectionLost { conn: CONN, .. }
    ));
    assert!(matches!(
        next_event(&mut pair.b.events).await,
        StackEvent::ConnectionLost { conn: CONN, .. }
    ));
    assert!(pair.a.host.connection(CONN).is_none());
    assert!(pair.b.host.connection(CONN).is_none());
}

/// Closing a connection with two open channels and a pending attribute
/// request: the request resolves with an error and exactly two
/// channel-closed events precede the connection-lost event.
#[tokio::test]
async fn test_disconnection_cascade_ordering() {
    let mut pair = connected_pair(PairOptions::default()).await;

    let mut incoming = pair
        .b
        .host
        .register_channel_server(0x0080, SecurityLevel::Open);
    let a_conn = pair.a.host.connection(CONN).unwrap();

    let (_ch1, _rx1) = a_conn.channels.open_channel(0x0080).await.unwrap();
    let (_ch2, _rx2) = a_conn.channels.open_channel(0x0080).await.unwrap();
    let _inbound1 = incoming.recv().await.unwrap();
    let _inbound2 = incoming.recv().await.unwrap();

    // Drain the two channel-opened events
    for _ in 0..2 {
        assert!(matches!(
            next_event(&mut pair.a.events).await,
            StackEvent::ChannelOpened { .. }
        ));
    }

    // Cut the radio so the next request can never be answered, leaving it
    // pending when the connection goes down
    pair.a_forwarding
        .store(false, std::sync::atomic::Ordering::Relaxed);
    let client = a_conn.att_client.clone();
    let pending = tokio::spawn(async move { client.read(0x0001).await });
    tokio::task::yield_now().await;

    pair.a.host.disconnect(CONN, 0x13).await.unwrap();

    // The pending request resolves with an error rather than hanging
    let result = tokio::time::timeout(std::time::Duration::from_secs(5), pending)
        .await
        .expect("request must resolve at teardown")
        .unwrap();
    assert!(result.is_err());

    // Exactly two channel-closed events, then connection-lost
    let mut closed = 0;
    loop {
        match next_event(&mut pair.a.events).await {
            StackEvent::ChannelClosed { conn, .. } => {
                assert_eq!(conn, CONN);
                closed += 1;
            }
            StackEvent::ConnectionLost { conn, .. } => {
                assert_eq!(conn, CONN);
                break;
            }
            other => panic!("unexpected event during teardown: {:?}", other),
        }
    }
    assert_eq!(closed, 2);
}

// ---------------------------------------------------------------------------
// Attribute traffic spanning the whole stack
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_attribute_read_over_virtual_wire() {
    let mut pair = connected_pair(PairOptions::default()).await;

    let handle = pair.b.host.attributes().add(
        bluehost_core::AttUuid::Short(0x2A00),
        b"bluehost".to_vec(),
        bluehost_core::AttributePermissions::read_only(),
    );

    let a_conn = pair.a.host.connection(CONN).unwrap();
    let value = a_conn.att_client.read(handle).await.unwrap();
    assert_eq!(value, b"bluehost");

    // An unknown handle maps to a typed peer error
    let err = a_conn.att_client.read(0x7777).await.unwrap_err();
    assert!(matches!(
        err,
        bluehost_core::AttError::Peer {
            request: _,
            handle: 0x7777,
            code: bluehost_core::att::AttErrorCode::InvalidHandle,
        }
    ));

    // No stray events were produced by plain request traffic
    assert!(pair.a.events.try_recv().is_err());
}
