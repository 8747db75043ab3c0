//! Attribute protocol over the virtual wire: MTU exchange, paged discovery,
//! long reads, writes, notifications and indications, and security gating.

mod support;

use bluehost_core::att::{AttErrorCode, AttUuid, AttributePermissions};
use bluehost_core::host::StackEvent;
use bluehost_core::types::SecurityLevel;
use bluehost_core::{AttError, StackConfig};
use support::{connected_pair, next_event, PairOptions, CONN};

#[tokio::test]
async fn test_mtu_exchange_converges_on_minimum() {
    let mut config_b = StackConfig::default();
    config_b.att_mtu = 64;
    let pair = connected_pair(PairOptions {
        config_b,
        ..Default::default()
    })
    .await;

    let a_conn = pair.a.host.connection(CONN).unwrap();
    let effective = a_conn.att_client.exchange_mtu().await.unwrap();
    assert_eq!(effective, 64);
    assert_eq!(a_conn.att_client.mtu(), 64);
}

/// More attributes than fit one response are enumerated across repeated
/// requests with no duplicate or missing handle.
#[tokio::test]
async fn test_discovery_pagination_is_complete() {
    let pair = connected_pair(PairOptions::default()).await;

    let server = pair.b.host.attributes();
    let mut expected = Vec::new();
    for i in 0..40u16 {
        let handle = server.add(
            AttUuid::Short(0x2A00 + i),
            vec![],
            AttributePermissions::read_only(),
        );
        expected.push((handle, AttUuid::Short(0x2A00 + i)));
    }

    // Default MTU (23) fits 5 entries per response, so this pages 8 times
    let a_conn = pair.a.host.connection(CONN).unwrap();
    let found = a_conn.att_client.discover(1, 0xFFFF).await.unwrap();
    assert_eq!(found, expected);
}

#[tokio::test]
async fn test_discovery_of_empty_range() {
    let pair = connected_pair(PairOptions::default()).await;
    let a_conn = pair.a.host.connection(CONN).unwrap();
    let found = a_conn.att_client.discover(1, 0xFFFF).await.unwrap();
    assert!(found.is_empty());
}

#[tokio::test]
async fn test_read_long_value_via_blobs() {
    let pair = connected_pair(PairOptions::default()).await;

    let value: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
    let handle = pair.b.host.attributes().add(
        AttUuid::Short(0x2A01),
        value.clone(),
        AttributePermissions::read_only(),
    );

    let a_conn = pair.a.host.connection(CONN).unwrap();
    // Plain read is MTU-bounded
    let short = a_conn.att_client.read(handle).await.unwrap();
    assert_eq!(short.len(), 22);
    assert_eq!(short, value[..22]);

    // Blob continuation recovers the whole value
    let long = a_conn.att_client.read_long(handle).await.unwrap();
    assert_eq!(long, value);
}

#[tokio::test]
async fn test_read_long_exact_fragment_multiple() {
    let pair = connected_pair(PairOptions::default()).await;

    // Exactly two full fragments at MTU 23 (22 bytes each)
    let value: Vec<u8> = (0..44u8).collect();
    let handle = pair.b.host.attributes().add(
        AttUuid::Short(0x2A02),
        value.clone(),
        AttributePermissions::read_only(),
    );

    let a_conn = pair.a.host.connection(CONN).unwrap();
    let long = a_conn.att_client.read_long(handle).await.unwrap();
    assert_eq!(long, value);
}

#[tokio::test]
async fn test_write_and_write_command() -> anyhow::Result<()> {
    let pair = connected_pair(PairOptions::default()).await;
    let server = pair.b.host.attributes();
    let handle = server.add(
        AttUuid::Short(0x2A03),
        vec![0],
        AttributePermissions::read_write(),
    );

    let a_conn = pair.a.host.connection(CONN).unwrap();
    a_conn.att_client.write(handle, b"acknowledged").await?;
    assert_eq!(server.value(handle).unwrap(), b"acknowledged");

    // Unacknowledged write: no response, but it lands
    a_conn
        .att_client
        .write_command(handle, b"fire-and-forget")
        .await?;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(server.value(handle).unwrap(), b"fire-and-forget");
    Ok(())
}

#[tokio::test]
async fn test_notification_and_indication_events() {
    let mut pair = connected_pair(PairOptions::default()).await;
    let handle = pair.b.host.attributes().add(
        AttUuid::Short(0x2A04),
        vec![],
        AttributePermissions::read_only(),
    );

    let b_conn = pair.b.host.connection(CONN).unwrap();

    // Fire-and-forget notification
    b_conn.att_server.notify(handle, b"notified").await;
    match next_event(&mut pair.a.events).await {
        StackEvent::AttributeChanged {
            conn,
            handle: h,
            value,
            indicated,
        } => {
            assert_eq!(conn, CONN);
            assert_eq!(h, handle);
            assert_eq!(value, b"notified");
            assert!(!indicated);
        }
        other => panic!("expected attribute change, got {:?}", other),
    }

    // Indication blocks until the peer confirms
    b_conn.att_server.indicate(handle, b"indicated").await.unwrap();
    match next_event(&mut pair.a.events).await {
        StackEvent::AttributeChanged { indicated, .. } => assert!(indicated),
        other => panic!("expected attribute change, got {:?}", other),
    }
}

#[tokio::test]
async fn test_security_gated_attribute_requires_pairing() {
    let mut pair = connected_pair(PairOptions::default()).await;
    let handle = pair.b.host.attributes().add(
        AttUuid::Short(0x2A05),
        b"secret".to_vec(),
        AttributePermissions::read_only().with_security(SecurityLevel::Encrypted),
    );

    let a_conn = pair.a.host.connection(CONN).unwrap();

    // Before pairing the server refuses
    let err = a_conn.att_client.read(handle).await.unwrap_err();
    assert!(matches!(
        err,
        AttError::Peer {
            code: AttErrorCode::InsufficientEncryption,
            ..
        }
    ));

    // Attribute access requiring security triggers pairing laterally, then
    // the read goes through
    a_conn.smp.pair().await.unwrap();
    assert!(matches!(
        next_event(&mut pair.a.events).await,
        StackEvent::PairingCompleted { .. }
    ));
    let value = a_conn.att_client.read(handle).await.unwrap();
    assert_eq!(value, b"secret");
}

#[tokio::test]
async fn test_requests_queue_instead_of_colliding() {
    let pair = connected_pair(PairOptions::default()).await;
    let server = pair.b.host.attributes();
    let mut handles = Vec::new();
    for i in 0..4u8 {
        handles.push(server.add(
            AttUuid::Short(0x2B00 + i as u16),
            vec![i],
            AttributePermissions::read_only(),
        ));
    }

    // Issue several reads concurrently; the client serializes them and
    // every caller gets its own answer
    let a_conn = pair.a.host.connection(CONN).unwrap();
    let mut tasks = Vec::new();
    for &handle in &handles {
        let client = a_conn.att_client.clone();
        tasks.push(tokio::spawn(async move { client.read(handle).await }));
    }
    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap().unwrap(), vec![i as u8]);
    }
}
