//! Integration tests across the core codec and the transport engine.
//!
//! Every test runs real `MeshTransport`s wired together with in-memory
//! loopback links, so bytes go through encode, fragment, schedule, flow
//! control, delivery, decode and reassembly exactly as they would on a radio.

use gattmesh_core::{Message, MessageType};
use gattmesh_integration_tests::test_helpers::{
    Mesh, next_message, payload, peer, quiet_config, stays_quiet, transfer_events,
};
use gattmesh_transport::{
    LinkAddress, LinkInfo, LinkTable, LoopbackNode, TargetKind, TargetResolver, TransferEvent,
    TransportConfig, TransportError, TransportEvent,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn test_large_broadcast_reaches_every_peer() {
    let mut mesh = Mesh::star(4, TransportConfig::default());
    let data = payload(3000);
    let msg = Message::new(MessageType::FileTransfer, mesh.node(0).id, data.clone()).with_ttl(5);

    let handle = mesh.node(0).transport.send(msg, None).unwrap();

    let events = transfer_events(mesh.inbox(0)).await;
    // 3000-byte payload encodes to 3022 bytes: 7 fragments per peer
    assert_eq!(
        events.first(),
        Some(&TransferEvent::Started {
            id: handle.id().clone(),
            total: 21
        })
    );
    assert_eq!(
        events.last(),
        Some(&TransferEvent::Completed {
            id: handle.id().clone()
        })
    );
    let progress = events
        .iter()
        .filter(|e| matches!(e, TransferEvent::Progress { .. }))
        .count();
    assert_eq!(progress, 21);

    for i in 1..4 {
        let (message, from) = next_message(mesh.inbox(i)).await.expect("message delivered");
        assert_eq!(message.payload(), data.as_slice());
        assert_eq!(message.msg_type(), MessageType::FileTransfer);
        assert_eq!(message.sender(), mesh.node(0).id);
        assert_eq!(message.ttl(), 0, "reassembled messages are never relayed");
        assert_eq!(from, mesh.node(i).server_address(mesh.node(0)));
    }

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_small_message_keeps_envelope() {
    let mut mesh = Mesh::star(2, TransportConfig::default());
    let msg = Message::new(MessageType::Message, mesh.node(0).id, b"hello".to_vec())
        .with_recipient(mesh.node(1).id)
        .with_ttl(3);

    mesh.node(0).transport.send(msg.clone(), None).unwrap();

    let (received, _) = next_message(mesh.inbox(1)).await.expect("message delivered");
    assert_eq!(received, msg);
    assert_eq!(received.ttl(), 3);
}

#[tokio::test]
async fn test_concurrent_senders_reassemble_independently() {
    let mut mesh = Mesh::new(3, TransportConfig::default());
    LoopbackNode::connect(mesh.node(1), mesh.node(0), None);
    LoopbackNode::connect(mesh.node(2), mesh.node(0), None);

    let a = vec![0xA1; 2500];
    let b = vec![0xB2; 1800];
    let to = mesh.node(0).id;
    let msg_a = Message::new(MessageType::FileTransfer, mesh.node(1).id, a.clone())
        .with_recipient(to);
    let msg_b = Message::new(MessageType::FileTransfer, mesh.node(2).id, b.clone())
        .with_recipient(to);
    mesh.node(1).transport.send(msg_a, None).unwrap();
    mesh.node(2).transport.send(msg_b, None).unwrap();

    let mut received = Vec::new();
    for _ in 0..2 {
        let (message, _) = next_message(mesh.inbox(0)).await.expect("message delivered");
        received.push(message);
    }
    received.sort_by_key(|m| m.payload().len());
    assert_eq!(received[0].payload(), b.as_slice());
    assert_eq!(received[1].payload(), a.as_slice());
    assert!(mesh.node(0).transport.codec().store().is_empty());
}

#[tokio::test]
async fn test_directed_send_without_route() {
    let mesh = Mesh::star(2, TransportConfig::default());
    let msg = Message::new(MessageType::Message, mesh.node(0).id, b"lost".to_vec())
        .with_recipient(peer(99));
    let err = mesh.node(0).transport.send(msg, None).unwrap_err();
    assert!(matches!(err, TransportError::NoRoute(_)));
}

// ============================================================================
// Target resolution
// ============================================================================

#[test]
fn test_resolve_prefers_client_link() {
    let table = LinkTable::new();
    table.upsert(LinkInfo::client("P-client").with_peer(peer(0x50)).with_rssi(-40));
    table.upsert(LinkInfo::server("P-server").with_peer(peer(0x50)).with_rssi(-60));

    let target = TargetResolver::new(Arc::new(table))
        .resolve_one(peer(0x50))
        .unwrap();
    assert_eq!(target.address.as_str(), "P-client");
    assert_eq!(target.kind, TargetKind::ClientWrite);
}

#[test]
fn test_broadcast_skips_originating_sender() {
    let table = LinkTable::new();
    table.upsert(LinkInfo::client("one").with_peer(peer(1)));
    table.upsert(LinkInfo::client("two").with_peer(peer(2)));
    table.upsert(LinkInfo::server("three").with_peer(peer(3)));

    let targets = TargetResolver::new(Arc::new(table)).resolve_broadcast(None, Some(peer(2)));
    assert_eq!(targets.len(), 2);
    assert!(targets.iter().all(|t| t.peer_id != Some(peer(2))));
}

#[tokio::test]
async fn test_dual_paths_deliver_one_copy() {
    let mut mesh = Mesh::new(3, TransportConfig::default());
    for i in 1..3 {
        LoopbackNode::connect(mesh.node(0), mesh.node(i), Some(-80));
        LoopbackNode::connect(mesh.node(i), mesh.node(0), Some(-30));
    }

    let msg = Message::new(MessageType::Announce, mesh.node(0).id, b"here".to_vec());
    mesh.node(0).transport.send(msg, None).unwrap();
    transfer_events(mesh.inbox(0)).await;

    for i in 1..3 {
        let (_, from) = next_message(mesh.inbox(i)).await.expect("message delivered");
        assert_eq!(from, mesh.node(i).server_address(mesh.node(0)));
        assert!(stays_quiet(mesh.inbox(i), Duration::from_millis(100)).await);
    }
    assert_eq!(mesh.node(0).link.writes(), 2);
    assert_eq!(mesh.node(0).link.notifies(), 0);
}

#[tokio::test]
async fn test_relay_forwards_past_arrival_link() {
    let mut mesh = Mesh::new(3, TransportConfig::default());
    LoopbackNode::connect(mesh.node(0), mesh.node(1), None);
    LoopbackNode::connect(mesh.node(1), mesh.node(2), None);

    let msg = Message::new(MessageType::Message, mesh.node(0).id, b"hop".to_vec());
    mesh.node(0).transport.send(msg, None).unwrap();

    let (message, from) = next_message(mesh.inbox(1)).await.expect("first hop");
    mesh.node(1).transport.relay(message, &from).unwrap();

    let (relayed, _) = next_message(mesh.inbox(2)).await.expect("second hop");
    assert_eq!(relayed.sender(), mesh.node(0).id);
    assert_eq!(relayed.payload(), b"hop");
    assert!(stays_quiet(mesh.inbox(0), Duration::from_millis(100)).await);
}

// ============================================================================
// Scheduling, flow control and retry
// ============================================================================

#[tokio::test]
async fn test_rejected_write_retried_before_later_units() {
    let mut mesh = Mesh::star(2, TransportConfig::default());
    let to = mesh.node(1).id;
    mesh.node(0).link.reject_writes(1);

    for text in [&b"first"[..], &b"second"[..]] {
        let msg = Message::new(MessageType::Message, mesh.node(0).id, text.to_vec())
            .with_recipient(to);
        mesh.node(0).transport.send(msg, None).unwrap();
    }

    let (a, _) = next_message(mesh.inbox(1)).await.expect("first delivered");
    let (b, _) = next_message(mesh.inbox(1)).await.expect("second delivered");
    assert_eq!(a.payload(), b"first");
    assert_eq!(b.payload(), b"second");

    let stats = mesh.node(0).transport.scheduler().stats().await.unwrap();
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.dropped, 0);
}

#[tokio::test]
async fn test_failed_completion_resends_unit() {
    let mut mesh = Mesh::star(2, TransportConfig::default());
    let to = mesh.node(1).id;
    mesh.node(0).link.fail_completions(1);

    let msg = Message::new(MessageType::Message, mesh.node(0).id, b"again".to_vec())
        .with_recipient(to);
    mesh.node(0).transport.send(msg, None).unwrap();

    let (message, _) = next_message(mesh.inbox(1)).await.expect("delivered on retry");
    assert_eq!(message.payload(), b"again");
    assert!(stays_quiet(mesh.inbox(1), Duration::from_millis(100)).await);

    assert_eq!(mesh.node(0).link.writes(), 2);
    let stats = mesh.node(0).transport.scheduler().stats().await.unwrap();
    assert_eq!(stats.retried, 1);
}

#[tokio::test(start_paused = true)]
async fn test_window_bounds_outstanding_writes() {
    let mut mesh = Mesh::star(2, quiet_config());
    let source = mesh.node(0);
    let address = source.client_address(mesh.node(1));
    source.link.drop_completions(true);

    // 4000-byte directed payload encodes to 4030 bytes: 9 fragments
    let msg = Message::new(MessageType::FileTransfer, source.id, payload(4000))
        .with_recipient(mesh.node(1).id);
    source.transport.send(msg, None).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = source
        .transport
        .scheduler()
        .link_stats(address.clone())
        .await
        .unwrap()
        .expect("queue exists");
    assert_eq!(stats.in_flight, 4);
    assert_eq!(stats.high, 5);
    assert_eq!(source.link.writes(), 4);

    let mut completed = 0;
    while source.link.writes() < 9 {
        for _ in 0..4 {
            source.transport.on_write_completed(&address, true);
            completed += 1;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(source.link.writes() <= completed + 4);
    }

    let (message, _) = next_message(mesh.inbox(1)).await.expect("message delivered");
    assert_eq!(message.payload().len(), 4000);
}

#[tokio::test(start_paused = true)]
async fn test_lost_completions_written_off_by_watchdog() {
    let mut config = TransportConfig::default();
    config.scheduler.inflight_timeout = Duration::from_millis(300);
    let mut mesh = Mesh::star(2, config);
    mesh.node(0).link.drop_completions(true);

    let msg = Message::new(MessageType::FileTransfer, mesh.node(0).id, payload(4000))
        .with_recipient(mesh.node(1).id);
    mesh.node(0).transport.send(msg, None).unwrap();

    let (message, _) = next_message(mesh.inbox(1)).await.expect("watchdog unblocks the window");
    assert_eq!(message.payload().len(), 4000);

    let stats = mesh.node(0).transport.scheduler().stats().await.unwrap();
    assert!(stats.expired >= 4);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_abandons_queue() {
    let mut mesh = Mesh::star(2, quiet_config());
    let address = mesh.node(0).client_address(mesh.node(1));
    mesh.node(0).link.drop_completions(true);

    let msg = Message::new(MessageType::FileTransfer, mesh.node(0).id, payload(4000))
        .with_recipient(mesh.node(1).id);
    let handle = mesh.node(0).transport.send(msg, None).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    LoopbackNode::disconnect(mesh.node(0), mesh.node(1));

    let scheduler = mesh.node(0).transport.scheduler();
    assert_eq!(scheduler.link_stats(address.clone()).await.unwrap(), None);
    assert_eq!(scheduler.stats().await.unwrap().dropped, 9);
    assert_eq!(mesh.node(0).transport.gate().available(&address), None);

    // Abandoned fragments count toward the transfer so it still terminates
    let events = transfer_events(mesh.inbox(0)).await;
    assert!(events.contains(&TransferEvent::Progress {
        id: handle.id().clone(),
        done: 9,
        total: 9
    }));
    assert_eq!(
        events.last(),
        Some(&TransferEvent::Completed {
            id: handle.id().clone()
        })
    );
    assert!(!mesh.node(0).transport.is_transfer_active(handle.id()));
}

// ============================================================================
// Transfers
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_fragment_submission() {
    let mut config = quiet_config();
    config.fragment.inter_fragment_delay = Duration::from_millis(20);
    let mut mesh = Mesh::star(2, config);
    let to = mesh.node(1).id;

    let msg = Message::new(MessageType::FileTransfer, mesh.node(0).id, payload(20_000))
        .with_recipient(to);
    let handle = mesh.node(0).transport.send(msg, None).unwrap();

    loop {
        match mesh.inbox(0).recv().await {
            Some(TransportEvent::Transfer(TransferEvent::Progress { .. })) => break,
            Some(_) => continue,
            None => panic!("event channel closed"),
        }
    }
    assert!(mesh.node(0).transport.cancel_transfer(handle.id()));

    let events = transfer_events(mesh.inbox(0)).await;
    assert_eq!(
        events.last(),
        Some(&TransferEvent::Cancelled {
            id: handle.id().clone()
        })
    );
    assert!(mesh.node(0).link.writes() < 43);
    assert!(stays_quiet(mesh.inbox(1), Duration::from_millis(500)).await);
    assert!(!mesh.node(0).transport.cancel_transfer(handle.id()));
}

#[tokio::test]
async fn test_named_transfer_id_reported() {
    let mut mesh = Mesh::star(3, TransportConfig::default());
    let msg = Message::new(MessageType::FileTransfer, mesh.node(0).id, payload(1000));
    let id = gattmesh_transport::TransferId::new("sha256:abcd");
    let handle = mesh.node(0).transport.send(msg, Some(id.clone())).unwrap();
    assert_eq!(handle.id(), &id);

    let events = transfer_events(mesh.inbox(0)).await;
    assert!(events.iter().all(|e| match e {
        TransferEvent::Started { id: got, .. }
        | TransferEvent::Progress { id: got, .. }
        | TransferEvent::Completed { id: got }
        | TransferEvent::Cancelled { id: got } => got == &id,
    }));
    assert!(matches!(
        events.first(),
        Some(TransferEvent::Started { total: 6, .. })
    ));
}

// ============================================================================
// Reassembly lifecycle
// ============================================================================

#[tokio::test]
async fn test_abandoned_set_swept_then_restarted() {
    let mut mesh = Mesh::new(1, TransportConfig::default());
    let node = mesh.node(0);
    let from = LinkAddress::from("remote");

    let original = Message::new(MessageType::Message, peer(7), payload(1500));
    let fragments = node.transport.codec().split(&original).unwrap();
    assert_eq!(fragments.len(), 4);

    for fragment in &fragments[..2] {
        node.transport.on_inbound(&from, &fragment.encode().unwrap());
    }
    let store = node.transport.codec().store();
    assert_eq!(store.len(), 1);

    let later = Instant::now() + Duration::from_secs(31);
    assert_eq!(node.transport.codec().sweep(later), 1);
    assert!(store.is_empty());

    // The remaining half alone cannot complete a fresh set
    for fragment in &fragments[2..] {
        node.transport.on_inbound(&from, &fragment.encode().unwrap());
    }
    assert_eq!(store.len(), 1);

    for fragment in &fragments[..2] {
        node.transport.on_inbound(&from, &fragment.encode().unwrap());
    }
    let (message, _) = next_message(mesh.inbox(0)).await.expect("reassembled");
    assert_eq!(message.payload(), original.payload());
    assert!(mesh.node(0).transport.codec().store().is_empty());
}

#[tokio::test]
async fn test_duplicate_fragment_after_completion_ignored() {
    let mut mesh = Mesh::new(1, TransportConfig::default());
    let from = LinkAddress::from("remote");
    let original = Message::new(MessageType::Message, peer(7), payload(1200));
    let fragments = mesh.node(0).transport.codec().split(&original).unwrap();

    for fragment in &fragments {
        mesh.node(0).transport.on_inbound(&from, &fragment.encode().unwrap());
    }
    next_message(mesh.inbox(0)).await.expect("reassembled");

    mesh.node(0).transport.on_inbound(&from, &fragments[0].encode().unwrap());
    assert_eq!(mesh.node(0).transport.codec().store().len(), 1);
    assert!(stays_quiet(mesh.inbox(0), Duration::from_millis(50)).await);
}
