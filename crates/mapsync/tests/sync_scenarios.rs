//! End-to-end sync scenarios
//!
//! These tests drive whole sessions through the public API: concurrent edits
//! from two participants, delete/update and move/move races, offline queue
//! drain and the delivery retry bound.

use chrono::{DateTime, TimeZone, Utc};
use mapsync::{
    detect_conflict, CausalClock, ConflictResolver, DeliveryError, MemoryTransport, Operation,
    OperationDraft, OperationType, ParticipantId, Payload, SyncConfig, SyncError, SyncEvent,
    SyncSession, TargetId, Transport,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// A session plus the handles a test needs to poke it.
struct Client {
    session: SyncSession<MemoryTransport>,
    transport: Arc<MemoryTransport>,
    network: watch::Sender<bool>,
}

impl Client {
    fn new(participant: &str) -> Self {
        let transport = Arc::new(MemoryTransport::new());
        let (network, network_rx) = watch::channel(false);
        let session = SyncSession::new(
            "map-1",
            participant,
            transport.clone(),
            network_rx,
            SyncConfig::default(),
        );
        Self {
            session,
            transport,
            network,
        }
    }

    async fn edit(&mut self, kind: OperationType, target: &str, data: Value) -> Operation {
        let id = self
            .session
            .add_operation(draft(kind, target, data))
            .await
            .unwrap();
        self.session
            .state()
            .queue()
            .get(id)
            .cloned()
            .unwrap()
    }

    async fn go_online(&mut self) {
        self.network.send_replace(true);
        self.session.on_network_change().await;
    }

    fn text(&self, target: &str) -> Option<String> {
        self.session
            .document()
            .get(&TargetId::new(target))
            .map(|n| n.text.clone())
    }
}

fn draft(kind: OperationType, target: &str, data: Value) -> OperationDraft {
    OperationDraft::new(
        kind,
        "map-1",
        target,
        data.as_object().cloned().unwrap_or_else(Payload::new),
    )
}

fn at(secs: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, secs).unwrap()
}

fn stamped(
    kind: OperationType,
    who: &str,
    clock: &[(&str, u64)],
    secs: u32,
    data: Value,
) -> Operation {
    Operation::from_draft(
        draft(kind, "node-1", data),
        ParticipantId::new(who),
        CausalClock::from_entries(clock.iter().copied()),
    )
    .with_timestamp(at(secs))
}

// ================== Conflict Scenarios ==================

#[test]
fn test_concurrent_text_edits_resolve_to_latest() {
    let world = stamped(
        OperationType::Update,
        "user_1",
        &[("user_1", 2), ("user_2", 1)],
        0,
        json!({"text": "Hello World"}),
    );
    let japan = stamped(
        OperationType::Update,
        "user_2",
        &[("user_1", 1), ("user_2", 2)],
        1,
        json!({"text": "Hello Japan"}),
    );

    assert!(detect_conflict(&japan.causal_clock, &world.causal_clock));

    // user_1's replica: its own edit is recorded first.
    let mut resolver = ConflictResolver::new();
    resolver.resolve_conflict(world.clone()).unwrap();
    let resolution = resolver.resolve_conflict(japan.clone()).unwrap();

    assert!(resolution.should_apply);
    assert_eq!(resolution.resolved_operation.data["text"], json!("Hello Japan"));
    assert_eq!(resolution.local_updates[0].data["text"], json!("Hello Japan"));

    // user_2's replica sees the same pair the other way round.
    let mut resolver = ConflictResolver::new();
    resolver.resolve_conflict(japan).unwrap();
    let resolution = resolver.resolve_conflict(world).unwrap();

    assert_eq!(resolution.resolved_operation.data["text"], json!("Hello Japan"));
    assert_eq!(
        resolution.conflict_info.map(|info| info.conflict_count),
        Some(1)
    );
}

#[test]
fn test_delete_wins_over_concurrent_update() {
    let delete = stamped(OperationType::Delete, "user_1", &[("user_1", 1)], 0, json!({}));
    let update = stamped(
        OperationType::Update,
        "user_2",
        &[("user_2", 1)],
        5,
        json!({"text": "late edit"}),
    );

    let mut resolver = ConflictResolver::new();
    resolver.resolve_conflict(delete.clone()).unwrap();
    let resolution = resolver.resolve_conflict(update).unwrap();

    assert!(!resolution.should_apply);
    assert!(resolution.resolved_operation.is_noop());
    assert!(resolution.local_updates.is_empty());
}

#[tokio::test]
async fn test_two_sessions_converge_on_concurrent_edits() {
    let mut alice = Client::new("user_1");
    let mut bob = Client::new("user_2");

    let create = alice
        .edit(OperationType::Create, "n1", json!({"text": "Hello"}))
        .await;
    bob.session.receive_remote(create).unwrap();

    let world = alice
        .edit(OperationType::Update, "n1", json!({"text": "Hello World"}))
        .await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let japan = bob
        .edit(OperationType::Update, "n1", json!({"text": "Hello Japan"}))
        .await;

    bob.session.receive_remote(world).unwrap();
    alice.session.receive_remote(japan).unwrap();

    assert_eq!(alice.text("n1").as_deref(), Some("Hello Japan"));
    assert_eq!(bob.text("n1").as_deref(), Some("Hello Japan"));
}

#[tokio::test]
async fn test_two_sessions_converge_on_delete_vs_update() {
    let mut alice = Client::new("user_1");
    let mut bob = Client::new("user_2");

    let create = alice.edit(OperationType::Create, "n1", json!({})).await;
    bob.session.receive_remote(create).unwrap();
    let child = alice
        .edit(OperationType::Create, "n2", json!({"parent_id": "n1"}))
        .await;
    bob.session.receive_remote(child).unwrap();

    let delete = alice.edit(OperationType::Delete, "n1", json!({})).await;
    let update = bob
        .edit(OperationType::Update, "n1", json!({"text": "keep me"}))
        .await;
    let update_id = update.id;

    let on_alice = alice.session.receive_remote(update).unwrap();
    let on_bob = bob.session.receive_remote(delete).unwrap();

    assert!(!on_alice.should_apply);
    assert!(on_bob.should_apply);
    assert!(on_bob.local_updates[0].is_noop());
    assert!(alice.session.document().is_empty());
    assert!(bob.session.document().is_empty());

    // Bob's losing update reaches the authority as a noop.
    bob.go_online().await;
    let sent: Vec<_> = bob
        .transport
        .delivered()
        .iter()
        .map(|op| (op.id, op.operation_type))
        .collect();
    assert_eq!(sent, vec![(update_id, OperationType::Noop)]);

    alice.go_online().await;
    let sent: Vec<_> = alice
        .transport
        .delivered()
        .iter()
        .map(|op| op.operation_type)
        .collect();
    assert_eq!(
        sent,
        vec![OperationType::Create, OperationType::Create, OperationType::Delete]
    );
}

#[tokio::test]
async fn test_two_sessions_converge_on_crossing_moves() {
    let mut alice = Client::new("user_1");
    let mut bob = Client::new("user_2");

    for target in ["a", "b"] {
        let create = alice.edit(OperationType::Create, target, json!({})).await;
        bob.session.receive_remote(create).unwrap();
    }

    let a_under_b = alice
        .edit(OperationType::Move, "a", json!({"parent_id": "b"}))
        .await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let b_under_a = bob
        .edit(OperationType::Move, "b", json!({"parent_id": "a"}))
        .await;

    let on_alice = alice.session.receive_remote(b_under_a).unwrap();
    let on_bob = bob.session.receive_remote(a_under_b).unwrap();

    assert!(on_alice.should_apply);
    assert!(!on_bob.should_apply);
    assert!(on_bob.resolved_operation.is_noop());

    // The later move stands; the node moved by the earlier one is a root.
    let (a, b) = (TargetId::new("a"), TargetId::new("b"));
    for client in [&alice, &bob] {
        let document = client.session.document();
        assert_eq!(document.parent(&a), None);
        assert_eq!(document.parent(&b), Some(&a));
    }
}

// ================== Queue Scenarios ==================

#[tokio::test(start_paused = true)]
async fn test_offline_queue_drains_in_order() {
    let mut client = Client::new("user_1");
    let mut events = client.session.subscribe();

    let mut enqueued = Vec::new();
    for target in ["n1", "n2", "n3"] {
        let op = client
            .edit(OperationType::Create, target, json!({"text": target}))
            .await;
        enqueued.push(op.id);
    }
    assert!(client.transport.attempts().is_empty());
    assert_eq!(client.session.status().pending_operations, 3);

    client.go_online().await;

    let delivered: Vec<_> = client.transport.delivered().iter().map(|op| op.id).collect();
    assert_eq!(delivered, enqueued);
    assert_eq!(client.transport.attempts(), enqueued);
    assert_eq!(client.session.status().pending_operations, 0);

    let me = ParticipantId::new("user_1");
    assert_eq!(client.transport.authority_clock().get(&me), 3);

    let order: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|e| match e {
            SyncEvent::OperationDelivered { id } => Some(id),
            _ => None,
        })
        .collect();
    assert_eq!(order, enqueued);
}

#[tokio::test(start_paused = true)]
async fn test_retry_bound_moves_operation_to_dead_letters() {
    let mut client = Client::new("user_1");
    client.go_online().await;
    client
        .transport
        .fail_all_sends(Some(DeliveryError::Unavailable("service down".into())));

    let op = client.edit(OperationType::Create, "n1", json!({})).await;

    assert_eq!(client.transport.attempts(), vec![op.id; 3]);
    assert!(client.session.state().queue().is_empty());
    assert_eq!(client.session.dead_letters().len(), 1);
    assert_eq!(client.session.dead_letters()[0].id, op.id);
    assert_eq!(client.session.dead_letters()[0].retry_count, 3);
    assert!(client.session.has_unsynced_changes());
    assert!(client.session.status().has_unsynced_changes());

    // The optimistic local application stays in place.
    assert!(client.session.document().contains(&TargetId::new("n1")));
}

#[tokio::test(start_paused = true)]
async fn test_offline_during_delivery_keeps_queue() {
    let mut client = Client::new("user_1");
    client.go_online().await;
    client.transport.set_latency(Some(Duration::from_secs(2)));

    let network = client.network.clone();
    let session = &mut client.session;
    let (result, _) = tokio::join!(
        session.add_operation(draft(OperationType::Create, "n1", json!({}))),
        async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            network.send_replace(false);
        }
    );
    let id = result.unwrap();
    client.session.on_network_change().await;

    let status = client.session.status();
    assert!(!status.is_online && !status.is_connected);
    assert!(client.transport.delivered().is_empty());
    let queued = client.session.state().queue().get(id).unwrap();
    assert_eq!(queued.retry_count, 0);

    client.transport.set_latency(None);
    client.go_online().await;
    assert_eq!(client.transport.delivered().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pushed_operations_flow_through_run_loop() {
    let mut client = Client::new("user_1");
    let incoming = client.transport.subscribe_incoming();
    let shutdown = client.session.shutdown_handle();
    let transport = client.transport.clone();
    let network = client.network.clone();

    let remote = Operation::from_draft(
        draft(OperationType::Create, "n1", json!({"text": "from afar"})),
        ParticipantId::new("user_2"),
        CausalClock::from_entries([("user_2", 1)]),
    );

    let session = &mut client.session;
    tokio::join!(session.run(incoming), async move {
        network.send_replace(true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        transport.push_remote(remote);
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.shutdown();
    });

    assert!(client.session.status().is_connected);
    assert_eq!(client.text("n1").as_deref(), Some("from afar"));
    let them = ParticipantId::new("user_2");
    assert_eq!(client.session.state().queue().clock().get(&them), 1);
}

// ================== Wire Validation ==================

#[tokio::test]
async fn test_malformed_wire_operations_are_rejected() {
    let mut client = Client::new("user_1");

    let missing_target = r#"{
        "id": "6f1c1d2e-8a53-4b8e-9a53-2f1f5d0c9b11",
        "operation_type": "update",
        "document_id": "map-1",
        "causal_clock": {"user_2": 1},
        "participant_id": "user_2",
        "timestamp": "2024-01-01T10:00:00Z"
    }"#;
    assert_eq!(
        Operation::from_json(missing_target),
        Err(SyncError::MalformedOperation { field: "target_id" })
    );

    let mut no_participant = stamped(OperationType::Update, "user_2", &[("user_2", 1)], 0, json!({}));
    no_participant.participant_id = ParticipantId::new("");
    assert_eq!(
        client.session.receive_remote(no_participant),
        Err(SyncError::MalformedOperation {
            field: "participant_id"
        })
    );
    assert!(client.session.document().is_empty());
}
