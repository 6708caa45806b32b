//! End-to-end session behaviour over the in-process bus: echo suppression,
//! late join, partitions, awareness expiry, teardown persistence, and
//! recovery from a transport that refuses sends.

use quill_sync::adapter::tree::{Block, RichTree, TreeMutation};
use quill_sync::error::StorageError;
use quill_sync::presence::{AwarenessField, Connectivity};
use quill_sync::session::{CollabSession, SessionConfig, SessionEvent, SessionHandle};
use quill_sync::storage::MemoryStore;
use quill_sync::protocol::{MessageType, SyncMessage};
use quill_sync::transport::local::{LinkHandle, LocalBus, LocalTransport};
use quill_sync::transport::{EventSender, Transport, TransportError};
use quill_sync::{ReplicaId, SessionError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use uuid::Uuid;

const DEADLINE: Duration = Duration::from_secs(3);

fn start(bus: &LocalBus, doc_id: Uuid, name: &str, store: MemoryStore) -> (SessionHandle, LinkHandle) {
    start_with(bus, doc_id, name, store, RichTree::new(), SessionConfig::for_testing())
}

fn start_with(
    bus: &LocalBus,
    doc_id: Uuid,
    name: &str,
    store: MemoryStore,
    tree: RichTree,
    config: SessionConfig,
) -> (SessionHandle, LinkHandle) {
    let (transport, link) = bus.endpoint();
    let session = CollabSession::spawn(
        doc_id,
        ReplicaId::new(name),
        Box::new(transport),
        Box::new(store),
        Box::new(tree),
        config,
    )
    .unwrap();
    (session, link)
}

async fn synced(session: &SessionHandle) {
    timeout(DEADLINE, session.wait_synced())
        .await
        .expect("session never synced")
        .unwrap();
}

/// Poll every session until they all render `expected`.
async fn converge(sessions: &[&SessionHandle], expected: &str) {
    let start = Instant::now();
    loop {
        let mut all = true;
        for s in sessions {
            if s.content().await.unwrap() != expected {
                all = false;
            }
        }
        if all {
            return;
        }
        if start.elapsed() > DEADLINE {
            let mut seen = Vec::new();
            for s in sessions {
                seen.push(s.content().await.unwrap());
            }
            panic!("sessions did not converge on {expected:?}: {seen:?}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Outcome per upcoming delta send: `None` lets it through, `Some(Ok(()))`
/// reports success but never sends, `Some(Err(_))` refuses it.
type Faults = Arc<Mutex<VecDeque<Option<Result<(), TransportError>>>>>;

/// Bus endpoint whose delta sends misbehave on cue; everything else passes through.
struct FaultyTransport {
    inner: LocalTransport,
    faults: Faults,
}

impl Transport for FaultyTransport {
    fn connect(&mut self, events: EventSender) -> Result<(), TransportError> {
        self.inner.connect(events)
    }

    fn disconnect(&mut self) {
        self.inner.disconnect();
    }

    fn subscribe(&mut self, channel: &str) -> Result<(), TransportError> {
        self.inner.subscribe(channel)
    }

    fn unsubscribe(&mut self, channel: &str) -> Result<(), TransportError> {
        self.inner.unsubscribe(channel)
    }

    fn broadcast(&mut self, channel: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let is_delta = SyncMessage::decode(&payload).is_ok_and(|m| m.msg_type == MessageType::Delta);
        if is_delta {
            if let Some(Some(outcome)) = self.faults.lock().unwrap().pop_front() {
                return outcome;
            }
        }
        self.inner.broadcast(channel, payload)
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}

fn start_faulty(bus: &LocalBus, doc_id: Uuid, name: &str) -> (SessionHandle, LinkHandle, Faults) {
    let (inner, link) = bus.endpoint();
    let faults = Faults::default();
    let transport = FaultyTransport {
        inner,
        faults: faults.clone(),
    };
    let session = CollabSession::spawn(
        doc_id,
        ReplicaId::new(name),
        Box::new(transport),
        Box::new(MemoryStore::new()),
        Box::new(RichTree::new()),
        SessionConfig::for_testing(),
    )
    .unwrap();
    (session, link, faults)
}

fn insert_block(index: usize, text: &str) -> TreeMutation {
    TreeMutation::InsertBlock {
        index,
        block: Block::paragraph(text),
    }
}

#[tokio::test]
async fn test_edit_reaches_peer_and_echo_is_dropped() {
    let bus = LocalBus::new(256);
    let doc_id = Uuid::new_v4();
    let (a, _) = start(&bus, doc_id, "a", MemoryStore::new());
    let (b, _) = start(&bus, doc_id, "b", MemoryStore::new());
    synced(&a).await;
    synced(&b).await;

    a.edit(insert_block(0, "hello")).await.unwrap();
    converge(&[&a, &b], "hello").await;

    let a_stats = a.stats().await.unwrap();
    assert!(a_stats.sync.echoes_dropped >= 1, "own delta must come back as an echo");
    assert_eq!(a_stats.adapter.materializations, 0, "echo never re-applied");
    assert_eq!(b.tree().await.unwrap(), vec![Block::paragraph("hello")]);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_remote_materialization_is_not_rebroadcast() {
    let bus = LocalBus::new(256);
    let doc_id = Uuid::new_v4();
    let (a, _) = start(&bus, doc_id, "a", MemoryStore::new());
    let (b, _) = start(&bus, doc_id, "b", MemoryStore::new());
    synced(&a).await;
    synced(&b).await;

    a.edit(insert_block(0, "one")).await.unwrap();
    a.edit(TreeMutation::insert_text(0, 3, " two")).await.unwrap();
    converge(&[&a, &b], "one two").await;

    let b_stats = b.stats().await.unwrap();
    assert_eq!(b_stats.sync.deltas_sent, 0);
    assert_eq!(b_stats.adapter.local_edits, 0);
    assert!(b_stats.suppressed_notifications > 0);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_late_joiner_catches_up() {
    let bus = LocalBus::new(256);
    let doc_id = Uuid::new_v4();
    let (a, _) = start(&bus, doc_id, "a", MemoryStore::new());
    synced(&a).await;
    a.edit(insert_block(0, "written before b existed")).await.unwrap();
    a.edit(TreeMutation::InsertBlock {
        index: 1,
        block: Block::heading(2, "Agenda"),
    })
    .await
    .unwrap();

    let (b, _) = start(&bus, doc_id, "b", MemoryStore::new());
    synced(&b).await;
    converge(&[&a, &b], "written before b existed\nAgenda").await;
    assert_eq!(a.tree().await.unwrap(), b.tree().await.unwrap());

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_partitioned_edits_merge_after_reconnect() {
    let bus = LocalBus::new(256);
    let doc_id = Uuid::new_v4();
    let (a, _) = start(&bus, doc_id, "a", MemoryStore::new());
    let (b, b_link) = start(&bus, doc_id, "b", MemoryStore::new());
    synced(&a).await;
    synced(&b).await;
    a.edit(insert_block(0, "base")).await.unwrap();
    converge(&[&a, &b], "base").await;

    let mut b_events = b.subscribe_events();
    b_link.sever();
    timeout(DEADLINE, b.wait_for(|s| !s.connected)).await.unwrap().unwrap();

    a.edit(insert_block(1, "from a")).await.unwrap();
    b.edit(insert_block(1, "from b")).await.unwrap();
    // Block break plus its text.
    assert_eq!(b.stats().await.unwrap().offline_queue, 2);

    b_link.restore();
    timeout(DEADLINE, b.wait_for(|s| s.connected)).await.unwrap().unwrap();

    // Equal clocks: "b" sorts before "a" among siblings after "base".
    converge(&[&a, &b], "base\nfrom b\nfrom a").await;
    assert_eq!(b.stats().await.unwrap().offline_queue, 0);

    let mut saw_disconnect = false;
    while let Ok(event) = b_events.try_recv() {
        saw_disconnect |= matches!(event, SessionEvent::Disconnected { .. });
    }
    assert!(saw_disconnect);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_awareness_propagates_and_expires_on_silence() {
    let bus = LocalBus::new(256);
    let doc_id = Uuid::new_v4();
    let config = SessionConfig::for_testing().with_user_name("Ada");
    let (a, a_link) = start_with(&bus, doc_id, "a", MemoryStore::new(), RichTree::new(), config);
    let (b, _) = start(&bus, doc_id, "b", MemoryStore::new());
    synced(&a).await;
    synced(&b).await;

    timeout(DEADLINE, b.wait_for(|s| s.awareness_entries.len() == 1))
        .await
        .unwrap()
        .unwrap();
    let entry = b.status().awareness_entries[0].clone();
    assert_eq!(entry.replica, ReplicaId::new("a"));
    assert_eq!(entry.display_name(), "Ada");

    a.edit(insert_block(0, "cursor here")).await.unwrap();
    converge(&[&a, &b], "cursor here").await;
    a.set_cursor(1, 4).await.unwrap();
    let start = Instant::now();
    loop {
        let cursors = b.remote_cursors().await.unwrap();
        if cursors.first().is_some_and(|c| (c.anchor, c.head) == (1, 4)) {
            assert_eq!(cursors[0].name, "Ada");
            break;
        }
        assert!(start.elapsed() < DEADLINE, "cursor never arrived: {cursors:?}");
        sleep(Duration::from_millis(10)).await;
    }

    // Ungraceful loss: no offline message, only silence.
    a_link.sever();
    let start = Instant::now();
    while !b.status().awareness_entries.is_empty() {
        assert!(start.elapsed() < DEADLINE, "entry never expired");
        sleep(Duration::from_millis(20)).await;
    }

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_close_sends_offline_and_persists() {
    let bus = LocalBus::new(256);
    let doc_id = Uuid::new_v4();
    let store = MemoryStore::new();
    let config = SessionConfig {
        persistence: quill_sync::PersistenceConfig {
            save_every: 1000,
            ..quill_sync::PersistenceConfig::for_testing()
        },
        ..SessionConfig::for_testing()
    };
    let (a, _) = start_with(&bus, doc_id, "a", store.clone(), RichTree::new(), config);
    let (b, _) = start(&bus, doc_id, "b", MemoryStore::new());
    synced(&a).await;
    synced(&b).await;
    timeout(DEADLINE, b.wait_for(|s| s.awareness_entries.len() == 1))
        .await
        .unwrap()
        .unwrap();

    a.edit(insert_block(0, "keep me")).await.unwrap();
    assert_eq!(store.writes(), 0, "batched until close");
    a.close().await.unwrap();
    assert!(store.contains(doc_id));
    assert_eq!(a.edit(insert_block(0, "late")).await, Err(SessionError::Closed));

    // Explicit offline signal removes a from b's table well before the timeout.
    timeout(Duration::from_millis(250), b.wait_for(|s| s.awareness_entries.is_empty()))
        .await
        .unwrap()
        .unwrap();

    // A later session on the same store has the text before any network sync.
    let offline_bus = LocalBus::new(16);
    let (reopened, link) = start(&offline_bus, doc_id, "a2", store.clone());
    link.sever();
    assert_eq!(reopened.content().await.unwrap(), "keep me");

    reopened.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_tree_content_seeds_empty_document() {
    let bus = LocalBus::new(256);
    let doc_id = Uuid::new_v4();
    let tree = RichTree::with_blocks(vec![Block::heading(1, "Draft"), Block::paragraph("body")]);
    let (a, _) = start_with(&bus, doc_id, "a", MemoryStore::new(), tree, SessionConfig::for_testing());
    let (b, _) = start(&bus, doc_id, "b", MemoryStore::new());
    synced(&a).await;
    synced(&b).await;

    converge(&[&a, &b], "Draft\nbody").await;
    assert_eq!(b.tree().await.unwrap()[0], Block::heading(1, "Draft"));

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_persistence_exhaustion_is_fatal_event() {
    let bus = LocalBus::new(256);
    let store = MemoryStore::new();
    let (a, _) = start(&bus, Uuid::new_v4(), "a", store.clone());
    let mut events = a.subscribe_events();
    store.set_failing(true);

    for i in 0..4 {
        a.edit(insert_block(i, "x")).await.unwrap();
    }
    let fatal = timeout(DEADLINE, async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Fatal(e)) => break e,
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .unwrap();
    assert!(matches!(fatal, SessionError::Storage(StorageError::Exhausted { .. })));
    assert!(fatal.is_fatal());

    // Edits still work; the caller decides what to do.
    a.edit(insert_block(0, "still editable")).await.unwrap();
    a.close().await.unwrap();
}

#[tokio::test]
async fn test_connectivity_field_propagates() {
    let bus = LocalBus::new(256);
    let doc_id = Uuid::new_v4();
    let (a, _) = start(&bus, doc_id, "a", MemoryStore::new());
    let (b, _) = start(&bus, doc_id, "b", MemoryStore::new());
    synced(&a).await;
    synced(&b).await;

    a.set_awareness(AwarenessField::Connectivity(Connectivity::Away))
        .await
        .unwrap();
    timeout(
        DEADLINE,
        b.wait_for(|s| {
            s.awareness_entries
                .iter()
                .any(|e| e.state.connectivity == Connectivity::Away)
        }),
    )
    .await
    .unwrap()
    .unwrap();

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_typing_into_blank_paragraph() {
    let bus = LocalBus::new(256);
    let doc_id = Uuid::new_v4();
    let blank = RichTree::with_blocks(vec![Block::paragraph("")]);
    let (a, _) = start_with(&bus, doc_id, "a", MemoryStore::new(), blank, SessionConfig::for_testing());
    let (b, _) = start(&bus, doc_id, "b", MemoryStore::new());
    synced(&a).await;
    synced(&b).await;
    assert_eq!(a.tree().await.unwrap(), vec![Block::paragraph("")]);

    a.edit(TreeMutation::insert_text(0, 0, "hi")).await.unwrap();
    assert_eq!(a.tree().await.unwrap(), vec![Block::paragraph("hi")]);
    converge(&[&a, &b], "hi").await;
    assert_eq!(b.tree().await.unwrap(), vec![Block::paragraph("hi")]);
    assert_eq!(a.stats().await.unwrap().adapter.fallbacks, 0);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_noticed_during_inbound_flood() {
    let bus = LocalBus::new(4096);
    let doc_id = Uuid::new_v4();
    let (a, a_link) = start(&bus, doc_id, "a", MemoryStore::new());
    let (b, _) = start(&bus, doc_id, "b", MemoryStore::new());
    synced(&a).await;
    synced(&b).await;

    b.edit(insert_block(0, "")).await.unwrap();
    for i in 0..300 {
        b.edit(TreeMutation::insert_text(0, i, "z")).await.unwrap();
    }
    a_link.sever();
    timeout(DEADLINE, a.wait_for(|s| !s.connected))
        .await
        .expect("disconnect never surfaced")
        .unwrap();

    a_link.restore();
    timeout(DEADLINE, a.wait_for(|s| s.connected)).await.unwrap().unwrap();
    converge(&[&a, &b], &"z".repeat(300)).await;

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_refused_send_while_connected_triggers_reconnect() {
    let bus = LocalBus::new(256);
    let doc_id = Uuid::new_v4();
    let (a, _, faults) = start_faulty(&bus, doc_id, "a");
    let (b, _) = start(&bus, doc_id, "b", MemoryStore::new());
    synced(&a).await;
    synced(&b).await;
    let mut events = a.subscribe_events();

    // The link is gone but no disconnect was ever reported.
    faults.lock().unwrap().push_back(Some(Err(TransportError::NotConnected)));
    a.edit(insert_block(0, "sent again later")).await.unwrap();

    let reason = timeout(DEADLINE, async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Disconnected { reason }) => break reason,
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("refused send never became a disconnect");
    assert!(reason.contains("not connected"), "{reason}");

    timeout(DEADLINE, a.wait_for(|s| s.connected)).await.unwrap().unwrap();
    converge(&[&a, &b], "sent again later").await;
    assert_eq!(a.stats().await.unwrap().offline_queue, 0);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_interrupted_replay_drains_while_connected() {
    let bus = LocalBus::new(256);
    let doc_id = Uuid::new_v4();
    let (a, a_link, faults) = start_faulty(&bus, doc_id, "a");
    let (b, _) = start(&bus, doc_id, "b", MemoryStore::new());
    synced(&a).await;
    synced(&b).await;

    a_link.sever();
    timeout(DEADLINE, a.wait_for(|s| !s.connected)).await.unwrap().unwrap();
    for i in 0..3 {
        a.edit(insert_block(i, &format!("p{i}"))).await.unwrap();
    }
    assert_eq!(a.stats().await.unwrap().offline_queue, 6);

    // The replay gets one delta out, then the transport queue is full.
    faults
        .lock()
        .unwrap()
        .extend([None, Some(Err(TransportError::QueueFull))]);
    a_link.restore();
    timeout(DEADLINE, a.wait_for(|s| s.connected)).await.unwrap().unwrap();

    for i in 3..8 {
        a.edit(insert_block(i, &format!("p{i}"))).await.unwrap();
    }
    let expected: Vec<String> = (0..8).map(|i| format!("p{i}")).collect();
    converge(&[&a, &b], &expected.join("\n")).await;

    let stats = a.stats().await.unwrap();
    assert_eq!(stats.offline_queue, 0);
    assert_eq!(stats.sync.deltas_sent, 16);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_lost_delta_recovered_without_reconnect() {
    let bus = LocalBus::new(256);
    let doc_id = Uuid::new_v4();
    let (a, _, faults) = start_faulty(&bus, doc_id, "a");
    let (b, _) = start(&bus, doc_id, "b", MemoryStore::new());
    synced(&a).await;
    synced(&b).await;

    // The block break vanishes in transit; only its text arrives.
    faults.lock().unwrap().push_back(Some(Ok(())));
    a.edit(insert_block(0, "gap")).await.unwrap();

    converge(&[&a, &b], "gap").await;
    let stats = b.stats().await.unwrap();
    assert_eq!(stats.pending_ops, 0);
    assert!(stats.sync.gap_requests >= 1);
    assert_eq!(stats.sync.reconnect_attempts, 0);
    assert!(b.status().connected);

    a.close().await.unwrap();
    b.close().await.unwrap();
}
