//! Sessions talking through a real WebSocket relay on loopback.

use std::sync::Arc;
use std::time::Duration;

use quill_sync::{
    Block, CollabSession, MemoryStore, RelayConfig, RelayServer, ReplicaId, RichTree,
    SessionConfig, SessionHandle, TreeMutation, WsTransport,
};
use tokio::time::{sleep, timeout, Instant};
use uuid::Uuid;

const DEADLINE: Duration = Duration::from_secs(5);

async fn start_relay() -> (Arc<RelayServer>, String) {
    let server = Arc::new(RelayServer::new(RelayConfig::for_testing()));
    let (addr, _task) = server.clone().spawn().await.unwrap();
    (server, format!("ws://{addr}"))
}

fn join(url: &str, doc_id: Uuid, name: &str) -> SessionHandle {
    CollabSession::spawn(
        doc_id,
        ReplicaId::new(name),
        Box::new(WsTransport::new(url)),
        Box::new(MemoryStore::new()),
        Box::new(RichTree::new()),
        SessionConfig::for_testing().with_user_name(name),
    )
    .unwrap()
}

async fn converge(sessions: &[&SessionHandle], expected: &str) {
    let start = Instant::now();
    loop {
        let mut contents = Vec::new();
        for s in sessions {
            contents.push(s.content().await.unwrap());
        }
        if contents.iter().all(|c| c == expected) {
            return;
        }
        assert!(start.elapsed() < DEADLINE, "no convergence on {expected:?}: {contents:?}");
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_two_sessions_converge_through_relay() {
    let (server, url) = start_relay().await;
    let doc_id = Uuid::new_v4();
    let a = join(&url, doc_id, "a");
    let b = join(&url, doc_id, "b");
    timeout(DEADLINE, a.wait_synced()).await.unwrap().unwrap();
    timeout(DEADLINE, b.wait_synced()).await.unwrap().unwrap();

    a.edit(TreeMutation::InsertBlock {
        index: 0,
        block: Block::heading(1, "Relay"),
    })
    .await
    .unwrap();
    converge(&[&a, &b], "Relay").await;

    b.edit(TreeMutation::insert_text(0, 5, "ed")).await.unwrap();
    converge(&[&a, &b], "Relayed").await;
    assert_eq!(b.tree().await.unwrap(), vec![Block::heading(1, "Relayed")]);

    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 2);
    assert!(stats.total_messages > 0);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_late_join_through_relay() {
    let (_server, url) = start_relay().await;
    let doc_id = Uuid::new_v4();
    let a = join(&url, doc_id, "a");
    timeout(DEADLINE, a.wait_synced()).await.unwrap().unwrap();
    a.edit(TreeMutation::InsertBlock {
        index: 0,
        block: Block::paragraph("already here"),
    })
    .await
    .unwrap();

    let b = join(&url, doc_id, "b");
    timeout(DEADLINE, b.wait_synced()).await.unwrap().unwrap();
    converge(&[&a, &b], "already here").await;

    // Presence crosses the relay too.
    timeout(DEADLINE, b.wait_for(|s| s.awareness_entries.iter().any(|e| e.display_name() == "a")))
        .await
        .unwrap()
        .unwrap();

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_documents_are_isolated_on_relay() {
    let (_server, url) = start_relay().await;
    let first = join(&url, Uuid::new_v4(), "a");
    let second = join(&url, Uuid::new_v4(), "b");
    timeout(DEADLINE, first.wait_synced()).await.unwrap().unwrap();
    timeout(DEADLINE, second.wait_synced()).await.unwrap().unwrap();

    first
        .edit(TreeMutation::InsertBlock {
            index: 0,
            block: Block::paragraph("private"),
        })
        .await
        .unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(second.content().await.unwrap(), "");
    assert_eq!(second.stats().await.unwrap().adapter.materializations, 0);
    assert!(second.status().awareness_entries.is_empty());

    first.close().await.unwrap();
    second.close().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_relay_keeps_session_usable() {
    // Nothing listens here; edits queue until a relay shows up.
    let session = join("ws://127.0.0.1:9", Uuid::new_v4(), "offline");
    session
        .edit(TreeMutation::InsertBlock {
            index: 0,
            block: Block::paragraph("typed offline"),
        })
        .await
        .unwrap();
    assert_eq!(session.content().await.unwrap(), "typed offline");
    assert!(!session.status().connected);
    assert_eq!(session.stats().await.unwrap().offline_queue, 2);
    session.close().await.unwrap();
}
