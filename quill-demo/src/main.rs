//! Quill demo: drives `quill-sync` sessions from the command line.
//!
//! - `local`: several replicas on an in-process bus edit concurrently, one is
//!   partitioned and rejoins, and all of them converge
//! - `relay`: run the WebSocket fan-out relay
//! - `join`: connect one replica to a relay, type a paragraph, print the result

use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use quill_sync::{
    AwarenessField, Block, CollabSession, Connectivity, LocalBus, MemoryStore, RelayConfig,
    RelayServer, ReplicaId, RichTree, RocksStore, SessionConfig, SessionError, SessionHandle,
    SnapshotStore, StoreConfig, TreeMutation, WsTransport,
};

#[derive(Parser, Debug)]
#[command(name = "quill-demo", version, about = "Collaborative document sync demo")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// In-process multi-replica demo.
    Local {
        #[arg(long, default_value_t = 3)]
        replicas: usize,
        /// Persist replica snapshots under this directory.
        #[arg(long, value_name = "DIR")]
        store: Option<PathBuf>,
    },
    /// Run the WebSocket relay.
    Relay {
        #[arg(long, default_value = "127.0.0.1:9090")]
        bind: String,
    },
    /// Join a document through a relay.
    Join {
        #[arg(long, default_value = "ws://127.0.0.1:9090")]
        url: String,
        #[arg(long)]
        doc: Uuid,
        #[arg(long, default_value = "guest")]
        name: String,
        #[arg(long)]
        text: Option<String>,
        /// Stay connected this long before leaving.
        #[arg(long, default_value_t = 5)]
        seconds: u64,
        #[arg(long, value_name = "DIR")]
        store: Option<PathBuf>,
    },
}

type DemoResult = Result<(), Box<dyn std::error::Error>>;

fn open_store(dir: Option<&PathBuf>, replica: &str) -> Result<Box<dyn SnapshotStore>, SessionError> {
    match dir {
        Some(dir) => Ok(Box::new(RocksStore::open(StoreConfig {
            path: dir.join(replica),
            ..StoreConfig::default()
        })?)),
        None => Ok(Box::new(MemoryStore::new())),
    }
}

async fn run_local(replicas: usize, store: Option<PathBuf>) -> DemoResult {
    let bus = LocalBus::default();
    let doc_id = Uuid::new_v4();
    let mut sessions: Vec<SessionHandle> = Vec::new();
    let mut links = Vec::new();

    for i in 0..replicas.max(2) {
        let name = format!("user{i}");
        let (transport, link) = bus.endpoint();
        let config = SessionConfig::default().with_user_name(name.clone());
        let session = CollabSession::spawn(
            doc_id,
            ReplicaId::generate(&name),
            Box::new(transport),
            open_store(store.as_ref(), &name)?,
            Box::new(RichTree::new()),
            config,
        )?;
        info!("Started {} on {doc_id}", session.replica_id());
        sessions.push(session);
        links.push(link);
    }
    for session in &sessions {
        tokio::time::timeout(Duration::from_secs(10), session.wait_synced()).await??;
    }

    sessions[0]
        .edit(TreeMutation::InsertBlock {
            index: 0,
            block: Block::heading(1, "Meeting notes"),
        })
        .await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The last replica goes offline and keeps typing.
    let offline = sessions.len() - 1;
    links[offline].sever();
    for (i, session) in sessions.iter().enumerate() {
        session
            .edit(TreeMutation::InsertBlock {
                index: 1,
                block: Block::paragraph(&format!("point from user{i}")),
            })
            .await?;
        session.set_cursor(0, 7).await?;
    }
    sessions[0]
        .set_awareness(AwarenessField::Connectivity(Connectivity::Away))
        .await?;

    links[offline].restore();
    tokio::time::sleep(Duration::from_secs(3)).await;

    let expected = sessions[0].content().await?;
    for session in &sessions {
        let content = session.content().await?;
        let status = session.status();
        println!(
            "{:<16} connected={} synced={} peers={} converged={}",
            session.replica_id().to_string(),
            status.connected,
            status.synced,
            status.awareness_entries.len(),
            content == expected
        );
    }
    println!("\n{expected}");

    for session in &sessions {
        session.close().await?;
    }
    Ok(())
}

async fn run_relay(bind: String) -> DemoResult {
    let server = Arc::new(RelayServer::new(RelayConfig {
        bind_addr: bind,
        ..RelayConfig::default()
    }));
    server.run().await?;
    Ok(())
}

async fn run_join(
    url: String,
    doc: Uuid,
    name: String,
    text: Option<String>,
    seconds: u64,
    store: Option<PathBuf>,
) -> DemoResult {
    let session = CollabSession::spawn(
        doc,
        ReplicaId::generate(&name),
        Box::new(WsTransport::new(url)),
        open_store(store.as_ref(), &name)?,
        Box::new(RichTree::new()),
        SessionConfig::default().with_user_name(name.clone()),
    )?;
    let mut events = session.subscribe_events();
    tokio::time::timeout(Duration::from_secs(10), session.wait_synced()).await??;

    if let Some(text) = text {
        let blocks = session.tree().await?.len();
        session
            .edit(TreeMutation::InsertBlock {
                index: blocks,
                block: Block::paragraph(&format!("{name}: {text}")),
            })
            .await?;
    }

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(event) => info!("{event:?}"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => log::warn!("missed {n} events"),
                Err(_) => break,
            },
        }
    }

    println!("{}", session.content().await?);
    session.close().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> DemoResult {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Local {
        replicas: 3,
        store: None,
    }) {
        Command::Local { replicas, store } => run_local(replicas, store).await,
        Command::Relay { bind } => run_relay(bind).await,
        Command::Join {
            url,
            doc,
            name,
            text,
            seconds,
            store,
        } => run_join(url, doc, name, text, seconds, store).await,
    }
}
