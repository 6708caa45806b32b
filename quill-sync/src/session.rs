//! One replica's collaboration session.
//!
//! [`CollabSession`] is a single tokio task that exclusively owns the
//! replicated document, the adapter, the editor tree, the sync provider, the
//! awareness table and persistence. Everything reaches it through queues:
//!
//! ```text
//! SessionHandle ── SessionCommand ──┐
//! Transport ───── TransportEvent ───┤
//! tree listener ─ TreeMutation ─────┼──► select! ──► CollabSession
//! spawned sleeps ─ SyncTimer ───────┤
//! heartbeat interval ───────────────┘
//!          │
//!          ├──► watch<SyncStatus>       (connected / synced / presence)
//!          └──► broadcast<SessionEvent>
//! ```
//!
//! No document mutation ever happens inside another one: tree notifications
//! are queued and handled after the mutation that triggered them returns.

use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::adapter::tree::{Block, TreeModel, TreeMutation};
use crate::adapter::{AdapterStats, BootstrapOutcome, DocumentAdapter, Materialized};
use crate::core::{ApplyResult, CoreConfig, CoreError, Delta, ReplicaId, ReplicatedDocument};
use crate::error::SessionError;
use crate::presence::{
    AwarenessConfig, AwarenessEntry, AwarenessField, AwarenessTable, AwarenessUpdate, CursorColor,
    CursorRange, PresenceChange,
};
use crate::storage::{Persistence, PersistenceConfig, PersistenceStats, SnapshotStore};
use crate::sync::{ConnectionChange, Incoming, Origin, SyncConfig, SyncProvider, SyncStats, SyncTimer};
use crate::transport::{event_channel, EventReceiver, Transport, TransportEvent, EVENT_CHANNEL_CAPACITY};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Display name published through awareness.
    pub user_name: Option<String>,
    pub core: CoreConfig,
    pub sync: SyncConfig,
    pub awareness: AwarenessConfig,
    pub persistence: PersistenceConfig,
    pub command_capacity: usize,
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_name: None,
            core: CoreConfig::default(),
            sync: SyncConfig::default(),
            awareness: AwarenessConfig::default(),
            persistence: PersistenceConfig::default(),
            command_capacity: 256,
            event_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub fn for_testing() -> Self {
        Self {
            user_name: None,
            core: CoreConfig::for_testing(),
            sync: SyncConfig::for_testing(),
            awareness: AwarenessConfig::for_testing(),
            persistence: PersistenceConfig::for_testing(),
            command_capacity: 64,
            event_capacity: 256,
        }
    }

    pub fn with_user_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = Some(name.into());
        self
    }
}

/// What the UI shows: connectivity, sync state and who else is here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStatus {
    pub connected: bool,
    pub synced: bool,
    pub awareness_entries: Vec<AwarenessEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Disconnected { reason: String },
    Synced,
    /// Remote ops were merged and the tree updated.
    RemoteChange { applied: usize },
    Presence(Vec<PresenceChange>),
    /// The tree was reset to the plain-text rendition.
    Fallback,
    /// Resource exhaustion. The session keeps running; the caller decides.
    Fatal(SessionError),
}

/// A remote cursor resolved against the current document.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursor {
    pub replica: ReplicaId,
    pub name: String,
    pub color: CursorColor,
    pub anchor: usize,
    pub head: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub sync: SyncStats,
    pub adapter: AdapterStats,
    /// Tree notifications dropped because the adapter itself was writing.
    pub suppressed_notifications: u64,
    pub persistence: PersistenceStats,
    pub pending_ops: usize,
    pub offline_queue: usize,
}

enum SessionCommand {
    Edit {
        mutation: TreeMutation,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    SetAwareness(AwarenessField),
    SetCursor {
        anchor: usize,
        head: usize,
    },
    Cursors(oneshot::Sender<Vec<RemoteCursor>>),
    Blocks(oneshot::Sender<Vec<Block>>),
    Content(oneshot::Sender<String>),
    Stats(oneshot::Sender<SessionStats>),
    Close(oneshot::Sender<()>),
}

/// Cloneable front door to a running [`CollabSession`].
#[derive(Clone)]
pub struct SessionHandle {
    replica: ReplicaId,
    doc_id: Uuid,
    awareness_timeout: Duration,
    commands: mpsc::Sender<SessionCommand>,
    status: watch::Receiver<SyncStatus>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    pub fn replica_id(&self) -> &ReplicaId {
        &self.replica
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    /// Current status. Awareness entries past their timeout are left out even
    /// if the session has not purged them yet.
    pub fn status(&self) -> SyncStatus {
        let mut status = self.status.borrow().clone();
        let now = Instant::now();
        status
            .awareness_entries
            .retain(|e| !e.is_expired(now, self.awareness_timeout));
        status
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Apply an edit to the tree and propagate it.
    pub async fn edit(&self, mutation: TreeMutation) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Edit { mutation, reply })
            .await?
    }

    pub async fn set_awareness(&self, field: AwarenessField) -> Result<(), SessionError> {
        self.send(SessionCommand::SetAwareness(field)).await
    }

    /// Publish the local selection by visible document index.
    pub async fn set_cursor(&self, anchor: usize, head: usize) -> Result<(), SessionError> {
        self.send(SessionCommand::SetCursor { anchor, head }).await
    }

    pub async fn remote_cursors(&self) -> Result<Vec<RemoteCursor>, SessionError> {
        self.request(SessionCommand::Cursors).await
    }

    /// The tree as currently materialized.
    pub async fn tree(&self) -> Result<Vec<Block>, SessionError> {
        self.request(SessionCommand::Blocks).await
    }

    /// Visible document text (block breaks rendered as `\n`).
    pub async fn content(&self) -> Result<String, SessionError> {
        self.request(SessionCommand::Content).await
    }

    pub async fn stats(&self) -> Result<SessionStats, SessionError> {
        self.request(SessionCommand::Stats).await
    }

    /// Wait until the status satisfies `pred`.
    pub async fn wait_for(&self, mut pred: impl FnMut(&SyncStatus) -> bool) -> Result<(), SessionError> {
        let mut status = self.status.clone();
        status
            .wait_for(|s| pred(s))
            .await
            .map(|_| ())
            .map_err(|_| SessionError::Closed)
    }

    pub async fn wait_synced(&self) -> Result<(), SessionError> {
        self.wait_for(|s| s.synced).await
    }

    /// Orderly teardown. Safe to call more than once.
    pub async fn close(&self) -> Result<(), SessionError> {
        match self.request(SessionCommand::Close).await {
            Ok(()) | Err(SessionError::Closed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// The session actor.
pub struct CollabSession {
    doc_id: Uuid,
    doc: ReplicatedDocument,
    adapter: DocumentAdapter,
    tree: Box<dyn TreeModel>,
    provider: SyncProvider,
    awareness: AwarenessTable,
    persistence: Persistence,

    commands: mpsc::Receiver<SessionCommand>,
    transport_events: EventReceiver,
    tree_changes: mpsc::UnboundedReceiver<TreeMutation>,
    timers: mpsc::UnboundedReceiver<SyncTimer>,
    status: watch::Sender<SyncStatus>,
    events: broadcast::Sender<SessionEvent>,
    closing: bool,
}

impl CollabSession {
    /// Start a session on the current tokio runtime.
    ///
    /// Restores the local snapshot and reconciles it with `tree` before any
    /// network traffic, so the document is usable offline right away.
    pub fn spawn(
        doc_id: Uuid,
        replica: ReplicaId,
        transport: Box<dyn Transport>,
        store: Box<dyn SnapshotStore>,
        mut tree: Box<dyn TreeModel>,
        config: SessionConfig,
    ) -> Result<SessionHandle, SessionError> {
        let (command_tx, commands) = mpsc::channel(config.command_capacity.max(1));
        let (event_tx, transport_events) = event_channel(EVENT_CHANNEL_CAPACITY);
        let (tree_tx, tree_changes) = mpsc::unbounded_channel();
        let (timer_tx, timers) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(SyncStatus::default());
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let mut doc = ReplicatedDocument::with_config(replica.clone(), config.core.clone());
        let mut persistence = Persistence::new(store, doc_id, config.persistence.clone());
        persistence.restore(&mut doc);

        let mut adapter = DocumentAdapter::new();
        tree.set_change_listener(Some(adapter.listener(move |mutation| {
            // The receiver lives as long as the session.
            let _ = tree_tx.send(mutation);
        })));

        let mut provider = SyncProvider::new(
            replica.clone(),
            doc_id,
            transport,
            config.sync.clone(),
            event_tx,
            timer_tx,
        );

        match adapter.bootstrap(&mut doc, tree.as_mut())? {
            BootstrapOutcome::Seeded(deltas) => {
                for delta in &deltas {
                    provider.broadcast_delta(delta, Origin::Local);
                }
                persistence.flush(&doc)?;
            }
            BootstrapOutcome::Materialized(Materialized::Fallback) => {
                log::warn!("bootstrap fell back to plain text for {doc_id}");
            }
            _ => {}
        }

        let mut awareness = AwarenessTable::new(replica.clone(), config.awareness.clone());
        if let Some(name) = &config.user_name {
            awareness.set_local_field(AwarenessField::Identity { name: name.clone() });
        }

        provider.connect()?;
        log::info!("Session {replica} started on document {doc_id}");

        let handle = SessionHandle {
            replica,
            doc_id,
            awareness_timeout: config.awareness.timeout,
            commands: command_tx,
            status: status_rx,
            events: events.clone(),
        };

        let session = CollabSession {
            doc_id,
            doc,
            adapter,
            tree,
            provider,
            awareness,
            persistence,
            commands,
            transport_events,
            tree_changes,
            timers,
            status,
            events,
            closing: false,
        };
        tokio::spawn(session.run(config.awareness.heartbeat));
        Ok(handle)
    }

    async fn run(mut self, heartbeat: Duration) {
        let mut heartbeat = tokio::time::interval(heartbeat.max(Duration::from_millis(1)));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Close(reply)) => {
                        self.teardown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        // Every handle dropped without close().
                        self.teardown();
                        break;
                    }
                },
                Some(event) = self.transport_events.recv() => self.handle_transport(event),
                Some(mutation) = self.tree_changes.recv() => {
                    if let Err(e) = self.handle_tree_change(mutation) {
                        log::warn!("tree edit not propagated: {e}");
                    }
                }
                Some(timer) = self.timers.recv() => {
                    if self.provider.on_timer(timer, &self.doc) {
                        self.emit(SessionEvent::Synced);
                        self.publish_status();
                    }
                }
                _ = heartbeat.tick() => self.handle_heartbeat(),
            }
            for change in self.provider.take_connection_changes() {
                self.on_connection_change(change);
            }
        }
        log::info!("Session {} on {} stopped", self.doc.replica_id(), self.doc_id);
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn fatal(&self, error: SessionError) {
        log::error!("fatal session error: {error}");
        self.emit(SessionEvent::Fatal(error));
    }

    fn publish_status(&self) {
        let now = Instant::now();
        self.status.send_replace(SyncStatus {
            connected: self.provider.is_connected(),
            synced: self.provider.is_synced(),
            awareness_entries: self.awareness.entries(now),
        });
    }

    fn record_change(&mut self) {
        if let Err(e) = self.persistence.record_change(&self.doc) {
            self.fatal(e.into());
        }
    }

    fn materialize(&mut self) {
        match self
            .adapter
            .materialize_remote_state(&self.doc, self.tree.as_mut())
        {
            Ok(Materialized::Fallback) => self.emit(SessionEvent::Fallback),
            Ok(Materialized::Skipped) => log::debug!("materialization skipped, guard held"),
            Ok(_) => {}
            Err(e) => log::error!("could not materialize document state: {e}"),
        }
    }

    // ─── Commands ───────────────────────────────────────────────────

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Edit { mutation, reply } => {
                let result = self.handle_edit(mutation);
                let _ = reply.send(result);
            }
            SessionCommand::SetAwareness(field) => self.update_awareness(field),
            SessionCommand::SetCursor { anchor, head } => {
                let cursor = CursorRange {
                    anchor: self.doc.relative_position(anchor),
                    head: self.doc.relative_position(head),
                };
                self.update_awareness(AwarenessField::Cursor(Some(cursor)));
            }
            SessionCommand::Cursors(reply) => {
                let _ = reply.send(self.remote_cursors());
            }
            SessionCommand::Blocks(reply) => {
                let _ = reply.send(self.tree.blocks().to_vec());
            }
            SessionCommand::Content(reply) => {
                let _ = reply.send(self.tree.plain_text());
            }
            SessionCommand::Stats(reply) => {
                let _ = reply.send(SessionStats {
                    sync: self.provider.stats(),
                    adapter: self.adapter.stats(),
                    suppressed_notifications: self.adapter.guards().suppressed(),
                    persistence: self.persistence.stats(),
                    pending_ops: self.doc.pending_count(),
                    offline_queue: self.provider.offline_len(),
                });
            }
            SessionCommand::Close(reply) => {
                self.teardown();
                let _ = reply.send(());
            }
        }
    }

    fn handle_edit(&mut self, mutation: TreeMutation) -> Result<(), SessionError> {
        if self.closing {
            return Err(SessionError::Closed);
        }
        self.tree.apply(&mutation)?;
        // The tree notified synchronously; handle it before anything else runs.
        let mut result = Ok(());
        while let Ok(change) = self.tree_changes.try_recv() {
            if let Err(e) = self.handle_tree_change(change) {
                result = Err(e);
            }
        }
        result
    }

    fn handle_tree_change(&mut self, mutation: TreeMutation) -> Result<(), SessionError> {
        if self.closing {
            return Err(SessionError::Closed);
        }
        match self.adapter.apply_local_edit(&mutation, &mut self.doc) {
            Ok(deltas) => {
                for delta in &deltas {
                    self.provider.broadcast_delta(delta, Origin::Local);
                    self.record_change();
                }
                Ok(())
            }
            Err(e) => {
                // The tree moved without the document; pull it back.
                self.materialize();
                Err(e.into())
            }
        }
    }

    fn update_awareness(&mut self, field: AwarenessField) {
        if let Some(update) = self.awareness.set_local_field(field) {
            self.provider.broadcast_awareness(update.encode());
        }
    }

    fn remote_cursors(&self) -> Vec<RemoteCursor> {
        self.awareness
            .entries(Instant::now())
            .into_iter()
            .filter_map(|entry| {
                let cursor = entry.state.cursor.as_ref()?;
                Some(RemoteCursor {
                    name: entry.display_name().to_string(),
                    color: entry.state.color,
                    anchor: self.doc.resolve(&cursor.anchor),
                    head: self.doc.resolve(&cursor.head),
                    replica: entry.replica,
                })
            })
            .collect()
    }

    // ─── Transport ──────────────────────────────────────────────────

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Status(status) => {
                if let Some(change) = self.provider.on_status(status) {
                    self.on_connection_change(change);
                }
            }
            TransportEvent::Message { channel, payload } => {
                if let Some(incoming) = self.provider.on_message(&channel, &payload, &self.doc) {
                    self.handle_incoming(incoming);
                }
            }
        }
    }

    fn on_connection_change(&mut self, change: ConnectionChange) {
        match change {
            ConnectionChange::Connected => {
                let hello = self.awareness.local_state_update();
                self.provider.broadcast_awareness(hello.encode());
                self.emit(SessionEvent::Connected);
            }
            ConnectionChange::Disconnected { reason } => {
                self.emit(SessionEvent::Disconnected { reason });
            }
        }
        self.publish_status();
    }

    fn handle_incoming(&mut self, incoming: Incoming) {
        match incoming {
            Incoming::Delta(delta) => {
                let author = delta.replica.clone();
                self.handle_remote_delta(delta, &author);
            }
            Incoming::CatchUp { from, batch } => {
                match self.doc.decode_and_merge(&batch) {
                    Ok(report) => {
                        log::debug!("catch-up from {from}: {report:?}");
                        if report.changed() {
                            self.record_change();
                            self.materialize();
                            self.emit(SessionEvent::RemoteChange {
                                applied: report.applied,
                            });
                        }
                    }
                    Err(e) => {
                        self.core_failure(e);
                        return;
                    }
                }
                if self.provider.mark_synced() {
                    log::info!("{} synced with {from}", self.doc.replica_id());
                    self.emit(SessionEvent::Synced);
                    self.publish_status();
                }
            }
            Incoming::Awareness { from, payload } => match AwarenessUpdate::decode(&payload) {
                Ok(update) => {
                    let changes = self.awareness.on_remote_update(&update, Instant::now());
                    if !changes.is_empty() {
                        self.publish_status();
                        self.emit(SessionEvent::Presence(changes));
                    }
                }
                Err(e) => log::warn!("dropping malformed awareness update from {from}: {e}"),
            },
        }
    }

    fn handle_remote_delta(&mut self, delta: Delta, author: &ReplicaId) {
        match self.doc.apply_remote(delta) {
            Ok(ApplyResult::Applied(summary)) => {
                self.record_change();
                self.materialize();
                self.emit(SessionEvent::RemoteChange {
                    applied: 1 + summary.drained,
                });
            }
            Ok(ApplyResult::Duplicate) => {}
            Ok(ApplyResult::Pending) => {
                log::debug!("buffered out-of-order op ({} pending)", self.doc.pending_count());
                self.provider.request_missing(author, self.doc.state_vector());
            }
            Err(e) => self.core_failure(e),
        }
    }

    fn core_failure(&self, error: CoreError) {
        match error {
            CoreError::PendingOverflow { .. } => self.fatal(error.into()),
            other => log::warn!("remote update rejected: {other}"),
        }
    }

    fn handle_heartbeat(&mut self) {
        let now = Instant::now();
        let expired = self.awareness.purge_expired(now);
        if self.provider.is_connected() {
            let beat = self.awareness.local_state_update();
            self.provider.broadcast_awareness(beat.encode());
        }
        if !expired.is_empty() {
            self.emit(SessionEvent::Presence(
                expired.into_iter().map(PresenceChange::Left).collect(),
            ));
            self.publish_status();
        }
    }

    // ─── Teardown ───────────────────────────────────────────────────

    fn teardown(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        log::info!("Closing session {} on {}", self.doc.replica_id(), self.doc_id);

        self.provider.unsubscribe_all();

        self.adapter.release_guards();
        self.tree.set_change_listener(None);

        if let Err(e) = self.persistence.flush(&self.doc) {
            log::error!("final snapshot for {} failed: {e}", self.doc_id);
        }

        let bye = self.awareness.offline_update();
        self.provider.broadcast_awareness(bye.encode());

        self.provider.shutdown();
        self.awareness.clear();
        self.publish_status();
    }
}
