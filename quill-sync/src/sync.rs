//! Transport & echo-prevention protocol.
//!
//! ```text
//!            connect()                 Status(Connected)
//! Disconnected ──────► Connecting ─────────────────────► Connected
//!                          ▲                                 │
//!                          │ reconnect_delay elapsed         │ Status(Disconnected)
//!                          └────────── Reconnecting ◄────────┘
//! ```
//!
//! On entering `Connected` the provider subscribes the document channel and
//! its own direct channel, flushes the offline queue, and after
//! `catch_up_delay` broadcasts its state vector. Peers answer on the direct
//! channel with `diff_since`; a peer that sees the requester holds ops it
//! lacks asks back, so catch-up runs both ways.
//!
//! Every inbound message whose origin is the local replica is discarded here,
//! before it can reach the document.
//!
//! A send that fails with `NotConnected` or `Closed` while the provider
//! believes it is connected counts as a lost link, same as a reported
//! disconnect. A replay cut short by a full transport queue resumes before
//! the next send or after `flush_retry_delay`.
//!
//! Timers are spawned sleeps that post a [`SyncTimer`] back to the owner,
//! stamped with the connection epoch so stale ones are ignored.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::{Delta, ReplicaId, ReplicatedDocument, StateVector};
use crate::protocol::{direct_channel, document_channel, MessageType, SyncMessage};
use crate::transport::{EventSender, Transport, TransportError, TransportStatus};

/// Provider tunables.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Wait after connecting before the catch-up request, so subscriptions settle.
    pub catch_up_delay: Duration,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// After a catch-up request, consider the replica synced once this
    /// elapses even if nobody answered (first replica on a document).
    pub sync_timeout: Duration,
    /// Maximum deltas held while offline.
    pub offline_queue_capacity: usize,
    /// Delay before resuming an interrupted replay of the offline queue.
    pub flush_retry_delay: Duration,
    /// Minimum spacing of gap-triggered catch-up requests to one replica.
    pub gap_request_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            catch_up_delay: Duration::from_millis(100),
            reconnect_delay: Duration::from_secs(2),
            sync_timeout: Duration::from_secs(3),
            offline_queue_capacity: 10_000,
            flush_retry_delay: Duration::from_millis(250),
            gap_request_interval: Duration::from_millis(500),
        }
    }
}

impl SyncConfig {
    pub fn for_testing() -> Self {
        Self {
            catch_up_delay: Duration::from_millis(20),
            reconnect_delay: Duration::from_millis(50),
            sync_timeout: Duration::from_millis(250),
            offline_queue_capacity: 128,
            flush_retry_delay: Duration::from_millis(20),
            gap_request_interval: Duration::from_millis(50),
        }
    }
}

/// Provider connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Where a delta came from. Only local edits are ever broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTimer {
    CatchUp { epoch: u64 },
    SyncSettle { epoch: u64 },
    Reconnect { epoch: u64 },
    FlushRetry { epoch: u64 },
}

/// Something the owner has to act on after an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Delta(Delta),
    CatchUp { from: ReplicaId, batch: Vec<u8> },
    Awareness { from: ReplicaId, payload: Vec<u8> },
}

/// Connectivity transitions reported to the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionChange {
    Connected,
    Disconnected { reason: String },
}

/// Result of [`SyncProvider::broadcast_delta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Queued,
    /// Offline queue full; peers recover the op through catch-up.
    Dropped,
    /// Remote-origin deltas are never rebroadcast.
    Refused,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub deltas_sent: u64,
    pub deltas_queued: u64,
    pub messages_received: u64,
    pub echoes_dropped: u64,
    pub decode_failures: u64,
    pub catch_ups_served: u64,
    pub reconnect_attempts: u64,
    pub gap_requests: u64,
}

/// Offline queue for deltas produced while disconnected.
///
/// Queued envelopes are replayed in order on reconnection.
/// Target: 1000 queued ops replay in <50ms.
pub struct OfflineQueue {
    queue: VecDeque<QueuedDelta>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedDelta {
    clock: u64,
    envelope: Vec<u8>,
    queued_at: Instant,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an encoded envelope; `false` when full.
    pub fn enqueue(&mut self, clock: u64, envelope: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedDelta {
            clock,
            envelope,
            queued_at: Instant::now(),
        });
        true
    }

    /// Take everything, oldest first.
    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).map(|d| (d.clock, d.envelope)).collect()
    }

    /// Put back what could not be sent, ahead of anything queued since.
    fn requeue_front(&mut self, items: Vec<(u64, Vec<u8>)>) {
        for (clock, envelope) in items.into_iter().rev() {
            self.queue.push_front(QueuedDelta {
                clock,
                envelope,
                queued_at: Instant::now(),
            });
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|d| d.envelope.len()).sum()
    }

    /// How long the oldest entry has been waiting.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.queue.front().map(|d| d.queued_at.elapsed())
    }
}

/// One replica's connection to a document's channels.
pub struct SyncProvider {
    replica: ReplicaId,
    doc_id: Uuid,
    config: SyncConfig,
    transport: Box<dyn Transport>,
    events: EventSender,
    timers: mpsc::UnboundedSender<SyncTimer>,
    state: ConnectionState,
    epoch: u64,
    synced: bool,
    closed: bool,
    offline: OfflineQueue,
    flush_scheduled: bool,
    /// Transitions detected while sending, for the owner to pick up.
    changes: Vec<ConnectionChange>,
    gap_requests: HashMap<ReplicaId, Instant>,
    stats: SyncStats,
}

impl SyncProvider {
    pub fn new(
        replica: ReplicaId,
        doc_id: Uuid,
        transport: Box<dyn Transport>,
        config: SyncConfig,
        events: EventSender,
        timers: mpsc::UnboundedSender<SyncTimer>,
    ) -> Self {
        let offline = OfflineQueue::new(config.offline_queue_capacity);
        Self {
            replica,
            doc_id,
            config,
            transport,
            events,
            timers,
            state: ConnectionState::Disconnected,
            epoch: 0,
            synced: false,
            closed: false,
            offline,
            flush_scheduled: false,
            changes: Vec::new(),
            gap_requests: HashMap::new(),
            stats: SyncStats::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    pub fn offline_len(&self) -> usize {
        self.offline.len()
    }

    fn schedule(&self, delay: Duration, timer: SyncTimer) {
        let timers = self.timers.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timers.send(timer);
        });
    }

    fn send(&mut self, msg: &SyncMessage) -> Result<(), TransportError> {
        self.publish(&msg.channel(), msg.encode())
    }

    fn publish(&mut self, channel: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let result = self.transport.broadcast(channel, payload);
        if let Err(e @ (TransportError::NotConnected | TransportError::Closed)) = &result {
            if self.is_connected() {
                self.link_lost(format!("send failed: {e}"));
            }
        }
        result
    }

    /// The transport refused a send while we thought we were connected: its
    /// disconnect report never reached us. Drop the link so the reconnect
    /// really starts over.
    fn link_lost(&mut self, reason: String) {
        self.transport.disconnect();
        if let Some(change) = self.on_status(TransportStatus::Disconnected { reason }) {
            self.changes.push(change);
        }
    }

    /// Connection transitions detected outside [`SyncProvider::on_status`].
    pub fn take_connection_changes(&mut self) -> Vec<ConnectionChange> {
        std::mem::take(&mut self.changes)
    }

    // ─── Lifecycle ──────────────────────────────────────────────────

    /// Start connecting. Idempotent while connecting or connected.
    pub fn connect(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => Ok(()),
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {
                self.state = ConnectionState::Connecting;
                log::debug!("{} connecting", self.replica);
                self.transport.connect(self.events.clone())
            }
        }
    }

    /// React to a status change reported by the transport.
    pub fn on_status(&mut self, status: TransportStatus) -> Option<ConnectionChange> {
        if self.closed {
            return None;
        }
        match status {
            TransportStatus::Connected => {
                if self.state == ConnectionState::Connected {
                    return None;
                }
                self.state = ConnectionState::Connected;
                self.epoch += 1;
                log::info!("{} connected to document {}", self.replica, self.doc_id);

                for channel in [
                    document_channel(&self.doc_id),
                    direct_channel(&self.doc_id, &self.replica),
                ] {
                    if let Err(e) = self.transport.subscribe(&channel) {
                        log::warn!("subscribing to {channel} failed: {e}");
                    }
                }
                self.flush_scheduled = false;
                self.flush_offline();
                self.schedule(self.config.catch_up_delay, SyncTimer::CatchUp { epoch: self.epoch });
                Some(ConnectionChange::Connected)
            }
            TransportStatus::Disconnected { reason } => {
                if self.state == ConnectionState::Disconnected {
                    return None;
                }
                let was_connected = self.state == ConnectionState::Connected;
                self.state = ConnectionState::Reconnecting;
                self.synced = false;
                self.epoch += 1;
                self.stats.reconnect_attempts += 1;
                log::warn!(
                    "{} disconnected ({reason}), retrying in {:?}",
                    self.replica,
                    self.config.reconnect_delay
                );
                self.schedule(self.config.reconnect_delay, SyncTimer::Reconnect { epoch: self.epoch });
                // A failed attempt while already offline is not a new transition.
                was_connected.then_some(ConnectionChange::Disconnected { reason })
            }
        }
    }

    /// Handle a timer; returns `true` when the synced flag flipped.
    pub fn on_timer(&mut self, timer: SyncTimer, doc: &ReplicatedDocument) -> bool {
        if self.closed {
            return false;
        }
        match timer {
            SyncTimer::CatchUp { epoch } if epoch == self.epoch && self.is_connected() => {
                self.request_catch_up(doc.state_vector());
                self.schedule(self.config.sync_timeout, SyncTimer::SyncSettle { epoch });
                false
            }
            SyncTimer::SyncSettle { epoch } if epoch == self.epoch && self.is_connected() => {
                if self.synced {
                    return false;
                }
                log::info!("{} found no catch-up peers, treating document as synced", self.replica);
                self.synced = true;
                true
            }
            SyncTimer::Reconnect { epoch } if epoch == self.epoch => {
                if self.state == ConnectionState::Reconnecting {
                    if let Err(e) = self.connect() {
                        log::warn!("reconnect attempt failed: {e}");
                    }
                }
                false
            }
            SyncTimer::FlushRetry { epoch } if epoch == self.epoch => {
                self.flush_scheduled = false;
                if self.is_connected() {
                    self.flush_offline();
                }
                false
            }
            _ => false,
        }
    }

    /// Record that a catch-up answer was merged; `true` if newly synced.
    pub fn mark_synced(&mut self) -> bool {
        !std::mem::replace(&mut self.synced, true)
    }

    /// Teardown step: leave both channels.
    pub fn unsubscribe_all(&mut self) {
        self.closed = true;
        for channel in [
            document_channel(&self.doc_id),
            direct_channel(&self.doc_id, &self.replica),
        ] {
            if let Err(e) = self.transport.unsubscribe(&channel) {
                log::debug!("unsubscribing {channel}: {e}");
            }
        }
    }

    /// Final teardown step: drop the connection.
    pub fn shutdown(&mut self) {
        self.closed = true;
        self.transport.disconnect();
        self.state = ConnectionState::Disconnected;
        if !self.offline.is_empty() {
            log::info!("{} closing with {} unsent deltas (kept in snapshot)", self.replica, self.offline.len());
        }
    }

    // ─── Outgoing ───────────────────────────────────────────────────

    /// Broadcast a delta produced by this replica, or queue it while offline.
    pub fn broadcast_delta(&mut self, delta: &Delta, origin: Origin) -> SendOutcome {
        if origin == Origin::Remote || delta.replica != self.replica {
            log::debug!("refusing to rebroadcast {} from {}", delta.kind_name(), delta.replica);
            return SendOutcome::Refused;
        }
        let envelope = SyncMessage::delta(self.replica.clone(), self.doc_id, delta.encode()).encode();

        // Older queued deltas go first.
        if self.is_connected() && !self.offline.is_empty() {
            self.flush_offline();
        }
        if self.is_connected() && self.offline.is_empty() {
            match self.publish(&document_channel(&self.doc_id), envelope.clone()) {
                Ok(()) => {
                    self.stats.deltas_sent += 1;
                    return SendOutcome::Sent;
                }
                Err(e) => log::warn!("broadcast failed ({e}), queueing delta {}", delta.id()),
            }
        }

        if self.offline.enqueue(delta.clock, envelope) {
            self.stats.deltas_queued += 1;
            self.schedule_flush_retry();
            SendOutcome::Queued
        } else {
            log::warn!("offline queue full, dropping delta {} (recovered by catch-up)", delta.id());
            SendOutcome::Dropped
        }
    }

    /// Broadcast an encoded awareness update. Dropped silently while offline.
    pub fn broadcast_awareness(&mut self, update: Vec<u8>) {
        if !self.is_connected() {
            return;
        }
        let msg = SyncMessage::awareness(self.replica.clone(), self.doc_id, update);
        if let Err(e) = self.send(&msg) {
            log::debug!("awareness broadcast failed: {e}");
        }
    }

    fn flush_offline(&mut self) {
        let queued = self.offline.drain();
        if queued.is_empty() {
            return;
        }
        log::info!("Replaying {} queued deltas", queued.len());
        let channel = document_channel(&self.doc_id);
        let mut iter = queued.into_iter();
        while let Some((clock, envelope)) = iter.next() {
            if let Err(e) = self.publish(&channel, envelope.clone()) {
                log::warn!("replay interrupted ({e}), keeping remaining deltas queued");
                let mut rest = vec![(clock, envelope)];
                rest.extend(iter);
                self.offline.requeue_front(rest);
                self.schedule_flush_retry();
                return;
            }
            self.stats.deltas_sent += 1;
        }
    }

    /// Only while connected: offline, the reconnect replays the queue.
    fn schedule_flush_retry(&mut self) {
        if self.is_connected() && !self.flush_scheduled {
            self.flush_scheduled = true;
            self.schedule(self.config.flush_retry_delay, SyncTimer::FlushRetry { epoch: self.epoch });
        }
    }

    /// A delta from `author` is waiting on ops we never saw: ask the author
    /// for everything past our state vector instead of waiting for the next
    /// reconnect.
    pub fn request_missing(&mut self, author: &ReplicaId, state_vector: &StateVector) {
        if !self.is_connected() || author == &self.replica {
            return;
        }
        let now = Instant::now();
        if self
            .gap_requests
            .get(author)
            .is_some_and(|last| now.duration_since(*last) < self.config.gap_request_interval)
        {
            return;
        }
        self.gap_requests.insert(author.clone(), now);
        let msg = SyncMessage::directed_catch_up_request(
            self.replica.clone(),
            self.doc_id,
            author.clone(),
            state_vector.encode(),
        );
        match self.send(&msg) {
            Ok(()) => {
                self.stats.gap_requests += 1;
                log::debug!("{} asked {author} for missing ops", self.replica);
            }
            Err(e) => log::warn!("gap catch-up request to {author} failed: {e}"),
        }
    }

    fn request_catch_up(&mut self, state_vector: &StateVector) {
        let msg = SyncMessage::catch_up_request(self.replica.clone(), self.doc_id, state_vector.encode());
        match self.send(&msg) {
            Ok(()) => log::debug!("{} requested catch-up ({} replicas known)", self.replica, state_vector.len()),
            Err(e) => log::warn!("catch-up request failed: {e}"),
        }
    }

    // ─── Incoming ───────────────────────────────────────────────────

    /// Decode one inbound message. Echoes, foreign documents and messages
    /// addressed to other replicas are dropped; catch-up requests are
    /// answered here.
    pub fn on_message(
        &mut self,
        channel: &str,
        payload: &[u8],
        doc: &ReplicatedDocument,
    ) -> Option<Incoming> {
        if self.closed {
            return None;
        }
        self.stats.messages_received += 1;
        let msg = match SyncMessage::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                self.stats.decode_failures += 1;
                log::warn!("dropping malformed message on {channel}: {e}");
                return None;
            }
        };
        if msg.doc_id != self.doc_id {
            log::debug!("ignoring message for document {}", msg.doc_id);
            return None;
        }
        if msg.is_from(&self.replica) {
            self.stats.echoes_dropped += 1;
            log::trace!("dropped echo of own {:?}", msg.msg_type);
            return None;
        }
        if msg.target.as_ref().is_some_and(|t| t != &self.replica) {
            return None;
        }

        match msg.msg_type {
            MessageType::Delta => match Delta::decode(&msg.payload) {
                Ok(delta) => Some(Incoming::Delta(delta)),
                Err(e) => {
                    self.stats.decode_failures += 1;
                    log::warn!("dropping malformed delta from {}: {e}", msg.origin);
                    None
                }
            },
            MessageType::CatchUpRequest => {
                self.answer_catch_up(msg, doc);
                None
            }
            MessageType::CatchUpResponse => Some(Incoming::CatchUp {
                from: msg.origin,
                batch: msg.payload,
            }),
            MessageType::Awareness => Some(Incoming::Awareness {
                from: msg.origin,
                payload: msg.payload,
            }),
        }
    }

    fn answer_catch_up(&mut self, request: SyncMessage, doc: &ReplicatedDocument) {
        let theirs = match StateVector::decode(&request.payload) {
            Ok(sv) => sv,
            Err(e) => {
                self.stats.decode_failures += 1;
                log::warn!("dropping malformed catch-up request from {}: {e}", request.origin);
                return;
            }
        };

        let reply = SyncMessage::catch_up_response(
            self.replica.clone(),
            self.doc_id,
            request.origin.clone(),
            doc.diff_since(&theirs),
        );
        if let Err(e) = self.send(&reply) {
            log::warn!("catch-up reply to {} failed: {e}", request.origin);
            return;
        }
        self.stats.catch_ups_served += 1;
        log::debug!("{} answered catch-up from {}", self.replica, request.origin);

        // The requester has ops we lack: ask back, but only on the first leg.
        if request.target.is_none() && theirs.is_ahead_of(doc.state_vector()) {
            let back = SyncMessage::directed_catch_up_request(
                self.replica.clone(),
                self.doc_id,
                request.origin,
                doc.state_vector().encode(),
            );
            if let Err(e) = self.send(&back) {
                log::warn!("reverse catch-up request failed: {e}");
            }
        }
    }
}
