//! Pub/sub substrate the sync provider runs on.
//!
//! The substrate is fan-out, at-least-once, unordered and may echo a
//! publisher's own messages back to it. Inbound traffic and connection status
//! changes arrive through the [`EventSender`] handed over at `connect`.
//!
//! ```text
//!  SyncProvider ── subscribe/broadcast ──► Transport ──► substrate
//!       ▲                                      │
//!       └──────── EventReceiver ◄──────────────┘
//!                  ├─ status:   unbounded, never dropped
//!                  └─ messages: bounded, backpressured
//! ```
//!
//! Status changes travel apart from messages so a backlog of inbound
//! messages can never swallow a disconnect.
//!
//! Implementations:
//! - [`local::LocalBus`]: in-process bus on tokio broadcast channels
//! - [`ws::WsTransport`]: WebSocket client of a [`relay::RelayServer`]

pub mod local;
pub mod relay;
pub mod ws;

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Capacity of the event channel a session hands to its transport.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus {
    Connected,
    Disconnected { reason: String },
}

/// Everything a transport reports back to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Status(TransportStatus),
    Message {
        channel: String,
        payload: Arc<Vec<u8>>,
    },
}

/// Transport side of the event channel.
#[derive(Debug, Clone)]
pub struct EventSender {
    messages: mpsc::Sender<TransportEvent>,
    status: mpsc::UnboundedSender<TransportStatus>,
}

/// Owner side of the event channel. Status changes are delivered ahead of
/// queued messages.
#[derive(Debug)]
pub struct EventReceiver {
    messages: mpsc::Receiver<TransportEvent>,
    status: mpsc::UnboundedReceiver<TransportStatus>,
}

/// Event channel whose message half holds at most `capacity` entries.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    let (messages_tx, messages) = mpsc::channel(capacity.max(1));
    let (status_tx, status) = mpsc::unbounded_channel();
    (
        EventSender {
            messages: messages_tx,
            status: status_tx,
        },
        EventReceiver { messages, status },
    )
}

impl EventSender {
    /// Report a status change. Only a dropped receiver loses it.
    pub fn status(&self, status: TransportStatus) {
        if self.status.send(status).is_err() {
            log::debug!("transport status dropped: receiver gone");
        }
    }

    /// Deliver an inbound message, waiting while the owner is behind.
    pub async fn message(&self, channel: String, payload: Arc<Vec<u8>>) -> Result<(), TransportError> {
        self.messages
            .send(TransportEvent::Message { channel, payload })
            .await
            .map_err(|_| TransportError::Closed)
    }
}

impl EventReceiver {
    /// Next event; `None` once every sender is gone and both halves are drained.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        tokio::select! {
            biased;
            Some(status) = self.status.recv() => Some(TransportEvent::Status(status)),
            Some(event) = self.messages.recv() => Some(event),
            else => None,
        }
    }

    pub fn try_recv(&mut self) -> Option<TransportEvent> {
        if let Ok(status) = self.status.try_recv() {
            return Some(TransportEvent::Status(status));
        }
        self.messages.try_recv().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("outgoing queue full")]
    QueueFull,
    #[error("transport closed")]
    Closed,
    #[error("connection failed: {0}")]
    ConnectFailed(String),
}

/// A pub/sub connection.
///
/// Methods never block: connection attempts run in the background and report
/// through the event channel.
pub trait Transport: Send + 'static {
    /// Start connecting; idempotent while connected or connecting.
    fn connect(&mut self, events: EventSender) -> Result<(), TransportError>;

    fn disconnect(&mut self);

    fn subscribe(&mut self, channel: &str) -> Result<(), TransportError>;

    fn unsubscribe(&mut self, channel: &str) -> Result<(), TransportError>;

    fn broadcast(&mut self, channel: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}
