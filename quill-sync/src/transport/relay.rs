//! WebSocket fan-out relay: the pub/sub substrate over the network.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌──► Client A (echo)
//!            ├── channel "quill/<doc>" ──┼──► Client B
//! Client B ──┘   (broadcast::Sender)  └──► Client C
//! ```
//!
//! The relay keeps no document state and never inspects payloads. It only
//! tracks which connection is subscribed to which channel and forwards every
//! publish to all current subscribers, publisher included. Nothing is
//! persisted or replayed: a subscriber that is not connected misses messages.
//!
//! Frames (bincode):
//! - client → relay: `Subscribe`, `Unsubscribe`, `Publish`
//! - relay → client: `Message`

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::core::delta::{decode_exact, encode};
use crate::core::DecodeError;

/// One frame on a relay connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayFrame {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Publish { channel: String, payload: Vec<u8> },
    Message { channel: String, payload: Vec<u8> },
}

impl RelayFrame {
    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode_exact(bytes)
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Messages buffered per subscriber before it starts lagging
    pub channel_capacity: usize,
    /// Outgoing frames buffered per connection
    pub outgoing_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            channel_capacity: 256,
            outgoing_capacity: 256,
        }
    }
}

impl RelayConfig {
    /// Ephemeral port on loopback.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            channel_capacity: 64,
            outgoing_capacity: 64,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_channels: usize,
}

#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

/// Channel name → broadcast group.
struct ChannelManager {
    channels: RwLock<HashMap<String, broadcast::Sender<Arc<Vec<u8>>>>>,
    capacity: usize,
}

impl ChannelManager {
    fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    async fn subscribe(&self, channel: &str) -> broadcast::Receiver<Arc<Vec<u8>>> {
        // Fast path: read lock
        {
            let channels = self.channels.read().await;
            if let Some(sender) = channels.get(channel) {
                return sender.subscribe();
            }
        }
        let mut channels = self.channels.write().await;
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Fan a pre-encoded `Message` frame out to every subscriber.
    async fn publish(&self, channel: &str, frame: Arc<Vec<u8>>) -> usize {
        let channels = self.channels.read().await;
        channels
            .get(channel)
            .map_or(0, |sender| sender.send(frame).unwrap_or(0))
    }

    async fn remove_empty(&self) {
        self.channels
            .write()
            .await
            .retain(|_, sender| sender.receiver_count() > 0);
    }

    async fn active(&self) -> usize {
        self.channels
            .read()
            .await
            .values()
            .filter(|sender| sender.receiver_count() > 0)
            .count()
    }
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    channels: Arc<ChannelManager>,
    stats: Arc<AtomicRelayStats>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let channels = Arc::new(ChannelManager::new(config.channel_capacity));
        Self {
            config,
            channels,
            stats: Arc::new(AtomicRelayStats::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Bind and serve until the listener fails.
    pub async fn run(self: Arc<Self>) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Bind, then serve on a background task. Returns the bound address.
    pub async fn spawn(self: Arc<Self>) -> Result<(SocketAddr, JoinHandle<()>), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        log::info!("Relay listening on {addr}");
        let handle = tokio::spawn(async move {
            if let Err(e) = self.serve(listener).await {
                log::error!("Relay stopped: {e}");
            }
        });
        Ok((addr, handle))
    }

    async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let channels = self.channels.clone();
            let stats = self.stats.clone();
            let outgoing_capacity = self.config.outgoing_capacity;
            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, channels, stats.clone(), outgoing_capacity).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
                stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        channels: Arc<ChannelManager>,
        stats: Arc<AtomicRelayStats>,
        outgoing_capacity: usize,
    ) -> Result<(), RelayError> {
        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        let (out_tx, mut out_rx) = mpsc::channel::<Arc<Vec<u8>>>(outgoing_capacity.max(1));
        let mut subscriptions: HashMap<String, JoinHandle<()>> = HashMap::new();

        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            stats.total_messages.fetch_add(1, Ordering::Relaxed);
                            stats.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                            match RelayFrame::decode(&data) {
                                Ok(RelayFrame::Subscribe { channel }) => {
                                    if !subscriptions.contains_key(&channel) {
                                        let rx = channels.subscribe(&channel).await;
                                        let task = forward(rx, out_tx.clone(), channel.clone(), addr);
                                        subscriptions.insert(channel, task);
                                    }
                                }
                                Ok(RelayFrame::Unsubscribe { channel }) => {
                                    if let Some(task) = subscriptions.remove(&channel) {
                                        task.abort();
                                    }
                                }
                                Ok(RelayFrame::Publish { channel, payload }) => {
                                    let frame = RelayFrame::Message { channel: channel.clone(), payload };
                                    let delivered = channels.publish(&channel, Arc::new(frame.encode())).await;
                                    log::trace!("relayed publish from {addr} to {delivered} subscribers");
                                }
                                Ok(RelayFrame::Message { .. }) => {
                                    log::warn!("Ignoring relay-only frame from {addr}");
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break Ok(());
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }
                        _ => {}
                    }
                }

                Some(frame) = out_rx.recv() => {
                    if let Err(e) = ws_sender.send(Message::Binary(frame.to_vec().into())).await {
                        break Err(e.into());
                    }
                }
            }
        };

        for (_, task) in subscriptions.drain() {
            task.abort();
        }
        channels.remove_empty().await;
        result
    }

    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            active_channels: self.channels.active().await,
        }
    }
}

/// Pump one channel subscription into a connection's outgoing queue.
fn forward(
    mut rx: broadcast::Receiver<Arc<Vec<u8>>>,
    out_tx: mpsc::Sender<Arc<Vec<u8>>>,
    channel: String,
    addr: SocketAddr,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    if out_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    log::warn!("Subscriber {addr} lagged by {n} messages on {channel}");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
