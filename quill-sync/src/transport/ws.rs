//! WebSocket client of the [`super::relay::RelayServer`].
//!
//! Provides:
//! - Connection lifecycle (background connect, disconnect, loss detection)
//! - Channel subscriptions, replayed on every new connection
//! - Publish through a bounded outgoing queue feeding the writer task
//!
//! Reconnect policy lives in the sync provider; this type only reports
//! `Connected` / `Disconnected` on the event channel.

use futures_util::{SinkExt, StreamExt};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::relay::RelayFrame;
use super::{EventSender, Transport, TransportError, TransportStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Idle,
    Connecting,
    Open,
}

struct WsShared {
    state: LinkState,
    /// Bumped on every connect/disconnect so stale tasks can tell they lost.
    generation: u64,
    outgoing: Option<mpsc::Sender<Vec<u8>>>,
    subscriptions: BTreeSet<String>,
}

fn lock(shared: &Mutex<WsShared>) -> MutexGuard<'_, WsShared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Transport speaking [`RelayFrame`]s over a WebSocket.
pub struct WsTransport {
    url: String,
    outgoing_capacity: usize,
    shared: Arc<Mutex<WsShared>>,
    task: Option<JoinHandle<()>>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            outgoing_capacity: 256,
            shared: Arc::new(Mutex::new(WsShared {
                state: LinkState::Idle,
                generation: 0,
                outgoing: None,
                subscriptions: BTreeSet::new(),
            })),
            task: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn send_frame(&self, frame: RelayFrame) -> Result<(), TransportError> {
        let shared = lock(&self.shared);
        let outgoing = match (&shared.state, &shared.outgoing) {
            (LinkState::Open, Some(tx)) => tx,
            _ => return Err(TransportError::NotConnected),
        };
        outgoing.try_send(frame.encode()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

/// Connect, replay subscriptions, then pump frames both ways until the
/// socket closes or this generation is superseded.
async fn run_connection(
    url: String,
    generation: u64,
    shared: Arc<Mutex<WsShared>>,
    events: EventSender,
    outgoing_capacity: usize,
) {
    let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            let mut state = lock(&shared);
            if state.generation == generation {
                state.state = LinkState::Idle;
                drop(state);
                log::warn!("Connecting to {url} failed: {e}");
                events.status(TransportStatus::Disconnected { reason: e.to_string() });
            }
            return;
        }
    };
    let (mut ws_writer, mut ws_reader) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(outgoing_capacity.max(1));

    {
        let mut state = lock(&shared);
        if state.generation != generation {
            return;
        }
        for channel in &state.subscriptions {
            let frame = RelayFrame::Subscribe { channel: channel.clone() };
            if out_tx.try_send(frame.encode()).is_err() {
                log::warn!("Could not replay subscription to {channel}");
            }
        }
        state.outgoing = Some(out_tx);
        state.state = LinkState::Open;
    }
    log::info!("Connected to relay {url}");
    events.status(TransportStatus::Connected);

    let reason = loop {
        tokio::select! {
            outgoing = out_rx.recv() => {
                let Some(bytes) = outgoing else { break "outgoing queue closed".to_string() };
                if let Err(e) = ws_writer.send(Message::Binary(bytes.into())).await {
                    break e.to_string();
                }
            }
            incoming = ws_reader.next() => {
                match incoming {
                    Some(Ok(Message::Binary(data))) => match RelayFrame::decode(&data) {
                        Ok(RelayFrame::Message { channel, payload }) => {
                            if events.message(channel, Arc::new(payload)).await.is_err() {
                                break "event receiver dropped".to_string();
                            }
                        }
                        Ok(other) => log::warn!("Unexpected frame from relay: {other:?}"),
                        Err(e) => log::warn!("Failed to decode relay frame: {e}"),
                    },
                    Some(Ok(Message::Close(_))) | None => break "closed by relay".to_string(),
                    Some(Err(e)) => break e.to_string(),
                    _ => {}
                }
            }
        }
    };

    let mut state = lock(&shared);
    if state.generation == generation {
        state.state = LinkState::Idle;
        state.outgoing = None;
        drop(state);
        log::info!("Relay connection lost: {reason}");
        events.status(TransportStatus::Disconnected { reason });
    }
}

impl Transport for WsTransport {
    fn connect(&mut self, events: EventSender) -> Result<(), TransportError> {
        let generation = {
            let mut state = lock(&self.shared);
            if state.state != LinkState::Idle {
                return Ok(());
            }
            state.state = LinkState::Connecting;
            state.generation += 1;
            state.generation
        };
        self.task = Some(tokio::spawn(run_connection(
            self.url.clone(),
            generation,
            self.shared.clone(),
            events,
            self.outgoing_capacity,
        )));
        Ok(())
    }

    fn disconnect(&mut self) {
        {
            let mut state = lock(&self.shared);
            state.generation += 1;
            state.state = LinkState::Idle;
            state.outgoing = None;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Subscriptions made while not connected are sent once the link opens.
    fn subscribe(&mut self, channel: &str) -> Result<(), TransportError> {
        let inserted = lock(&self.shared).subscriptions.insert(channel.to_string());
        if !inserted {
            return Ok(());
        }
        match self.send_frame(RelayFrame::Subscribe {
            channel: channel.to_string(),
        }) {
            Err(TransportError::NotConnected) => Ok(()),
            other => other,
        }
    }

    fn unsubscribe(&mut self, channel: &str) -> Result<(), TransportError> {
        if !lock(&self.shared).subscriptions.remove(channel) {
            return Ok(());
        }
        match self.send_frame(RelayFrame::Unsubscribe {
            channel: channel.to_string(),
        }) {
            // Nothing to undo on the relay side.
            Err(TransportError::NotConnected) => Ok(()),
            other => other,
        }
    }

    fn broadcast(&mut self, channel: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.send_frame(RelayFrame::Publish {
            channel: channel.to_string(),
            payload,
        })
    }

    fn is_connected(&self) -> bool {
        lock(&self.shared).state == LinkState::Open
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
