//! In-process pub/sub bus.
//!
//! Every channel is a tokio broadcast channel, so a send is O(1) regardless
//! of subscriber count and each subscriber buffers up to `capacity` messages.
//! Publishers receive their own messages like anyone else subscribed to the
//! channel; filtering echoes is the caller's job.
//!
//! Each [`LocalTransport`] endpoint comes with a [`LinkHandle`] that can sever
//! and restore its link, which is how tests simulate network partitions.
//!
//! Performance target: 1,000 messages to 100 subscribers < 10ms

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use super::{EventSender, Transport, TransportError, TransportStatus};

/// Statistics for monitoring bus health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_channels: usize,
}

/// Lock-free counters updated on the hot path.
#[derive(Default)]
struct AtomicBusStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

struct BusInner {
    channels: Mutex<HashMap<String, broadcast::Sender<Arc<Vec<u8>>>>>,
    capacity: usize,
    stats: AtomicBusStats,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared in-process substrate; clone it to hand out endpoints.
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<BusInner>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl LocalBus {
    /// `capacity` is how many messages a lagging subscriber may fall behind
    /// before it starts losing them.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                channels: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
                stats: AtomicBusStats::default(),
            }),
        }
    }

    /// A new endpoint plus the handle controlling its link.
    pub fn endpoint(&self) -> (LocalTransport, LinkHandle) {
        let shared = Arc::new(Mutex::new(EndpointState {
            link_up: true,
            connected: false,
            events: None,
            subscriptions: HashMap::new(),
        }));
        let transport = LocalTransport {
            bus: self.clone(),
            shared: shared.clone(),
        };
        (transport, LinkHandle { shared })
    }

    fn receiver(&self, channel: &str) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut channels = lock(&self.inner.channels);
        // Receivers of aborted subscriptions go away asynchronously; prune here.
        channels.retain(|_, s| s.receiver_count() > 0);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .subscribe()
    }

    fn publish(&self, channel: &str, payload: Arc<Vec<u8>>) -> usize {
        let sender = lock(&self.inner.channels).get(channel).cloned();
        self.inner.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        // No subscribers: the message is simply gone.
        sender.map_or(0, |s| s.send(payload).unwrap_or(0))
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        lock(&self.inner.channels)
            .get(channel)
            .map_or(0, |s| s.receiver_count())
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            messages_sent: self.inner.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.inner.stats.messages_dropped.load(Ordering::Relaxed),
            active_channels: lock(&self.inner.channels)
                .values()
                .filter(|s| s.receiver_count() > 0)
                .count(),
        }
    }
}

struct EndpointState {
    link_up: bool,
    connected: bool,
    events: Option<EventSender>,
    subscriptions: HashMap<String, JoinHandle<()>>,
}

impl EndpointState {
    fn drop_subscriptions(&mut self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.subscriptions.len());
        for (name, task) in self.subscriptions.drain() {
            task.abort();
            names.push(name);
        }
        names
    }
}

/// Controls one endpoint's link to the bus.
#[derive(Clone)]
pub struct LinkHandle {
    shared: Arc<Mutex<EndpointState>>,
}

impl LinkHandle {
    /// Cut the link: subscriptions stop, the owner is told it is
    /// disconnected, and reconnect attempts fail until [`LinkHandle::restore`].
    pub fn sever(&self) {
        let mut state = lock(&self.shared);
        state.link_up = false;
        state.drop_subscriptions();
        if std::mem::replace(&mut state.connected, false) {
            if let Some(events) = &state.events {
                events.status(TransportStatus::Disconnected {
                    reason: "link severed".into(),
                });
            }
        }
    }

    pub fn restore(&self) {
        lock(&self.shared).link_up = true;
    }

    pub fn is_up(&self) -> bool {
        lock(&self.shared).link_up
    }
}

/// One participant on a [`LocalBus`].
pub struct LocalTransport {
    bus: LocalBus,
    shared: Arc<Mutex<EndpointState>>,
}

impl LocalTransport {
    fn forward(&self, channel: &str, events: EventSender) -> JoinHandle<()> {
        let mut rx = self.bus.receiver(channel);
        let channel = channel.to_string();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        if events.message(channel.clone(), payload).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        bus.inner.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
                        log::warn!("subscriber on {channel} lagged by {n} messages");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Transport for LocalTransport {
    fn connect(&mut self, events: EventSender) -> Result<(), TransportError> {
        let mut state = lock(&self.shared);
        state.events = Some(events.clone());
        if !state.link_up {
            events.status(TransportStatus::Disconnected {
                reason: "link down".into(),
            });
            return Ok(());
        }
        if !state.connected {
            state.connected = true;
            events.status(TransportStatus::Connected);
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut state = lock(&self.shared);
        state.connected = false;
        let dropped = state.drop_subscriptions();
        log::debug!("local endpoint disconnected ({} subscriptions dropped)", dropped.len());
    }

    fn subscribe(&mut self, channel: &str) -> Result<(), TransportError> {
        let mut state = lock(&self.shared);
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if state.subscriptions.contains_key(channel) {
            return Ok(());
        }
        let events = state.events.clone().ok_or(TransportError::NotConnected)?;
        let task = self.forward(channel, events);
        state.subscriptions.insert(channel.to_string(), task);
        log::debug!("subscribed to {channel}");
        Ok(())
    }

    fn unsubscribe(&mut self, channel: &str) -> Result<(), TransportError> {
        let task = lock(&self.shared).subscriptions.remove(channel);
        if let Some(task) = task {
            task.abort();
            log::debug!("unsubscribed from {channel}");
        }
        Ok(())
    }

    fn broadcast(&mut self, channel: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if !lock(&self.shared).connected {
            return Err(TransportError::NotConnected);
        }
        self.bus.publish(channel, Arc::new(payload));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.shared).connected
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        lock(&self.shared).drop_subscriptions();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{event_channel, EventReceiver, TransportEvent};
    use tokio::time::{timeout, Duration};

    async fn wait_until(mut check: impl FnMut() -> bool) {
        timeout(Duration::from_secs(1), async {
            while !check() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition not reached");
    }

    async fn next_message(rx: &mut EventReceiver) -> (String, Vec<u8>) {
        loop {
            let event = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("timed out")
                .expect("closed");
            if let TransportEvent::Message { channel, payload } = event {
                return (channel, payload.to_vec());
            }
        }
    }

    #[tokio::test]
    async fn test_connect_reports_status() {
        let bus = LocalBus::new(16);
        let (mut t, _link) = bus.endpoint();
        let (tx, mut rx) = event_channel(16);
        t.connect(tx.clone()).unwrap();
        t.connect(tx).unwrap();
        assert_eq!(rx.recv().await, Some(TransportEvent::Status(TransportStatus::Connected)));
        assert_eq!(rx.try_recv(), None, "second connect must be a no-op");
        assert!(t.is_connected());
    }

    #[tokio::test]
    async fn test_fan_out_includes_publisher() {
        let bus = LocalBus::new(16);
        let (mut a, _) = bus.endpoint();
        let (mut b, _) = bus.endpoint();
        let (atx, mut arx) = event_channel(16);
        let (btx, mut brx) = event_channel(16);
        a.connect(atx).unwrap();
        b.connect(btx).unwrap();
        a.subscribe("room").unwrap();
        b.subscribe("room").unwrap();
        assert_eq!(bus.subscriber_count("room"), 2);

        a.broadcast("room", vec![1, 2, 3]).unwrap();
        assert_eq!(next_message(&mut arx).await, ("room".to_string(), vec![1, 2, 3]));
        assert_eq!(next_message(&mut brx).await, ("room".to_string(), vec![1, 2, 3]));
        assert_eq!(bus.stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_empty_channel() {
        let bus = LocalBus::new(16);
        let (mut a, _) = bus.endpoint();
        let (tx, _rx) = event_channel(16);
        a.connect(tx).unwrap();
        a.subscribe("x").unwrap();
        assert_eq!(bus.stats().active_channels, 1);
        a.unsubscribe("x").unwrap();
        wait_until(|| bus.stats().active_channels == 0).await;
    }

    #[tokio::test]
    async fn test_severed_link() {
        let bus = LocalBus::new(16);
        let (mut a, link) = bus.endpoint();
        let (tx, mut rx) = event_channel(16);
        a.connect(tx.clone()).unwrap();
        let _ = rx.recv().await;
        a.subscribe("x").unwrap();

        link.sever();
        assert!(!a.is_connected());
        wait_until(|| bus.subscriber_count("x") == 0).await;
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Status(TransportStatus::Disconnected { .. }))
        ));
        assert_eq!(a.broadcast("x", vec![0]), Err(TransportError::NotConnected));

        // Reconnect fails while the link is down, succeeds once restored.
        a.connect(tx.clone()).unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Status(TransportStatus::Disconnected { .. }))
        ));
        link.restore();
        a.connect(tx).unwrap();
        assert_eq!(rx.recv().await, Some(TransportEvent::Status(TransportStatus::Connected)));
    }

    #[tokio::test]
    async fn test_sever_reported_behind_message_backlog() {
        let bus = LocalBus::new(64);
        let (mut a, link) = bus.endpoint();
        let (mut b, _) = bus.endpoint();
        let (tx, mut rx) = event_channel(2);
        let (btx, _brx) = event_channel(16);
        a.connect(tx).unwrap();
        b.connect(btx).unwrap();
        a.subscribe("x").unwrap();
        for i in 0..8u8 {
            b.broadcast("x", vec![i]).unwrap();
        }
        // a's message half is full and its forwarder is parked on it.
        tokio::time::sleep(Duration::from_millis(20)).await;

        link.sever();
        let mut saw_disconnect = false;
        while let Ok(Some(event)) = timeout(Duration::from_millis(200), rx.recv()).await {
            if matches!(event, TransportEvent::Status(TransportStatus::Disconnected { .. })) {
                saw_disconnect = true;
                break;
            }
        }
        assert!(saw_disconnect);
    }

    #[tokio::test]
    async fn test_subscribe_requires_connection() {
        let bus = LocalBus::default();
        let (mut a, _) = bus.endpoint();
        assert_eq!(a.subscribe("x"), Err(TransportError::NotConnected));
    }
}
