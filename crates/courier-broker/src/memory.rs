// In-process broker with per-channel subscriber slabs.
// Every connection owns one unbounded queue; subscribing parks a clone of its
// sender in the slab of each channel, and publishing fans out to the slab.
use crate::{Broker, BrokerError, BrokerMessage, ConnectOptions, Connection, Frame, Interrupt, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use slab::Slab;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

type ChannelTable = HashMap<String, Slab<mpsc::UnboundedSender<BrokerMessage>>>;

#[derive(Debug, Default)]
struct Shared {
    channels: Mutex<ChannelTable>,
    password: Option<String>,
    // Remaining connect attempts to refuse; lets tests drive reconnect exhaustion.
    refuse_connects: AtomicUsize,
    next_connection_id: AtomicU64,
    opened: AtomicUsize,
    released: AtomicUsize,
    closed: AtomicUsize,
}

impl Shared {
    fn deliver(&self, channel: &str, payload: Bytes) -> usize {
        let channels = self.channels.lock();
        let Some(senders) = channels.get(channel) else {
            return 0;
        };
        senders
            .iter()
            .filter(|(_, sender)| {
                sender
                    .send(BrokerMessage {
                        channel: channel.to_string(),
                        payload: payload.clone(),
                    })
                    .is_ok()
            })
            .count()
    }

    fn unregister(&self, registrations: &mut Vec<(String, usize)>) {
        if registrations.is_empty() {
            return;
        }
        let mut channels = self.channels.lock();
        for (channel, key) in registrations.drain(..) {
            if let Some(senders) = channels.get_mut(&channel) {
                if senders.contains(key) {
                    senders.remove(key);
                }
                if senders.is_empty() {
                    channels.remove(&channel);
                }
            }
        }
    }
}

/// Cloneable handle to an in-process broker; clones share channels and counters.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `password` on every connect.
    pub fn with_password(password: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                password: Some(password.into()),
                ..Shared::default()
            }),
        }
    }

    /// Refuse the next `count` connect attempts with a connect error.
    pub fn fail_next_connects(&self, count: usize) {
        self.shared.refuse_connects.store(count, Ordering::SeqCst);
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.shared
            .channels
            .lock()
            .get(channel)
            .map(Slab::len)
            .unwrap_or(0)
    }

    pub fn opened_connections(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    /// Connections released through an explicit `close`.
    pub fn closed_connections(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Connections neither closed nor dropped yet.
    pub fn open_connections(&self) -> usize {
        self.opened_connections()
            .saturating_sub(self.shared.released.load(Ordering::SeqCst))
    }

    fn take_refusal(&self) -> bool {
        self.shared
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, options: &ConnectOptions) -> Result<Box<dyn Connection>> {
        if self.take_refusal() {
            metrics::counter!("courier_broker_connect_failures_total").increment(1);
            return Err(BrokerError::Connect {
                addr: options.addr(),
                reason: "connection refused".to_string(),
            });
        }
        if let Some(expected) = &self.shared.password {
            if options.password.as_deref() != Some(expected.as_str()) {
                metrics::counter!("courier_broker_connect_failures_total").increment(1);
                return Err(BrokerError::Auth);
            }
        }
        let id = self.shared.next_connection_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(connection_id = id, addr = %options.addr(), "memory broker connection opened");
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Box::new(MemoryConnection {
            id,
            shared: Arc::clone(&self.shared),
            read_timeout: options.read_timeout,
            state: ConnState::Ready,
            registrations: Vec::new(),
            tx,
            rx,
            control: VecDeque::new(),
            interrupt: CancellationToken::new(),
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Ready,
    Subscribed,
    Broken,
    Closed,
}

struct MemoryConnection {
    id: u64,
    shared: Arc<Shared>,
    read_timeout: Option<Duration>,
    state: ConnState,
    // (channel, slab key) for every channel this connection listens on.
    registrations: Vec<(String, usize)>,
    tx: mpsc::UnboundedSender<BrokerMessage>,
    rx: mpsc::UnboundedReceiver<BrokerMessage>,
    // Pending subscribe confirmations, surfaced by the non-blocking iterator only.
    control: VecDeque<Frame>,
    interrupt: CancellationToken,
}

impl MemoryConnection {
    fn ensure_usable(&self) -> Result<()> {
        match self.state {
            ConnState::Broken => Err(BrokerError::Broken),
            ConnState::Closed => Err(BrokerError::Closed),
            ConnState::Ready | ConnState::Subscribed => Ok(()),
        }
    }

    fn unsubscribe_all(&mut self) {
        self.shared.unregister(&mut self.registrations);
        self.control.clear();
        while self.rx.try_recv().is_ok() {}
        self.interrupt = CancellationToken::new();
        if self.state == ConnState::Subscribed {
            self.state = ConnState::Ready;
        }
    }

    fn release(&mut self) {
        self.shared.unregister(&mut self.registrations);
        self.shared.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn publish(&mut self, channel: &str, payload: Bytes) -> Result<usize> {
        self.ensure_usable()?;
        if self.state == ConnState::Subscribed {
            return Err(BrokerError::SubscriberMode);
        }
        let delivered = self.shared.deliver(channel, payload);
        metrics::counter!("courier_broker_published_total").increment(1);
        Ok(delivered)
    }

    async fn subscribe(&mut self, channels: &[String]) -> Result<()> {
        self.ensure_usable()?;
        let mut table = self.shared.channels.lock();
        for channel in channels {
            if self.registrations.iter().any(|(existing, _)| existing == channel) {
                continue;
            }
            let key = table
                .entry(channel.clone())
                .or_default()
                .insert(self.tx.clone());
            self.registrations.push((channel.clone(), key));
            self.control.push_back(Frame::Subscribed {
                channel: channel.clone(),
                count: self.registrations.len(),
            });
        }
        drop(table);
        self.state = ConnState::Subscribed;
        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<BrokerMessage>> {
        self.ensure_usable()?;
        if self.state != ConnState::Subscribed {
            return Err(BrokerError::NotSubscribed);
        }
        // Blocking consumers never see confirmations.
        self.control.clear();
        let interrupt = self.interrupt.clone();
        let read = async {
            match self.read_timeout {
                Some(limit) => tokio::time::timeout(limit, self.rx.recv()).await.map_err(|_| limit),
                None => Ok(self.rx.recv().await),
            }
        };
        let outcome = tokio::select! {
            biased;
            _ = interrupt.cancelled() => None,
            outcome = read => Some(outcome),
        };
        match outcome {
            None => {
                self.unsubscribe_all();
                Ok(None)
            }
            Some(Ok(Some(message))) => Ok(Some(message)),
            // The connection holds its own sender, so the queue cannot close while it lives.
            Some(Ok(None)) => {
                self.state = ConnState::Broken;
                Err(BrokerError::Broken)
            }
            Some(Err(limit)) => {
                self.shared.unregister(&mut self.registrations);
                self.state = ConnState::Broken;
                Err(BrokerError::ReadTimeout(limit))
            }
        }
    }

    fn try_next_frame(&mut self) -> Result<Option<Frame>> {
        self.ensure_usable()?;
        if let Some(frame) = self.control.pop_front() {
            return Ok(Some(frame));
        }
        if self.state != ConnState::Subscribed {
            return Ok(None);
        }
        if self.interrupt.is_cancelled() {
            self.unsubscribe_all();
            return Ok(None);
        }
        match self.rx.try_recv() {
            Ok(message) => Ok(Some(Frame::Message(message))),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                self.state = ConnState::Broken;
                Err(BrokerError::Broken)
            }
        }
    }

    fn interrupt(&self) -> Interrupt {
        Interrupt::new(self.interrupt.clone())
    }

    async fn close(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        self.state = ConnState::Closed;
        self.release();
        self.shared.closed.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(connection_id = self.id, "memory broker connection closed");
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if self.state != ConnState::Closed {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    async fn connect(broker: &MemoryBroker) -> Box<dyn Connection> {
        broker
            .connect(&ConnectOptions::default())
            .await
            .expect("connect")
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let broker = MemoryBroker::new();
        let mut first = connect(&broker).await;
        let mut second = connect(&broker).await;
        let mut publisher = connect(&broker).await;
        first.subscribe(&["news".into()]).await.expect("subscribe");
        second.subscribe(&["news".into()]).await.expect("subscribe");

        let delivered = publisher
            .publish("news", Bytes::from_static(b"hello"))
            .await
            .expect("publish");
        assert_eq!(delivered, 2);
        for conn in [&mut first, &mut second] {
            let message = conn.next_message().await.expect("read").expect("message");
            assert_eq!(message.payload, Bytes::from_static(b"hello"));
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_delivers_nothing() {
        let broker = MemoryBroker::new();
        let mut publisher = connect(&broker).await;
        let delivered = publisher
            .publish("empty", Bytes::from_static(b"x"))
            .await
            .expect("publish");
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn subscribed_connection_rejects_publish() {
        let broker = MemoryBroker::new();
        let mut conn = connect(&broker).await;
        conn.subscribe(&["a".into()]).await.expect("subscribe");
        let err = conn
            .publish("a", Bytes::from_static(b"x"))
            .await
            .expect_err("subscriber mode");
        assert_eq!(err, BrokerError::SubscriberMode);
    }

    #[tokio::test]
    async fn read_timeout_breaks_connection() {
        let broker = MemoryBroker::new();
        let mut conn = broker
            .connect(&ConnectOptions::default().with_read_timeout(Duration::from_millis(20)))
            .await
            .expect("connect");
        conn.subscribe(&["quiet".into()]).await.expect("subscribe");
        let started = Instant::now();
        let err = conn.next_message().await.expect_err("timeout");
        assert!(err.is_read_timeout());
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(broker.subscriber_count("quiet"), 0);
        assert_eq!(conn.next_message().await.expect_err("broken"), BrokerError::Broken);
    }

    #[tokio::test]
    async fn interrupt_unblocks_reader() {
        let broker = MemoryBroker::new();
        let mut conn = connect(&broker).await;
        conn.subscribe(&["a".into(), "b".into()]).await.expect("subscribe");
        let interrupt = conn.interrupt();
        let reader = tokio::spawn(async move {
            let outcome = conn.next_message().await;
            (outcome, conn)
        });
        interrupt.unsubscribe_all();
        let (outcome, mut conn) = reader.await.expect("join");
        assert_eq!(outcome.expect("read"), None);
        assert_eq!(broker.subscriber_count("a"), 0);
        // Unsubscribed connections may publish again.
        conn.publish("a", Bytes::from_static(b"x")).await.expect("publish");
    }

    #[tokio::test]
    async fn refused_connects_are_counted_down() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(2);
        for _ in 0..2 {
            let err = broker
                .connect(&ConnectOptions::default())
                .await
                .err()
                .expect("refused");
            assert!(matches!(err, BrokerError::Connect { .. }));
        }
        let _conn = connect(&broker).await;
        assert_eq!(broker.opened_connections(), 1);
    }

    #[tokio::test]
    async fn password_is_enforced() {
        let broker = MemoryBroker::with_password("pw");
        let err = broker
            .connect(&ConnectOptions::default())
            .await
            .err()
            .expect("auth");
        assert_eq!(err, BrokerError::Auth);
        broker
            .connect(&ConnectOptions::default().with_password("pw"))
            .await
            .expect("authenticated");
    }

    #[tokio::test]
    async fn close_and_drop_release_subscriptions() {
        let broker = MemoryBroker::new();
        let mut closed = connect(&broker).await;
        let dropped = {
            let mut conn = connect(&broker).await;
            conn.subscribe(&["c".into()]).await.expect("subscribe");
            conn
        };
        closed.subscribe(&["c".into()]).await.expect("subscribe");
        assert_eq!(broker.subscriber_count("c"), 2);

        closed.close().await;
        closed.close().await;
        assert_eq!(broker.closed_connections(), 1);
        assert_eq!(closed.try_next_frame().expect_err("closed"), BrokerError::Closed);

        drop(dropped);
        assert_eq!(broker.subscriber_count("c"), 0);
        assert_eq!(broker.open_connections(), 0);
    }
}
