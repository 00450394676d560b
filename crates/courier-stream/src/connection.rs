//! Dedicated, blocking-style SSE connection with its own broker subscription.
//!
//! # Purpose
//! Serve one streaming response from one broker connection, outside the
//! cooperative scheduler. Liveness comes from the broker read timeout: every
//! time the blocking read gives up, a heartbeat is written (a dead client
//! makes that write fail), the registry TTL is refreshed, and the broken
//! connection is replaced.
//!
//! # Notes
//! - At most one connection per identity key. [`ConnectionSetup::open`] evicts
//!   the previous holder through its close channel and close flag before
//!   registering itself.
//! - A close signal wins over any message that would follow it.
//! - Run [`DedicatedConnection::subscribe`] on its own task: it owns the
//!   broker connection until it returns.
use crate::config::StreamConfig;
use crate::envelope::Envelope;
use crate::eviction::evict_stale;
use crate::identity::{ConnectionId, Identity, IdentityKey};
use crate::registry::{ConnectionRegistry, close_channel};
use crate::source::Reply;
use crate::sse::SseWriter;
use crate::Result;
use courier_broker::{Broker, ConnectOptions, Connection};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initializing,
    Subscribing,
    HeartbeatWait,
    Delivering,
    Closing,
    Closed,
}

/// Why a dedicated connection's loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// A newer connection for the same identity took over.
    Evicted,
    CallbackStopped,
    ClientGone,
    ReconnectExhausted,
    /// The broker subscription was cancelled from elsewhere.
    Interrupted,
    Broker(String),
}

impl ExitReason {
    pub fn as_label(&self) -> &'static str {
        match self {
            ExitReason::Evicted => "evicted",
            ExitReason::CallbackStopped => "callback_stopped",
            ExitReason::ClientGone => "client_gone",
            ExitReason::ReconnectExhausted => "reconnect_exhausted",
            ExitReason::Interrupted => "interrupted",
            ExitReason::Broker(_) => "broker_error",
        }
    }
}

/// Shared dependencies for opening dedicated connections.
#[derive(Clone)]
pub struct ConnectionSetup {
    registry: ConnectionRegistry,
    broker: Arc<dyn Broker>,
    options: ConnectOptions,
    config: StreamConfig,
}

impl ConnectionSetup {
    pub fn new(
        registry: ConnectionRegistry,
        broker: Arc<dyn Broker>,
        options: ConnectOptions,
        config: StreamConfig,
    ) -> Self {
        Self {
            registry,
            broker,
            options,
            config,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Evict any stale holder of the identity, register, then open the broker
    /// connection with the bounded read timeout. On connect failure the
    /// registration is rolled back.
    pub async fn open(&self, identity: &Identity, path: &str, writer: SseWriter) -> Result<DedicatedConnection> {
        let id = ConnectionId::new();
        let key = IdentityKey::derive(identity, path);
        let (state, _) = watch::channel(ConnectionState::Initializing);

        evict_stale(&self.registry, self.broker.as_ref(), &self.options, &key, &id).await?;
        self.registry.register(&key, &id).await?;

        let options = self.options.clone().with_read_timeout(self.config.read_timeout);
        let connection = match self.broker.connect(&options).await {
            Ok(connection) => connection,
            Err(err) => {
                if let Err(cleanup) = self.registry.deregister_if_current(&key, &id).await {
                    tracing::warn!(connection = %id, error = %cleanup, "rollback of registry entry failed");
                }
                tracing::warn!(connection = %id, error = %err, "dedicated stream broker connect failed");
                return Err(err.into());
            }
        };

        metrics::gauge!("courier_dedicated_connections").increment(1.0);
        tracing::info!(connection = %id, identity = %key, path = %path, "dedicated stream opened");
        Ok(DedicatedConnection {
            session: Session {
                id,
                key,
                registry: self.registry.clone(),
                broker: Arc::clone(&self.broker),
                options,
                config: self.config.clone(),
                writer,
                state,
            },
            connection: Some(connection),
        })
    }
}

// Everything the loop needs besides the broker connection itself.
struct Session {
    id: ConnectionId,
    key: IdentityKey,
    registry: ConnectionRegistry,
    broker: Arc<dyn Broker>,
    options: ConnectOptions,
    config: StreamConfig,
    writer: SseWriter,
    state: watch::Sender<ConnectionState>,
}

pub struct DedicatedConnection {
    session: Session,
    connection: Option<Box<dyn Connection>>,
}

enum Cycle {
    Exit(ExitReason),
    TimedOut,
}

impl DedicatedConnection {
    pub fn id(&self) -> ConnectionId {
        self.session.id
    }

    pub fn identity_key(&self) -> &IdentityKey {
        &self.session.key
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.session.state.subscribe()
    }

    /// Stream messages from `channels` until a close signal, a callback
    /// `Reply::Stop`, a dead client, exhausted reconnects, or a broker error.
    pub async fn subscribe<F>(self, channels: Vec<String>, mut callback: F) -> ExitReason
    where
        F: FnMut(&str, &Value) -> Reply + Send,
    {
        let DedicatedConnection {
            session,
            mut connection,
        } = self;
        let own_close = close_channel(&session.id);
        let mut subscribed = channels.clone();
        if !subscribed.contains(&own_close) {
            subscribed.push(own_close.clone());
        }

        let reason = loop {
            if session.close_requested().await {
                break ExitReason::Evicted;
            }
            let Some(active) = connection.as_mut() else {
                match session.reconnect().await {
                    Some(fresh) => {
                        connection = Some(fresh);
                        continue;
                    }
                    None => break ExitReason::ReconnectExhausted,
                }
            };

            session.set_state(ConnectionState::Subscribing);
            if let Err(err) = active.subscribe(&subscribed).await {
                tracing::warn!(connection = %session.id, error = %err, "dedicated stream subscribe failed");
                break ExitReason::Broker(err.to_string());
            }
            session.set_state(ConnectionState::HeartbeatWait);
            if let Cycle::Exit(reason) = session
                .pump(active.as_mut(), &channels, &own_close, &mut callback)
                .await
            {
                break reason;
            }

            // Read timeout: probe the client, keep the registration alive, and
            // drop the connection the timeout broke.
            if let Err(err) = session.writer.heartbeat() {
                tracing::debug!(connection = %session.id, error = %err, "heartbeat failed");
                break ExitReason::ClientGone;
            }
            match session.registry.refresh(&session.key, &session.id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(connection = %session.id, "registry entry no longer owned; not refreshed")
                }
                Err(err) => tracing::warn!(connection = %session.id, error = %err, "registry refresh failed"),
            }
            if let Some(mut broken) = connection.take() {
                broken.close().await;
            }
        };

        session.finish(connection, reason).await
    }

    /// Release the connection without streaming.
    pub async fn close(self) -> ExitReason {
        self.session
            .finish(self.connection, ExitReason::Interrupted)
            .await
    }
}

impl Session {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    async fn close_requested(&self) -> bool {
        match self.registry.close_flag_set(&self.id).await {
            Ok(flagged) => flagged,
            Err(err) => {
                tracing::warn!(connection = %self.id, error = %err, "close flag lookup failed");
                false
            }
        }
    }

    async fn pump<F>(
        &self,
        connection: &mut dyn Connection,
        channels: &[String],
        own_close: &str,
        callback: &mut F,
    ) -> Cycle
    where
        F: FnMut(&str, &Value) -> Reply + Send,
    {
        loop {
            let message = match connection.next_message().await {
                Ok(Some(message)) => message,
                Ok(None) => return Cycle::Exit(ExitReason::Interrupted),
                Err(err) if err.is_read_timeout() => {
                    tracing::debug!(connection = %self.id, "read timeout; sending heartbeat");
                    return Cycle::TimedOut;
                }
                Err(err) => {
                    tracing::warn!(connection = %self.id, error = %err, "dedicated stream broker read failed");
                    return Cycle::Exit(ExitReason::Broker(err.to_string()));
                }
            };
            if message.channel == own_close || self.close_requested().await {
                return Cycle::Exit(ExitReason::Evicted);
            }
            if !channels.contains(&message.channel) {
                continue;
            }

            self.set_state(ConnectionState::Delivering);
            let envelope = Envelope::from_message(message);
            match callback(&envelope.channel, &envelope.payload) {
                Reply::Stop => return Cycle::Exit(ExitReason::CallbackStopped),
                Reply::Skip => {}
                Reply::Message(message) => {
                    if let Err(err) = self.writer.send(&message) {
                        tracing::debug!(connection = %self.id, error = %err, "stream write failed");
                        return Cycle::Exit(ExitReason::ClientGone);
                    }
                }
            }
            self.set_state(ConnectionState::HeartbeatWait);
        }
    }

    async fn reconnect(&self) -> Option<Box<dyn Connection>> {
        let limit = self.config.max_reconnect_failures.max(1);
        let mut failures = 0;
        loop {
            match self.broker.connect(&self.options).await {
                Ok(fresh) => {
                    metrics::counter!("courier_broker_reconnects_total").increment(1);
                    tracing::debug!(connection = %self.id, "broker connection re-established");
                    return Some(fresh);
                }
                Err(err) => {
                    failures += 1;
                    tracing::warn!(
                        connection = %self.id,
                        attempt = failures,
                        limit,
                        error = %err,
                        "broker reconnect failed"
                    );
                    if failures >= limit {
                        return None;
                    }
                    tokio::time::sleep(self.config.reconnect_delay).await;
                }
            }
        }
    }

    async fn finish(&self, connection: Option<Box<dyn Connection>>, reason: ExitReason) -> ExitReason {
        self.set_state(ConnectionState::Closing);
        if let Some(mut connection) = connection {
            connection.close().await;
        }
        match self.registry.deregister_if_current(&self.key, &self.id).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(connection = %self.id, "identity already owned by a newer connection"),
            Err(err) => tracing::warn!(connection = %self.id, error = %err, "deregistration failed"),
        }
        if let Err(err) = self.registry.clear_close_flag(&self.id).await {
            tracing::warn!(connection = %self.id, error = %err, "close flag cleanup failed");
        }
        self.writer.close();
        self.set_state(ConnectionState::Closed);
        metrics::gauge!("courier_dedicated_connections").decrement(1.0);
        tracing::info!(connection = %self.id, reason = reason.as_label(), "dedicated stream closed");
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse;
    use courier_broker::MemoryBroker;
    use courier_storage::EphemeralStore;
    use std::time::Duration;

    fn setup(broker: &MemoryBroker) -> ConnectionSetup {
        let registry = ConnectionRegistry::new(
            Arc::new(EphemeralStore::new()),
            Duration::from_secs(60),
            Duration::from_secs(5),
        );
        ConnectionSetup::new(
            registry,
            Arc::new(broker.clone()),
            ConnectOptions::default(),
            StreamConfig::default(),
        )
    }

    #[tokio::test]
    async fn connect_failure_rolls_back_registration() {
        let broker = MemoryBroker::new();
        let setup = setup(&broker);
        let identity = Identity::user("9", "abc");
        broker.fail_next_connects(1);
        let (writer, _body) = sse::channel();
        assert!(setup.open(&identity, "/stream", writer).await.is_err());
        let key = IdentityKey::derive(&identity, "/stream");
        assert_eq!(setup.registry().current(&key).await.expect("current"), None);
    }

    #[tokio::test]
    async fn close_without_streaming_releases_everything() {
        let broker = MemoryBroker::new();
        let setup = setup(&broker);
        let identity = Identity::user("9", "abc");
        let (writer, mut body) = sse::channel();
        let connection = setup.open(&identity, "/stream", writer).await.expect("open");
        let state = connection.state();
        let key = connection.identity_key().clone();
        assert_eq!(*state.borrow(), ConnectionState::Initializing);

        assert_eq!(connection.close().await, ExitReason::Interrupted);
        assert_eq!(*state.borrow(), ConnectionState::Closed);
        assert_eq!(setup.registry().current(&key).await.expect("current"), None);
        assert_eq!(broker.open_connections(), 0);
        assert!(body.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn callback_stop_ends_the_stream() {
        let broker = MemoryBroker::new();
        let setup = setup(&broker);
        let (writer, mut body) = sse::channel();
        let connection = setup
            .open(&Identity::anonymous("s1"), "/stream", writer)
            .await
            .expect("open");
        let task = tokio::spawn(connection.subscribe(vec!["jobs".into()], |_, payload| {
            if payload == "done" {
                Reply::Stop
            } else {
                Reply::send(payload.clone())
            }
        }));
        while broker.subscriber_count("jobs") == 0 {
            tokio::task::yield_now().await;
        }
        let mut publisher = broker
            .connect(&ConnectOptions::default())
            .await
            .expect("connect");
        for payload in ["1", "done", "2"] {
            publisher
                .publish("jobs", bytes::Bytes::from(payload))
                .await
                .expect("publish");
        }
        assert_eq!(task.await.expect("join"), ExitReason::CallbackStopped);
        assert_eq!(body.next_chunk().await.expect("chunk"), bytes::Bytes::from_static(b"data: 1\n\n"));
        assert!(body.next_chunk().await.is_none());
    }
}
