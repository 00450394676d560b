//! Bridge between the blocking broker subscribe and in-process callbacks.
//!
//! # Purpose
//! Many local callbacks share one listening broker connection. Registering a
//! callback only touches the in-memory table; [`DistributedAdapter::start_listening`]
//! performs the single blocking subscribe over every known channel and fans
//! each datagram out to the callbacks registered for its channel.
//!
//! # Notes
//! - Publishing uses a separate, lazily opened connection: a connection in
//!   subscriber mode cannot run other commands.
//! - The channel set is snapshotted when listening starts; channels first
//!   subscribed afterwards are only picked up by the next listen.
//! - Callback errors and panics are logged per callback and never end the loop.
use crate::envelope::{Envelope, encode_payload};
use crate::subscription::{Callback, SubscriptionTable, Token, dispatch};
use crate::{Result, StreamError};
use courier_broker::{Broker, BrokerMessage, ConnectOptions, Connection, Interrupt, listen};
use serde_json::Value;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct DistributedAdapter {
    broker: Arc<dyn Broker>,
    options: ConnectOptions,
    table: SubscriptionTable,
    publisher: tokio::sync::Mutex<Option<Box<dyn Connection>>>,
    listening: AtomicBool,
    interrupt: parking_lot::Mutex<Option<Interrupt>>,
}

impl DistributedAdapter {
    pub fn new(broker: Arc<dyn Broker>, options: ConnectOptions) -> Self {
        Self {
            broker,
            // Listen and publish connections wait indefinitely.
            options: options.without_read_timeout(),
            table: SubscriptionTable::default(),
            publisher: tokio::sync::Mutex::new(None),
            listening: AtomicBool::new(false),
            interrupt: parking_lot::Mutex::new(None),
        }
    }

    /// Publish `payload` on `channel`, returning the broker's delivery count.
    pub async fn publish(&self, channel: &str, payload: &Value) -> Result<usize> {
        let raw = encode_payload(payload)?;
        let mut publisher = self.publisher.lock().await;
        if publisher.is_none() {
            *publisher = Some(self.broker.connect(&self.options).await?);
        }
        let Some(connection) = publisher.as_mut() else {
            return Ok(0);
        };
        match connection.publish(channel, raw).await {
            Ok(delivered) => {
                tracing::trace!(channel = %channel, delivered, "published to broker");
                Ok(delivered)
            }
            Err(err) => {
                // Reconnect on the next publish.
                if let Some(mut broken) = publisher.take() {
                    broken.close().await;
                }
                Err(err.into())
            }
        }
    }

    /// Register `callback` for `channel`. Does not start listening.
    pub fn subscribe(&self, channel: &str, callback: Callback) -> Token {
        let token = self.table.subscribe(channel, callback);
        if self.is_listening() {
            tracing::debug!(
                channel = %channel,
                "subscribed while listening; channel joins on the next listen"
            );
        }
        token
    }

    pub fn unsubscribe(&self, channel: &str, token: Token) {
        if !self.table.unsubscribe(channel, token) {
            tracing::trace!(channel = %channel, token = %token, "unsubscribe of unknown token");
        }
    }

    pub fn channels(&self) -> Vec<String> {
        self.table.channels()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.table.subscriber_count(channel)
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Block in the broker subscribe until [`DistributedAdapter::stop_listening`]
    /// is called or the broker connection fails.
    pub async fn start_listening(&self) -> Result<()> {
        let channels = self.table.channels();
        if channels.is_empty() {
            return Err(StreamError::NoSubscriptions);
        }
        if self
            .listening
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StreamError::AlreadyListening);
        }
        tracing::info!(channels = ?channels, "distributed adapter listening");
        let outcome = self.listen_on(&channels).await;
        self.listening.store(false, Ordering::SeqCst);
        self.interrupt.lock().take();
        match &outcome {
            Ok(()) => tracing::info!("distributed adapter stopped listening"),
            Err(err) => tracing::warn!(error = %err, "distributed adapter listen ended"),
        }
        outcome
    }

    /// Make a running [`DistributedAdapter::start_listening`] return.
    pub fn stop_listening(&self) {
        self.listening.store(false, Ordering::SeqCst);
        if let Some(interrupt) = self.interrupt.lock().take() {
            interrupt.unsubscribe_all();
        }
    }

    async fn listen_on(&self, channels: &[String]) -> Result<()> {
        let mut connection = self.broker.connect(&self.options).await?;
        *self.interrupt.lock() = Some(connection.interrupt());
        // Stop requested before the interrupt was in place.
        if !self.is_listening() {
            connection.close().await;
            return Ok(());
        }
        let outcome = listen(connection.as_mut(), channels, |message| {
            self.deliver(message);
            ControlFlow::Continue(())
        })
        .await;
        connection.close().await;
        outcome.map_err(StreamError::from)
    }

    fn deliver(&self, message: BrokerMessage) {
        let envelope = Envelope::from_message(message);
        let callbacks = self.table.callbacks(&envelope.channel);
        if callbacks.is_empty() {
            return;
        }
        let outcome = dispatch(&envelope.channel, &callbacks, &envelope.payload);
        tracing::trace!(
            channel = %envelope.channel,
            delivered = outcome.delivered,
            failed = outcome.failed,
            "dispatched broker message"
        );
    }
}
