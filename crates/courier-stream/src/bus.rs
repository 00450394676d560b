//! Event bus facade routing channels to the local bus or the distributed adapter.
//!
//! # Purpose
//! Producers call [`EventBus::emit`] without knowing where a channel lives. A
//! name starting with the configured prefix goes to the broker (prefix
//! stripped, exactly once, here); every other name stays in-process.
//!
//! # Notes
//! Without a distributed adapter the bus runs degraded: prefixed emits reach
//! local subscribers of the unstripped name only, and prefixed subscribes
//! return `None` so callers can tell delivery is not guaranteed.
use crate::adapter::DistributedAdapter;
use crate::local::LocalBus;
use crate::subscription::{Callback, Token};
use courier_broker::{Broker, ConnectOptions};
use courier_storage::CoordinationStore;
use serde_json::Value;
use std::sync::Arc;

enum Route<'a> {
    Local(&'a str),
    Distributed(&'a Arc<DistributedAdapter>, &'a str),
}

pub struct EventBusBuilder {
    prefix: String,
    distributed: Option<Arc<DistributedAdapter>>,
}

impl EventBusBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            distributed: None,
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<DistributedAdapter>) -> Self {
        self.distributed = Some(adapter);
        self
    }

    /// Construct a distributed adapter only when `store` is shared between
    /// processes; otherwise leave the bus local-only.
    pub fn detect(self, store: &dyn CoordinationStore, broker: Arc<dyn Broker>, options: ConnectOptions) -> Self {
        if store.driver().is_distributed() {
            self.with_adapter(Arc::new(DistributedAdapter::new(broker, options)))
        } else {
            tracing::info!(
                driver = ?store.driver(),
                "coordination store is not distributed; event bus is local-only"
            );
            self
        }
    }

    pub fn build(self) -> EventBus {
        EventBus {
            prefix: self.prefix,
            local: LocalBus::new(),
            distributed: self.distributed,
        }
    }
}

pub struct EventBus {
    prefix: String,
    local: LocalBus,
    distributed: Option<Arc<DistributedAdapter>>,
}

impl EventBus {
    pub fn builder(prefix: impl Into<String>) -> EventBusBuilder {
        EventBusBuilder::new(prefix)
    }

    pub fn local_only(prefix: impl Into<String>) -> Self {
        EventBusBuilder::new(prefix).build()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn adapter(&self) -> Option<&Arc<DistributedAdapter>> {
        self.distributed.as_ref()
    }

    pub fn is_distributed(&self) -> bool {
        self.distributed.is_some()
    }

    pub fn is_distributed_channel(&self, channel: &str) -> bool {
        !self.prefix.is_empty() && channel.starts_with(self.prefix.as_str())
    }

    fn route<'a>(&'a self, channel: &'a str) -> Route<'a> {
        match (&self.distributed, channel.strip_prefix(self.prefix.as_str())) {
            (Some(adapter), Some(stripped)) if !self.prefix.is_empty() => Route::Distributed(adapter, stripped),
            _ => Route::Local(channel),
        }
    }

    /// Deliver `payload`. Failures are logged; a channel without subscribers is fine.
    pub async fn emit(&self, channel: &str, payload: &Value) {
        match self.route(channel) {
            Route::Distributed(adapter, stripped) => {
                if let Err(err) = adapter.publish(stripped, payload).await {
                    tracing::warn!(channel = %stripped, error = %err, "distributed emit failed");
                }
            }
            Route::Local(name) => {
                self.local.emit(name, payload);
            }
        }
    }

    /// `None` when the channel is distributed but no adapter is configured.
    pub fn subscribe(&self, channel: &str, callback: Callback) -> Option<Token> {
        match self.route(channel) {
            Route::Distributed(adapter, stripped) => Some(adapter.subscribe(stripped, callback)),
            Route::Local(_) if self.is_distributed_channel(channel) => {
                tracing::warn!(
                    channel = %channel,
                    "no distributed adapter configured; subscription not registered"
                );
                None
            }
            Route::Local(name) => Some(self.local.subscribe(name, callback)),
        }
    }

    pub fn unsubscribe(&self, channel: &str, token: Token) {
        match self.route(channel) {
            Route::Distributed(adapter, stripped) => adapter.unsubscribe(stripped, token),
            Route::Local(name) => {
                self.local.unsubscribe(name, token);
            }
        }
    }
}
