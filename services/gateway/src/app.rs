//! Gateway HTTP application wiring.
//!
//! # Purpose
//! Builds the shared state (event bus, connection setup, broker handle) and
//! the Axum router, and supervises the distributed adapter's listener.
//!
//! # Notes
//! The broker and coordination store are injected so tests can hand in the
//! in-memory implementations.
use crate::api;
use crate::config::GatewayConfig;
use axum::Router;
use courier_broker::{Broker, ConnectOptions};
use courier_storage::CoordinationStore;
use courier_stream::{
    Callback, ConnectionRegistry, ConnectionSetup, DistributedAdapter, EventBus, StreamConfig,
    StreamError,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<EventBus>,
    pub setup: ConnectionSetup,
    pub broker: Arc<dyn Broker>,
    pub options: ConnectOptions,
    pub stream: StreamConfig,
}

pub fn build_state(
    config: &GatewayConfig,
    broker: Arc<dyn Broker>,
    store: Arc<dyn CoordinationStore>,
) -> AppState {
    let options = config.connect_options();
    let stream = config.stream_config();
    let bus = EventBus::builder(stream.channel_prefix.clone())
        .detect(store.as_ref(), Arc::clone(&broker), options.clone())
        .build();
    let registry = ConnectionRegistry::new(store, stream.registry_ttl, stream.close_flag_ttl);
    let setup = ConnectionSetup::new(
        registry,
        Arc::clone(&broker),
        options.clone(),
        stream.clone(),
    );
    AppState {
        bus: Arc::new(bus),
        setup,
        broker,
        options,
        stream,
    }
}

pub fn build_router(state: AppState) -> Router {
    let trace_layer =
        TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version()
            )
        });

    Router::new()
        .route(
            "/v1/stream",
            axum::routing::get(api::stream::dedicated_stream),
        )
        .route(
            "/v1/events",
            axum::routing::get(api::stream::polled_events),
        )
        .route(
            "/v1/publish/:channel",
            axum::routing::post(api::publish::publish),
        )
        .layer(trace_layer)
        .with_state(state)
}

fn audit_callback(channel: String) -> Callback {
    Arc::new(move |payload: &Value| -> anyhow::Result<()> {
        tracing::debug!(channel = %channel, payload = %payload, "audit");
        Ok(())
    })
}

/// Install the debug-logging audit subscriber on every configured channel.
/// Returns how many subscriptions were registered.
pub fn install_audit_subscribers(bus: &EventBus, channels: &[String]) -> usize {
    let mut installed = 0;
    for channel in channels {
        match bus.subscribe(channel, audit_callback(channel.clone())) {
            Some(_) => installed += 1,
            None => tracing::warn!(channel = %channel, "audit subscriber not installed"),
        }
    }
    installed
}

/// Keep the adapter listening until [`DistributedAdapter::stop_listening`];
/// a failed listen is retried after `retry_delay`.
pub async fn supervise_listener(adapter: Arc<DistributedAdapter>, retry_delay: Duration) {
    loop {
        match adapter.start_listening().await {
            Ok(()) => return,
            Err(StreamError::NoSubscriptions) => {
                tracing::info!("no distributed subscriptions; adapter listener not started");
                return;
            }
            Err(err) => {
                metrics::counter!("courier_adapter_listen_failures_total").increment(1);
                tracing::warn!(error = %err, "adapter listener failed; retrying");
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_broker::MemoryBroker;
    use courier_storage::{EphemeralStore, StoreDriver};

    fn config(driver: StoreDriver) -> GatewayConfig {
        GatewayConfig {
            bind_addr: "127.0.0.1:0".parse().expect("addr"),
            metrics_bind: "127.0.0.1:0".parse().expect("addr"),
            broker_host: "127.0.0.1".to_string(),
            broker_port: 6379,
            broker_password: None,
            broker_read_timeout_secs: 30,
            tick_interval_ms: 1000,
            max_reconnect_failures: 3,
            reconnect_delay_ms: 100,
            registry_ttl_secs: 3600,
            close_flag_ttl_secs: 60,
            channel_prefix: "redis:".to_string(),
            store_driver: driver,
            audit_channels: Vec::new(),
        }
    }

    fn state(driver: StoreDriver) -> AppState {
        build_state(
            &config(driver),
            Arc::new(MemoryBroker::new()),
            Arc::new(EphemeralStore::new().with_driver(driver)),
        )
    }

    #[test]
    fn store_driver_decides_the_adapter() {
        assert!(state(StoreDriver::Distributed).bus.is_distributed());
        assert!(!state(StoreDriver::Local).bus.is_distributed());
    }

    #[test]
    fn audit_subscribers_skip_distributed_channels_without_adapter() {
        let local = state(StoreDriver::Local);
        let channels = vec!["redis:orders".to_string(), "jobs".to_string()];
        assert_eq!(install_audit_subscribers(&local.bus, &channels), 1);

        let distributed = state(StoreDriver::Distributed);
        assert_eq!(install_audit_subscribers(&distributed.bus, &channels), 2);
        let adapter = distributed.bus.adapter().expect("adapter");
        assert_eq!(adapter.channels(), vec!["orders"]);
    }

    #[tokio::test]
    async fn listener_without_subscriptions_returns() {
        let distributed = state(StoreDriver::Distributed);
        let adapter = Arc::clone(distributed.bus.adapter().expect("adapter"));
        tokio::time::timeout(
            Duration::from_secs(1),
            supervise_listener(adapter, Duration::from_millis(1)),
        )
        .await
        .expect("supervisor returned");
    }

    #[tokio::test]
    async fn listener_retries_after_refused_connect() {
        let broker = MemoryBroker::new();
        let state = build_state(
            &config(StoreDriver::Distributed),
            Arc::new(broker.clone()),
            Arc::new(EphemeralStore::new().with_driver(StoreDriver::Distributed)),
        );
        install_audit_subscribers(&state.bus, &["redis:orders".to_string()]);
        let adapter = Arc::clone(state.bus.adapter().expect("adapter"));

        broker.fail_next_connects(2);
        let supervisor = tokio::spawn(supervise_listener(
            Arc::clone(&adapter),
            Duration::from_millis(1),
        ));
        tokio::time::timeout(Duration::from_secs(1), async {
            while broker.subscriber_count("orders") == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("listener subscribed after retries");

        adapter.stop_listening();
        tokio::time::timeout(Duration::from_secs(1), supervisor)
            .await
            .expect("supervisor stopped")
            .expect("join");
    }
}
