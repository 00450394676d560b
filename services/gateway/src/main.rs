//! SSE gateway entry point.
//!
//! # Purpose
//! Wires configuration, the broker, the coordination store, and the event bus,
//! then serves the streaming API and the metrics listener until Ctrl-C.
//!
//! # Notes
//! The broker and store are the in-process implementations; both sit behind
//! traits so a networked backend only changes `build_backends`.
use anyhow::Context;
use courier_broker::{Broker, MemoryBroker};
use courier_storage::{CoordinationStore, EphemeralStore};
use gateway::app::{self, build_router, build_state};
use gateway::config::GatewayConfig;
use gateway::observability::{self, Readiness};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env_or_yaml().context("gateway config")?;
    run_with_shutdown(config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

fn build_backends(config: &GatewayConfig) -> (Arc<dyn Broker>, Arc<dyn CoordinationStore>) {
    let broker = match &config.broker_password {
        Some(password) => MemoryBroker::with_password(password.clone()),
        None => MemoryBroker::new(),
    };
    let store = EphemeralStore::new().with_driver(config.store_driver);
    tracing::info!(
        broker = %format!("{}:{}", config.broker_host, config.broker_port),
        store_driver = ?config.store_driver,
        "using in-process broker and coordination store"
    );
    (Arc::new(broker), Arc::new(store))
}

async fn run_with_shutdown<F>(config: GatewayConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("courier-gateway");
    let readiness = Readiness::new();
    let (broker, store) = build_backends(&config);
    let state = build_state(&config, broker, store);

    let audit = app::install_audit_subscribers(&state.bus, &config.audit_channels);
    let listener_task = state.bus.adapter().cloned().map(|adapter| {
        let retry_delay = Duration::from_millis(config.reconnect_delay_ms.max(1));
        tokio::spawn(app::supervise_listener(adapter, retry_delay))
    });
    tracing::info!(
        distributed = state.bus.is_distributed(),
        audit_subscribers = audit,
        prefix = %state.bus.prefix(),
        "event bus ready"
    );

    let metrics_task = tokio::spawn(observability::serve_metrics(
        metrics_handle,
        readiness.clone(),
        config.metrics_bind,
    ));

    let bus = Arc::clone(&state.bus);
    let router = build_router(state);
    let addr = config.bind_addr;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, "gateway listening");
    readiness.mark_ready();

    tokio::pin!(shutdown);
    tokio::select! {
        result = axum::serve(listener, router.into_make_service()) => {
            result?;
        }
        _ = &mut shutdown => {
            tracing::info!("shutdown requested");
        }
    }

    readiness.mark_not_ready();
    if let Some(adapter) = bus.adapter() {
        adapter.stop_listening();
    }
    metrics_task.abort();
    let _ = metrics_task.await;
    if let Some(task) = listener_task {
        task.abort();
        let _ = task.await;
    }
    Ok(())
}
