use courier_broker::{ConnectOptions, MemoryBroker};
use courier_stream::{Callback, DistributedAdapter, EventBus};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn recorder(seen: &Arc<Mutex<Vec<(&'static str, Value)>>>, label: &'static str) -> Callback {
    let seen = Arc::clone(seen);
    Arc::new(move |payload: &Value| -> anyhow::Result<()> {
        seen.lock().push((label, payload.clone()));
        Ok(())
    })
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(1), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition reached");
}

fn distributed_bus(broker: &MemoryBroker) -> (EventBus, Arc<DistributedAdapter>) {
    let adapter = Arc::new(DistributedAdapter::new(
        Arc::new(broker.clone()),
        ConnectOptions::default(),
    ));
    let bus = EventBus::builder("redis:")
        .with_adapter(Arc::clone(&adapter))
        .build();
    (bus, adapter)
}

#[tokio::test]
async fn prefixed_and_plain_channels_never_cross() {
    let broker = MemoryBroker::new();
    let (bus, adapter) = distributed_bus(&broker);
    let seen = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe("redis:orders", recorder(&seen, "distributed"))
        .expect("distributed token");
    bus.subscribe("orders", recorder(&seen, "local"))
        .expect("local token");

    let listener = {
        let adapter = Arc::clone(&adapter);
        tokio::spawn(async move { adapter.start_listening().await })
    };
    wait_until(|| broker.subscriber_count("orders") == 1).await;

    bus.emit("redis:orders", &json!({"id": 1})).await;
    bus.emit("orders", &json!({"id": 2})).await;
    wait_until(|| seen.lock().len() == 2).await;

    let mut seen = seen.lock().clone();
    seen.sort_by_key(|(label, _)| *label);
    assert_eq!(
        seen,
        vec![("distributed", json!({"id": 1})), ("local", json!({"id": 2}))]
    );
    adapter.stop_listening();
    listener.await.expect("join").expect("listen");
}

#[tokio::test]
async fn throwing_subscriber_does_not_starve_later_ones() {
    let broker = MemoryBroker::new();
    let (bus, adapter) = distributed_bus(&broker);
    let seen = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe(
        "redis:room.5",
        Arc::new(|_: &Value| -> anyhow::Result<()> { anyhow::bail!("broken subscriber") }),
    )
    .expect("token");
    bus.subscribe("redis:room.5", recorder(&seen, "healthy"))
        .expect("token");

    let listener = {
        let adapter = Arc::clone(&adapter);
        tokio::spawn(async move { adapter.start_listening().await })
    };
    wait_until(|| broker.subscriber_count("room.5") == 1).await;

    bus.emit("redis:room.5", &json!({"type": "ping"})).await;
    bus.emit("redis:room.5", &json!("second")).await;
    wait_until(|| seen.lock().len() == 2).await;
    assert_eq!(
        *seen.lock(),
        vec![("healthy", json!({"type": "ping"})), ("healthy", json!("second"))]
    );
    adapter.stop_listening();
    listener.await.expect("join").expect("listen");
}

#[tokio::test]
async fn unsubscribe_twice_is_harmless() {
    let broker = MemoryBroker::new();
    let (bus, adapter) = distributed_bus(&broker);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let token = bus
        .subscribe("redis:room.5", recorder(&seen, "gone"))
        .expect("token");
    bus.unsubscribe("redis:room.5", token);
    bus.unsubscribe("redis:room.5", token);
    assert!(adapter.channels().is_empty());

    let local = bus.subscribe("room.5", recorder(&seen, "local")).expect("token");
    bus.unsubscribe("room.5", local);
    bus.unsubscribe("room.5", local);
    bus.emit("room.5", &json!(1)).await;
    assert!(seen.lock().is_empty());
}

#[tokio::test]
async fn emit_without_subscribers_or_listener_does_not_fail() {
    let broker = MemoryBroker::new();
    let (bus, _adapter) = distributed_bus(&broker);
    bus.emit("redis:nobody", &json!({"type": "ping"})).await;
    bus.emit("nobody", &json!(null)).await;

    broker.fail_next_connects(1);
    let (bus, _adapter) = distributed_bus(&broker);
    // The publish connection is refused; emit logs and returns.
    bus.emit("redis:nobody", &json!(1)).await;
}
