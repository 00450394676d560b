// In-process bus: synchronous callbacks keyed by the full channel name.
use crate::subscription::{Callback, Dispatch, SubscriptionTable, Token, dispatch};
use serde_json::Value;

#[derive(Default)]
pub struct LocalBus {
    table: SubscriptionTable,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, channel: &str, callback: Callback) -> Token {
        self.table.subscribe(channel, callback)
    }

    pub fn unsubscribe(&self, channel: &str, token: Token) -> bool {
        self.table.unsubscribe(channel, token)
    }

    /// Run every callback of `channel` before returning.
    pub fn emit(&self, channel: &str, payload: &Value) -> Dispatch {
        let callbacks = self.table.callbacks(channel);
        dispatch(channel, &callbacks, payload)
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.table.subscriber_count(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emit_without_subscribers_is_a_noop() {
        let bus = LocalBus::new();
        assert_eq!(bus.emit("nobody", &json!(1)), Dispatch::default());
    }

    #[test]
    fn callback_may_unsubscribe_itself() {
        let bus = Arc::new(LocalBus::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let token_slot = Arc::new(parking_lot::Mutex::new(None));
        let (inner_bus, inner_calls, inner_slot) = (Arc::clone(&bus), Arc::clone(&calls), Arc::clone(&token_slot));
        let token = bus.subscribe(
            "once",
            Arc::new(move |_: &Value| -> anyhow::Result<()> {
                inner_calls.fetch_add(1, Ordering::SeqCst);
                if let Some(token) = *inner_slot.lock() {
                    inner_bus.unsubscribe("once", token);
                }
                Ok(())
            }),
        );
        *token_slot.lock() = Some(token);
        bus.emit("once", &json!(null));
        bus.emit("once", &json!(null));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count("once"), 0);
    }
}
