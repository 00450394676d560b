// Channel -> (token, callback) table shared by the local bus and the
// distributed adapter. Callbacks are invoked outside the table lock.
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use uuid::Uuid;

pub type Callback = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by `subscribe`; the only way to remove one callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(Uuid);

impl Token {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Default)]
pub struct SubscriptionTable {
    channels: Mutex<HashMap<String, Vec<(Token, Callback)>>>,
}

impl SubscriptionTable {
    pub fn subscribe(&self, channel: &str, callback: Callback) -> Token {
        let token = Token::new();
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push((token, callback));
        token
    }

    /// Returns whether `token` was still registered. An emptied channel is dropped.
    pub fn unsubscribe(&self, channel: &str, token: Token) -> bool {
        let mut channels = self.channels.lock();
        let Some(entries) = channels.get_mut(channel) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != token);
        let removed = entries.len() != before;
        if entries.is_empty() {
            channels.remove(channel);
        }
        removed
    }

    /// Snapshot of the callbacks for `channel`, in registration order.
    pub fn callbacks(&self, channel: &str) -> Vec<Callback> {
        self.channels
            .lock()
            .get(channel)
            .map(|entries| entries.iter().map(|(_, callback)| Arc::clone(callback)).collect())
            .unwrap_or_default()
    }

    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.channels.lock().keys().cloned().collect();
        channels.sort();
        channels
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.lock().contains_key(channel)
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.lock().get(channel).map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }
}

/// Outcome of handing one payload to every callback of a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatch {
    pub delivered: usize,
    pub failed: usize,
}

/// Invoke each callback in order. Errors and panics are logged and counted;
/// they never stop delivery to the remaining callbacks.
pub fn dispatch(channel: &str, callbacks: &[Callback], payload: &Value) -> Dispatch {
    let mut outcome = Dispatch::default();
    for callback in callbacks {
        match catch_unwind(AssertUnwindSafe(|| callback(payload))) {
            Ok(Ok(())) => outcome.delivered += 1,
            Ok(Err(err)) => {
                outcome.failed += 1;
                metrics::counter!("courier_callback_failures_total").increment(1);
                tracing::warn!(channel = %channel, error = %err, "subscriber callback failed");
            }
            Err(_) => {
                outcome.failed += 1;
                metrics::counter!("courier_callback_failures_total").increment(1);
                tracing::warn!(channel = %channel, "subscriber callback panicked");
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop() -> Callback {
        Arc::new(|_: &Value| -> anyhow::Result<()> { Ok(()) })
    }

    #[test]
    fn removing_last_token_drops_channel() {
        let table = SubscriptionTable::default();
        let first = table.subscribe("orders", noop());
        let second = table.subscribe("orders", noop());
        assert_ne!(first, second);
        assert!(table.unsubscribe("orders", first));
        assert!(table.has_channel("orders"));
        assert!(table.unsubscribe("orders", second));
        assert!(!table.has_channel("orders"));
        assert!(table.is_empty());
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let table = SubscriptionTable::default();
        let token = table.subscribe("orders", noop());
        assert!(table.unsubscribe("orders", token));
        assert!(!table.unsubscribe("orders", token));
        assert!(!table.unsubscribe("missing", Token::new()));
    }

    #[test]
    fn failing_callbacks_do_not_block_later_ones() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let callbacks: Vec<Callback> = vec![
            Arc::new(|_: &Value| -> anyhow::Result<()> { anyhow::bail!("boom") }),
            Arc::new(|_: &Value| -> anyhow::Result<()> { panic!("callback panic") }),
            Arc::new(move |payload: &Value| -> anyhow::Result<()> {
                record.lock().push(payload.clone());
                Ok(())
            }),
        ];
        let outcome = dispatch("orders", &callbacks, &json!({"id": 7}));
        assert_eq!(outcome, Dispatch { delivered: 1, failed: 2 });
        assert_eq!(*seen.lock(), vec![json!({"id": 7})]);
    }
}
