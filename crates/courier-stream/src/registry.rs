// Connection registry and close flags in the coordination store.
// Every write is a single-key upsert or delete with a TTL; the latest
// registration for an identity key wins. Writes made on behalf of an existing
// connection are conditional on the entry still naming it.
use crate::Result;
use crate::identity::{ConnectionId, IdentityKey};
use bytes::Bytes;
use courier_storage::CoordinationStore;
use std::sync::Arc;
use std::time::Duration;

const CONNECTION_KEY_PREFIX: &str = "courier:sse:conn:";
const CLOSE_FLAG_KEY_PREFIX: &str = "courier:sse:close:";
const CLOSE_CHANNEL_PREFIX: &str = "courier.sse.close.";
const CLOSE_FLAG_VALUE: &[u8] = b"1";

/// Broker channel on which `id` listens for eviction.
pub fn close_channel(id: &ConnectionId) -> String {
    format!("{CLOSE_CHANNEL_PREFIX}{id}")
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    store: Arc<dyn CoordinationStore>,
    ttl: Duration,
    close_flag_ttl: Duration,
}

impl ConnectionRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>, ttl: Duration, close_flag_ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            close_flag_ttl,
        }
    }

    /// Connection currently registered for `key`, if any.
    pub async fn current(&self, key: &IdentityKey) -> Result<Option<ConnectionId>> {
        let Some(raw) = self.store.get(&connection_key(key)).await? else {
            return Ok(None);
        };
        let parsed = std::str::from_utf8(&raw).ok().and_then(ConnectionId::parse);
        if parsed.is_none() {
            tracing::warn!(identity = %key, "ignoring unreadable connection registry entry");
        }
        Ok(parsed)
    }

    pub async fn register(&self, key: &IdentityKey, id: &ConnectionId) -> Result<()> {
        self.store
            .put(&connection_key(key), Bytes::from(id.to_string()), Some(self.ttl))
            .await?;
        Ok(())
    }

    /// Remove the entry only while it still names `id`; a newer connection's
    /// registration is left alone.
    pub async fn deregister_if_current(&self, key: &IdentityKey, id: &ConnectionId) -> Result<bool> {
        let removed = self
            .store
            .delete_if(&connection_key(key), id.to_string().as_bytes())
            .await?;
        Ok(removed)
    }

    /// Extend the entry's TTL while `id` is still current and not asked to close.
    pub async fn refresh(&self, key: &IdentityKey, id: &ConnectionId) -> Result<bool> {
        if self.close_flag_set(id).await? {
            return Ok(false);
        }
        let value = Bytes::from(id.to_string());
        let refreshed = self
            .store
            .put_if(&connection_key(key), &value, value.clone(), Some(self.ttl))
            .await?;
        Ok(refreshed)
    }

    pub async fn set_close_flag(&self, id: &ConnectionId) -> Result<()> {
        self.store
            .put(
                &close_flag_key(id),
                Bytes::from_static(CLOSE_FLAG_VALUE),
                Some(self.close_flag_ttl),
            )
            .await?;
        Ok(())
    }

    pub async fn close_flag_set(&self, id: &ConnectionId) -> Result<bool> {
        Ok(self.store.get(&close_flag_key(id)).await?.is_some())
    }

    pub async fn clear_close_flag(&self, id: &ConnectionId) -> Result<()> {
        self.store.delete(&close_flag_key(id)).await?;
        Ok(())
    }
}

fn connection_key(key: &IdentityKey) -> String {
    format!("{CONNECTION_KEY_PREFIX}{key}")
}

fn close_flag_key(id: &ConnectionId) -> String {
    format!("{CLOSE_FLAG_KEY_PREFIX}{id}")
}
