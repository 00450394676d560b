use crate::{CoordinationStore, Result, StorageError, StoreDriver};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

// Writes between full sweeps of expired entries.
const SWEEP_EVERY: u64 = 64;

#[derive(Debug, Clone)]
struct Entry {
    // Stored value plus optional expiration.
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

/// In-process coordination store with TTL expiry.
///
/// Expired entries are dropped when read, and every 64th write
/// sweeps the rest, so keys nobody reads again do not pile up.
///
/// ```
/// use bytes::Bytes;
/// use courier_storage::{CoordinationStore, EphemeralStore};
///
/// let store = EphemeralStore::new();
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     store.put("k", Bytes::from_static(b"v"), None).await.expect("put");
///     assert_eq!(store.get("k").await.expect("get"), Some(Bytes::from_static(b"v")));
/// });
/// ```
#[derive(Debug)]
pub struct EphemeralStore {
    // RwLock allows concurrent readers while updates take exclusive access.
    inner: RwLock<HashMap<String, Entry>>,
    // Optional cap on live entries; new keys are refused once it is reached.
    max_entries: Option<usize>,
    writes: AtomicU64,
    // Reported driver. Tests sharing one instance across "processes" use Distributed.
    driver: StoreDriver,
}

impl EphemeralStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            max_entries: Some(max_entries),
            ..Self::default()
        }
    }

    pub fn with_driver(mut self, driver: StoreDriver) -> Self {
        self.driver = driver;
        self
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .read()
            .await
            .values()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for EphemeralStore {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            max_entries: None,
            writes: AtomicU64::new(0),
            driver: StoreDriver::Local,
        }
    }
}

#[async_trait]
impl CoordinationStore for EphemeralStore {
    async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        // Compute expiry once so reads only compare Instants.
        let now = Instant::now();
        let expires_at = ttl.map(|ttl| now + ttl);
        let mut guard = self.inner.write().await;
        self.sweep_if_due(&mut guard, now);
        if let Some(max_entries) = self.max_entries {
            if !guard.contains_key(key) && guard.len() >= max_entries {
                guard.retain(|_, entry| !entry.is_expired(now));
            }
            if !guard.contains_key(key) && guard.len() >= max_entries {
                tracing::warn!(key = %key, max_entries, "ephemeral store full");
                return Err(StorageError::Full {
                    key: key.to_string(),
                    max_entries,
                });
            }
        }
        guard.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        // Take a write lock so we can evict expired entries.
        let mut guard = self.inner.write().await;
        match guard.get(key) {
            Some(entry) if entry.is_expired(Instant::now()) => {
                guard.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<Option<Bytes>> {
        let removed = self.inner.write().await.remove(key);
        Ok(removed
            .filter(|entry| !entry.is_expired(Instant::now()))
            .map(|entry| entry.value))
    }

    async fn delete_if(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut guard = self.inner.write().await;
        let matches = guard
            .get(key)
            .is_some_and(|entry| !entry.is_expired(Instant::now()) && entry.value == expected);
        if matches {
            guard.remove(key);
        }
        Ok(matches)
    }

    async fn put_if(
        &self,
        key: &str,
        expected: &[u8],
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut guard = self.inner.write().await;
        self.sweep_if_due(&mut guard, now);
        let Some(entry) = guard.get_mut(key) else {
            return Ok(false);
        };
        if entry.is_expired(now) || entry.value != expected {
            return Ok(false);
        }
        entry.value = value;
        entry.expires_at = ttl.map(|ttl| now + ttl);
        Ok(true)
    }

    fn driver(&self) -> StoreDriver {
        self.driver
    }
}

impl EphemeralStore {
    fn sweep_if_due(&self, entries: &mut HashMap<String, Entry>, now: Instant) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_EVERY != 0 {
            return;
        }
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let swept = before - entries.len();
        if swept > 0 {
            tracing::debug!(swept, "ephemeral store swept expired entries");
        }
    }
}
