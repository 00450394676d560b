// Coordination store used for short-lived registry entries and close flags.
// Every write is a single-key upsert or delete with an optional TTL; callers
// never need multi-key transactions.
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

pub mod ephemeral;

pub use ephemeral::EphemeralStore;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("coordination store full: {max_entries} live entries, cannot add {key}")]
    Full { key: String, max_entries: usize },
}

/// Which kind of backend sits behind a [`CoordinationStore`].
///
/// Only a `Distributed` store is shared between processes, so only then is a
/// broker-backed event path worth constructing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreDriver {
    Local,
    Distributed,
}

impl StoreDriver {
    pub fn is_distributed(&self) -> bool {
        matches!(self, StoreDriver::Distributed)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" | "memory" | "array" => Some(StoreDriver::Local),
            "distributed" | "redis" | "shared" => Some(StoreDriver::Distributed),
            _ => None,
        }
    }
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Upsert `key`; `ttl = None` keeps it until deleted.
    async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Remove `key`, returning the previous value if it was live.
    async fn delete(&self, key: &str) -> Result<Option<Bytes>>;

    /// Remove `key` only when its live value equals `expected`.
    async fn delete_if(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Overwrite `key` with `value` and a fresh TTL only when its live value
    /// equals `expected`. Check and write happen atomically.
    async fn put_if(
        &self,
        key: &str,
        expected: &[u8],
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    fn driver(&self) -> StoreDriver;
}
