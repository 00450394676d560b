use courier_broker::BrokerError;
use courier_storage::StorageError;

pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("client disconnected")]
    ClientGone,
    #[error("stream writer already closed")]
    WriterClosed,
    #[error("distributed adapter is already listening")]
    AlreadyListening,
    #[error("distributed adapter has no subscriptions")]
    NoSubscriptions,
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

