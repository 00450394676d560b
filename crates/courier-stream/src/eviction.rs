// Stale-connection eviction, run by a new connection before it registers.
// The close flag is the durable fallback; the close-channel publish is the
// immediate interrupt for a peer blocked in its subscribe.
use crate::Result;
use crate::identity::{ConnectionId, IdentityKey};
use crate::registry::{ConnectionRegistry, close_channel};
use bytes::Bytes;
use courier_broker::{Broker, ConnectOptions};

const CLOSE_PAYLOAD: &[u8] = b"close";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    /// No other connection was registered for the identity.
    NoneRegistered,
    Evicted {
        previous: ConnectionId,
        /// Whether the close-channel publish went through; the flag is set either way.
        signalled: bool,
    },
}

pub async fn evict_stale(
    registry: &ConnectionRegistry,
    broker: &dyn Broker,
    options: &ConnectOptions,
    key: &IdentityKey,
    own_id: &ConnectionId,
) -> Result<Eviction> {
    let previous = match registry.current(key).await? {
        Some(previous) if previous != *own_id => previous,
        _ => return Ok(Eviction::NoneRegistered),
    };
    registry.set_close_flag(&previous).await?;
    let signalled = signal_close(broker, options, &previous).await;
    metrics::counter!("courier_stream_evictions_total").increment(1);
    tracing::info!(
        identity = %key,
        previous = %previous,
        replacement = %own_id,
        signalled,
        "evicting stale stream connection"
    );
    Ok(Eviction::Evicted { previous, signalled })
}

// Short-lived publisher, never the caller's own subscribe connection.
async fn signal_close(broker: &dyn Broker, options: &ConnectOptions, previous: &ConnectionId) -> bool {
    let mut publisher = match broker.connect(&options.without_read_timeout()).await {
        Ok(publisher) => publisher,
        Err(err) => {
            tracing::warn!(previous = %previous, error = %err, "close signal connect failed; relying on close flag");
            return false;
        }
    };
    let outcome = publisher
        .publish(&close_channel(previous), Bytes::from_static(CLOSE_PAYLOAD))
        .await;
    publisher.close().await;
    match outcome {
        Ok(_) => true,
        Err(err) => {
            tracing::warn!(previous = %previous, error = %err, "close signal publish failed; relying on close flag");
            false
        }
    }
}
