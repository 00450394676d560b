// Real-time event distribution and SSE streaming.
// Two consumption strategies share the broker primitives: the cooperative
// `Scheduler` ticking non-blocking sources, and `DedicatedConnection`, which
// owns a blocking broker subscription for the life of one response.
pub mod adapter;
pub mod broker_source;
pub mod bus;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod eviction;
pub mod identity;
pub mod local;
pub mod registry;
pub mod scheduler;
pub mod source;
pub mod sse;
pub mod subscription;
pub mod teardown;

pub use adapter::DistributedAdapter;
pub use broker_source::BrokerPollSource;
pub use bus::{EventBus, EventBusBuilder};
pub use config::StreamConfig;
pub use connection::{ConnectionSetup, ConnectionState, DedicatedConnection, ExitReason};
pub use envelope::Envelope;
pub use error::{Result, StreamError};
pub use identity::{ConnectionId, Identity, IdentityKey};
pub use local::LocalBus;
pub use registry::ConnectionRegistry;
pub use scheduler::{Scheduler, SchedulerExit, SchedulerHandle, SchedulerState};
pub use source::{PollSource, Reply, TickContext, TickableSource};
pub use sse::{SseBody, SseMessage, SseWriter};
pub use subscription::{Callback, Token};
pub use teardown::Teardown;
