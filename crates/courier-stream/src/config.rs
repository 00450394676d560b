use std::time::Duration;

const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RECONNECT_FAILURES: u32 = 3;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 100;
const DEFAULT_REGISTRY_TTL_SECS: u64 = 3600;
const DEFAULT_CLOSE_FLAG_TTL_SECS: u64 = 60;
pub const DEFAULT_CHANNEL_PREFIX: &str = "redis:";

/// Tunables shared by the scheduler, the sources, and dedicated connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    // Scheduler period.
    pub tick_interval: Duration,
    // Bounded wait of a dedicated connection's blocking subscribe.
    pub read_timeout: Duration,
    // Consecutive failed reconnect attempts tolerated after a read timeout.
    pub max_reconnect_failures: u32,
    pub reconnect_delay: Duration,
    pub registry_ttl: Duration,
    pub close_flag_ttl: Duration,
    // Marks a channel name as distributed at the event bus.
    pub channel_prefix: String,
    // Upper bound of broker messages a polling source handles per tick.
    pub max_frames_per_tick: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(DEFAULT_TICK_INTERVAL_MS),
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            max_reconnect_failures: DEFAULT_MAX_RECONNECT_FAILURES,
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            registry_ttl: Duration::from_secs(DEFAULT_REGISTRY_TTL_SECS),
            close_flag_ttl: Duration::from_secs(DEFAULT_CLOSE_FLAG_TTL_SECS),
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
            max_frames_per_tick: 1,
        }
    }
}
