use anyhow::{Context, Result};
use courier_broker::ConnectOptions;
use courier_storage::StoreDriver;
use courier_stream::StreamConfig;
use courier_stream::config::DEFAULT_CHANNEL_PREFIX;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_BROKER_HOST: &str = "127.0.0.1";
const DEFAULT_BROKER_PORT: u16 = 6379;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;
const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;
const DEFAULT_MAX_RECONNECT_FAILURES: u32 = 3;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 100;
const DEFAULT_REGISTRY_TTL_SECS: u64 = 3600;
const DEFAULT_CLOSE_FLAG_TTL_SECS: u64 = 60;

// Gateway configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    // Streaming and publish HTTP listener.
    pub bind_addr: SocketAddr,
    // Metrics and health listener.
    pub metrics_bind: SocketAddr,
    // The binary runs the in-process broker, so host and port only name the
    // broker in connect options and error messages. Distributed routing then
    // spans the tasks of this one process.
    pub broker_host: String,
    pub broker_port: u16,
    pub broker_password: Option<String>,
    // Bounded wait of the blocking subscribe in dedicated connections.
    pub broker_read_timeout_secs: u64,
    pub tick_interval_ms: u64,
    pub max_reconnect_failures: u32,
    pub reconnect_delay_ms: u64,
    pub registry_ttl_secs: u64,
    pub close_flag_ttl_secs: u64,
    pub channel_prefix: String,
    pub store_driver: StoreDriver,
    // Channels the debug audit subscriber is installed on.
    pub audit_channels: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GatewayConfigOverride {
    bind_addr: Option<String>,
    metrics_bind: Option<String>,
    broker_host: Option<String>,
    broker_port: Option<u16>,
    broker_password: Option<String>,
    broker_read_timeout_secs: Option<u64>,
    tick_interval_ms: Option<u64>,
    max_reconnect_failures: Option<u32>,
    reconnect_delay_ms: Option<u64>,
    registry_ttl_secs: Option<u64>,
    close_flag_ttl_secs: Option<u64>,
    channel_prefix: Option<String>,
    store_driver: Option<String>,
    audit_channels: Option<Vec<String>>,
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

/// Split a comma-separated channel list, dropping blanks.
pub fn parse_channel_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|channel| !channel.is_empty())
        .map(str::to_string)
        .collect()
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = std::env::var("COURIER_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8088".to_string())
            .parse()
            .with_context(|| "parse COURIER_BIND")?;
        let metrics_bind = std::env::var("COURIER_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:9090".to_string())
            .parse()
            .with_context(|| "parse COURIER_METRICS_BIND")?;
        let broker_host =
            std::env::var("COURIER_BROKER_HOST").unwrap_or_else(|_| DEFAULT_BROKER_HOST.to_string());
        let broker_port = std::env::var("COURIER_BROKER_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_BROKER_PORT);
        let broker_password = std::env::var("COURIER_BROKER_PASSWORD")
            .ok()
            .filter(|value| !value.is_empty());
        let broker_read_timeout_secs =
            env_u64("COURIER_BROKER_READ_TIMEOUT_SECS", DEFAULT_READ_TIMEOUT_SECS);
        let tick_interval_ms = env_u64("COURIER_TICK_INTERVAL_MS", DEFAULT_TICK_INTERVAL_MS);
        let max_reconnect_failures = std::env::var("COURIER_MAX_RECONNECT_FAILURES")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_RECONNECT_FAILURES);
        let reconnect_delay_ms = env_u64("COURIER_RECONNECT_DELAY_MS", DEFAULT_RECONNECT_DELAY_MS);
        let registry_ttl_secs = env_u64("COURIER_REGISTRY_TTL_SECS", DEFAULT_REGISTRY_TTL_SECS);
        let close_flag_ttl_secs = env_u64("COURIER_CLOSE_FLAG_TTL_SECS", DEFAULT_CLOSE_FLAG_TTL_SECS);
        // An empty prefix is allowed and routes everything locally.
        let channel_prefix = std::env::var("COURIER_CHANNEL_PREFIX")
            .unwrap_or_else(|_| DEFAULT_CHANNEL_PREFIX.to_string());
        let store_driver = match std::env::var("COURIER_STORE_DRIVER") {
            Ok(value) => StoreDriver::parse(&value)
                .with_context(|| format!("parse COURIER_STORE_DRIVER: {value}"))?,
            Err(_) => StoreDriver::Distributed,
        };
        let audit_channels = std::env::var("COURIER_AUDIT_CHANNELS")
            .map(|value| parse_channel_list(&value))
            .unwrap_or_default();
        Ok(Self {
            bind_addr,
            metrics_bind,
            broker_host,
            broker_port,
            broker_password,
            broker_read_timeout_secs,
            tick_interval_ms,
            max_reconnect_failures,
            reconnect_delay_ms,
            registry_ttl_secs,
            close_flag_ttl_secs,
            channel_prefix,
            store_driver,
            audit_channels,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("COURIER_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read COURIER_CONFIG: {path}"))?;
            let override_cfg: GatewayConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse gateway config yaml")?;
            config.apply(override_cfg)?;
        }
        Ok(config)
    }

    fn apply(&mut self, override_cfg: GatewayConfigOverride) -> Result<()> {
        if let Some(value) = override_cfg.bind_addr {
            self.bind_addr = value.parse().with_context(|| "parse bind_addr")?;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.broker_host {
            self.broker_host = value;
        }
        if let Some(value) = override_cfg.broker_port
            && value > 0
        {
            self.broker_port = value;
        }
        if let Some(value) = override_cfg.broker_password {
            self.broker_password = Some(value);
        }
        if let Some(value) = override_cfg.broker_read_timeout_secs
            && value > 0
        {
            self.broker_read_timeout_secs = value;
        }
        if let Some(value) = override_cfg.tick_interval_ms
            && value > 0
        {
            self.tick_interval_ms = value;
        }
        if let Some(value) = override_cfg.max_reconnect_failures
            && value > 0
        {
            self.max_reconnect_failures = value;
        }
        if let Some(value) = override_cfg.reconnect_delay_ms {
            self.reconnect_delay_ms = value;
        }
        if let Some(value) = override_cfg.registry_ttl_secs
            && value > 0
        {
            self.registry_ttl_secs = value;
        }
        if let Some(value) = override_cfg.close_flag_ttl_secs
            && value > 0
        {
            self.close_flag_ttl_secs = value;
        }
        if let Some(value) = override_cfg.channel_prefix {
            self.channel_prefix = value;
        }
        if let Some(value) = override_cfg.store_driver {
            self.store_driver = StoreDriver::parse(&value)
                .with_context(|| format!("parse store_driver: {value}"))?;
        }
        if let Some(value) = override_cfg.audit_channels {
            self.audit_channels = value;
        }
        Ok(())
    }

    /// Options for dedicated connections; the adapter drops the read timeout.
    pub fn connect_options(&self) -> ConnectOptions {
        let options = ConnectOptions::new(self.broker_host.clone(), self.broker_port)
            .with_read_timeout(Duration::from_secs(self.broker_read_timeout_secs));
        match &self.broker_password {
            Some(password) => options.with_password(password.clone()),
            None => options,
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            read_timeout: Duration::from_secs(self.broker_read_timeout_secs),
            max_reconnect_failures: self.max_reconnect_failures,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            registry_ttl: Duration::from_secs(self.registry_ttl_secs),
            close_flag_ttl: Duration::from_secs(self.close_flag_ttl_secs),
            channel_prefix: self.channel_prefix.clone(),
            ..StreamConfig::default()
        }
    }
}
