use anyhow::{Context, Result};
use std::str::FromStr;
use std::time::Duration;

use crate::events::{DEFAULT_SINK_BUFFER, DEFAULT_SUBSCRIBER_BUFFER};

// ============================================================================
// Configuration
// ============================================================================
//
// Defaults suit a single local node; every field can be overridden from the
// environment (see `from_env`).
//
// ============================================================================

/// Default time an order may sit in `ready` before the system completes it
pub const DEFAULT_READY_GRACE_PERIOD: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Scylla,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "scylla" => Ok(StoreBackend::Scylla),
            other => anyhow::bail!("unknown store backend '{}' (expected memory or scylla)", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FulfillmentConfig {
    pub ready_grace_period: Duration,
    /// Whether a paid order may still be cancelled while pending
    pub allow_cancel_after_payment: bool,
    pub subscriber_buffer: usize,

    pub store: StoreBackend,
    pub scylla_node: String,
    pub scylla_keyspace: String,

    /// No external event sink when unset
    pub redpanda_brokers: Option<String>,
    pub events_topic: String,
    /// Events queued for the sink before new ones are dropped
    pub sink_buffer: usize,

    /// 0 disables the metrics server
    pub metrics_port: u16,
}

impl Default for FulfillmentConfig {
    fn default() -> Self {
        Self {
            ready_grace_period: DEFAULT_READY_GRACE_PERIOD,
            allow_cancel_after_payment: true,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            store: StoreBackend::Memory,
            scylla_node: "127.0.0.1:9042".to_string(),
            scylla_keyspace: "kitchen_ks".to_string(),
            redpanda_brokers: None,
            events_topic: "kitchen-order-events".to_string(),
            sink_buffer: DEFAULT_SINK_BUFFER,
            metrics_port: 9090,
        }
    }
}

impl FulfillmentConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(secs) = parse::<u64>(&lookup, "KITCHEN_READY_GRACE_SECS")? {
            config.ready_grace_period = Duration::from_secs(secs);
        }
        if let Some(allow) = parse::<bool>(&lookup, "KITCHEN_ALLOW_CANCEL_AFTER_PAYMENT")? {
            config.allow_cancel_after_payment = allow;
        }
        if let Some(buffer) = parse::<usize>(&lookup, "KITCHEN_SUBSCRIBER_BUFFER")? {
            anyhow::ensure!(buffer > 0, "KITCHEN_SUBSCRIBER_BUFFER must be positive");
            config.subscriber_buffer = buffer;
        }
        if let Some(store) = parse::<StoreBackend>(&lookup, "KITCHEN_STORE")? {
            config.store = store;
        }
        if let Some(node) = lookup("SCYLLA_NODE") {
            config.scylla_node = node;
        }
        if let Some(keyspace) = lookup("SCYLLA_KEYSPACE") {
            config.scylla_keyspace = keyspace;
        }
        config.redpanda_brokers = lookup("REDPANDA_BROKERS").filter(|brokers| !brokers.trim().is_empty());
        if let Some(topic) = lookup("KITCHEN_EVENTS_TOPIC") {
            config.events_topic = topic;
        }
        if let Some(buffer) = parse::<usize>(&lookup, "KITCHEN_SINK_BUFFER")? {
            anyhow::ensure!(buffer > 0, "KITCHEN_SINK_BUFFER must be positive");
            config.sink_buffer = buffer;
        }
        if let Some(port) = parse::<u16>(&lookup, "METRICS_PORT")? {
            config.metrics_port = port;
        }

        Ok(config)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("invalid value '{}' for {}", raw, key)),
        None => Ok(None),
    }
}
