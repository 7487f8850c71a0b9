//! Gateway configuration.
//!
//! Every component takes its slice of this explicitly through its
//! constructor; nothing reads configuration from global state.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use corelib::NodeId;
use pool::PoolOptions;
use serde::{Deserialize, Serialize};

use crate::connection::OverflowPolicy;
use crate::error::{GateError, Result};

/// Top-level configuration, usually loaded from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub endpoints: Vec<EndpointConfig>,
    pub keepalive: KeepaliveConfig,
    pub pool: PoolConfig,
    pub hub: HubConfig,
    /// Capacity of the channel carrying node health transitions.
    pub event_channel_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            keepalive: KeepaliveConfig::default(),
            pool: PoolConfig::default(),
            hub: HubConfig::default(),
            event_channel_capacity: 64,
        }
    }
}

impl GatewayConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::with_capacity(self.endpoints.len());
        for endpoint in &self.endpoints {
            if endpoint.name.is_empty() {
                return Err(GateError::Config("endpoint name is empty".into()));
            }
            if endpoint.address.is_empty() {
                return Err(GateError::Config(format!("endpoint {} has no address", endpoint.name)));
            }
            if !names.insert(endpoint.name.as_str()) {
                return Err(GateError::Config(format!("duplicate endpoint {}", endpoint.name)));
            }
        }
        if self.keepalive.period_ms == 0 {
            return Err(GateError::Config("keepalive.period_ms must be positive".into()));
        }
        if self.keepalive.failure_threshold == 0 {
            return Err(GateError::Config("keepalive.failure_threshold must be positive".into()));
        }
        if self.pool.max_connections == 0 || self.pool.max_concurrent == 0 {
            return Err(GateError::Config("pool sizes must be positive".into()));
        }
        if self.hub.ring_capacity == 0 {
            return Err(GateError::Config("hub.ring_capacity must be positive".into()));
        }
        if self.event_channel_capacity == 0 {
            return Err(GateError::Config("event_channel_capacity must be positive".into()));
        }
        Ok(())
    }
}

/// One backend service node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub address: String,
    /// Explicit identity; derived from `name` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<NodeId>,
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            id: None,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.id.unwrap_or_else(|| NodeId::from_name(&self.name))
    }
}

/// Parses `name=address`.
impl FromStr for EndpointConfig {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('=') {
            Some((name, address)) if !name.is_empty() && !address.is_empty() => {
                Ok(Self::new(name.trim(), address.trim()))
            }
            _ => Err(GateError::Config(format!("expected name=address, got {s:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    pub period_ms: u64,
    /// Consecutive probe failures before a node is marked unavailable.
    pub failure_threshold: u32,
    pub probe_timeout_ms: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            period_ms: 5000,
            failure_threshold: 3,
            probe_timeout_ms: 2000,
        }
    }
}

impl KeepaliveConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pooled clients per node.
    pub max_connections: usize,
    /// Concurrent requests per pooled client.
    pub max_concurrent: usize,
    /// Checkout wait bound; `None` waits forever.
    pub checkout_timeout_ms: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_concurrent: 50,
            checkout_timeout_ms: Some(3000),
        }
    }
}

impl PoolConfig {
    pub fn options(&self) -> PoolOptions {
        PoolOptions {
            max_drip: self.max_connections,
            max_used: self.max_concurrent,
        }
    }

    pub fn checkout_timeout(&self) -> Option<Duration> {
        self.checkout_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Per-connection buffer size, rounded up to a power of two.
    pub ring_capacity: usize,
    /// Default long-poll timeout. Negative waits forever.
    pub receive_timeout_ms: i64,
    pub overflow: OverflowPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 1024,
            receive_timeout_ms: 30_000,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = GatewayConfig::from_json(r#"{"endpoints":[{"name":"a","address":"127.0.0.1:7000"}]}"#).unwrap();
        assert_eq!(config.keepalive, KeepaliveConfig::default());
        assert_eq!(config.pool.checkout_timeout(), Some(Duration::from_secs(3)));
        assert_eq!(config.hub.overflow, OverflowPolicy::DropOldest);
        assert_eq!(config.event_channel_capacity, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overflow_policy_names() {
        let config = GatewayConfig::from_json(r#"{"hub":{"overflow":"reject"}}"#).unwrap();
        assert_eq!(config.hub.overflow, OverflowPolicy::Reject);
        assert_eq!(config.hub.ring_capacity, 1024);
    }

    #[test]
    fn test_validate_rejects_duplicates_and_zero_sizes() {
        let mut config = GatewayConfig {
            endpoints: vec![EndpointConfig::new("a", "x:1"), EndpointConfig::new("a", "x:2")],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(GateError::Config(_))));

        config.endpoints.pop();
        config.pool.max_connections = 0;
        assert!(matches!(config.validate(), Err(GateError::Config(_))));

        config.pool.max_connections = 1;
        config.keepalive.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_endpoint_from_str() {
        let endpoint: EndpointConfig = "node-a=127.0.0.1:7000".parse().unwrap();
        assert_eq!(endpoint.name, "node-a");
        assert_eq!(endpoint.address, "127.0.0.1:7000");
        assert_eq!(endpoint.node_id(), NodeId::from_name("node-a"));

        assert!("node-a".parse::<EndpointConfig>().is_err());
        assert!("=addr".parse::<EndpointConfig>().is_err());
    }
}
