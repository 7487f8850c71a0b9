//! Session registry.
//!
//! Maps client session keys to their [`Connection`]. Connections are created
//! on first connect and live until evicted.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::HubConfig;
use crate::connection::{ConnState, ConnectMetadata, Connection, Delivery, Protocol};
use crate::error::{GateError, Result};
use crate::message::{Message, MessageGroup};

/// Point-in-time view of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub key: String,
    pub protocol: Protocol,
    pub remote: String,
    pub state: ConnState,
    pub buffered: usize,
}

#[derive(Debug)]
pub struct Hub {
    conns: DashMap<String, Arc<Connection>>,
    config: HubConfig,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            conns: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Returns the session's connection, creating it on first connect.
    ///
    /// Concurrent first connects for one key all get the same connection.
    /// A negative timeout in `meta` inherits the hub default.
    pub fn connect(&self, key: &str, mut meta: ConnectMetadata) -> Arc<Connection> {
        if meta.timeout_ms < 0 {
            meta.timeout_ms = self.config.receive_timeout_ms;
        }
        let entry = self.conns.entry(key.to_string()).or_insert_with(|| {
            debug!(session = key, remote = %meta.remote, "new connection");
            Arc::new(Connection::new(key, meta.clone(), self.config.ring_capacity, self.config.overflow))
        });
        // Attached under the entry lock so eviction cannot remove it in between.
        entry.attach(meta);
        Arc::clone(entry.value())
    }

    /// The session's connection, if it is attached.
    pub fn route(&self, key: &str) -> Option<Arc<Connection>> {
        self.conns
            .get(key)
            .filter(|c| c.state() == ConnState::Connected)
            .map(|c| Arc::clone(c.value()))
    }

    /// Writes `msgs` into one session's buffer.
    pub fn key_push(&self, key: &str, msgs: &[Message]) -> Result<Delivery> {
        let conn = self.route(key).ok_or_else(|| GateError::UnknownSession(key.to_string()))?;
        conn.push(msgs)
    }

    /// Fans each group's messages out to every session it names. Missing
    /// sessions and full buffers are counted, not fatal.
    pub fn push(&self, groups: &[MessageGroup]) -> Delivery {
        let mut total = Delivery::default();
        for group in groups {
            for key in &group.sessions {
                match self.route(key) {
                    Some(conn) => match conn.push(&group.msgs) {
                        Ok(delivery) => total += delivery,
                        Err(_) => total.rejected += group.msgs.len(),
                    },
                    None => total.unrouted += 1,
                }
            }
        }
        total
    }

    /// Number of known sessions, attached or not.
    pub fn count(&self) -> usize {
        self.conns.len()
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .conns
            .iter()
            .map(|entry| {
                let conn = entry.value();
                let meta = conn.metadata();
                SessionInfo {
                    key: conn.key().to_string(),
                    protocol: meta.protocol,
                    remote: meta.remote,
                    state: conn.state(),
                    buffered: conn.buffered(),
                }
            })
            .collect();
        sessions.sort_by(|a, b| a.key.cmp(&b.key));
        sessions
    }

    /// Detaches a session; it stops receiving routed messages and its
    /// waiting receiver returns. Returns false for unknown keys.
    pub fn disconnect(&self, key: &str) -> bool {
        match self.conns.get(key) {
            Some(conn) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    /// Drops closed sessions and sessions idle longer than `max_idle`.
    /// Sessions with a receiver currently waiting are kept.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.conns.len();
        self.conns.retain(|_, conn| {
            if conn.is_receiving() {
                return true;
            }
            let keep = conn.state() != ConnState::Closed && now.duration_since(conn.last_active()) <= max_idle;
            if !keep {
                conn.close();
            }
            keep
        });
        let evicted = before.saturating_sub(self.conns.len());
        if evicted > 0 {
            info!(evicted, remaining = self.conns.len(), "evicted idle sessions");
        }
        evicted
    }
}
