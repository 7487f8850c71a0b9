#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use gateway::config::{EndpointConfig, KeepaliveConfig};
use gateway::{GateError, GatewayConfig, MessageBody, PushResult, Result, ServiceTransport};
use parking_lot::Mutex;

/// In-process stand-in for one service node.
#[derive(Default)]
pub struct MockNode {
    down: AtomicBool,
    delay_ms: AtomicU64,
    echo_delay_ms: AtomicU64,
    sequence: AtomicU32,
    pushed: Mutex<Vec<MessageBody>>,
}

pub struct MockClient {
    node: Arc<MockNode>,
}

/// Transport whose nodes are addressed by name and can be taken down.
#[derive(Default)]
pub struct MockTransport {
    nodes: DashMap<String, Arc<MockNode>>,
    echoes_started: AtomicUsize,
    echoes_finished: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn node(&self, address: &str) -> Arc<MockNode> {
        Arc::clone(self.nodes.entry(address.to_string()).or_default().value())
    }

    pub fn set_down(&self, address: &str, down: bool) {
        self.node(address).down.store(down, Ordering::SeqCst);
    }

    pub fn set_delay(&self, address: &str, delay: Duration) {
        self.node(address).delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_echo_delay(&self, address: &str, delay: Duration) {
        self.node(address).echo_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn echoes_started(&self) -> usize {
        self.echoes_started.load(Ordering::SeqCst)
    }

    pub fn echoes_finished(&self) -> usize {
        self.echoes_finished.load(Ordering::SeqCst)
    }

    /// Everything `address` accepted, in arrival order.
    pub fn pushed(&self, address: &str) -> Vec<MessageBody> {
        self.node(address).pushed.lock().clone()
    }
}

#[async_trait]
impl ServiceTransport for MockTransport {
    type Client = MockClient;

    async fn dial(&self, address: &str) -> Result<MockClient> {
        let node = self.node(address);
        if node.down.load(Ordering::SeqCst) {
            return Err(GateError::Transport("connection refused".into()));
        }
        Ok(MockClient { node })
    }

    async fn echo(&self, client: &MockClient, payload: &str) -> Result<String> {
        self.echoes_started.fetch_add(1, Ordering::SeqCst);
        let delay = client.node.echo_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let result = if client.node.down.load(Ordering::SeqCst) {
            Err(GateError::Transport("connection reset".into()))
        } else {
            Ok(payload.to_string())
        };
        self.echoes_finished.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn push(&self, client: &MockClient, _session: &str, msgs: &[MessageBody]) -> Result<Vec<PushResult>> {
        let node = &client.node;
        if node.down.load(Ordering::SeqCst) {
            return Err(GateError::Transport("connection reset".into()));
        }
        let delay = node.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        node.pushed.lock().extend_from_slice(msgs);
        // The timestamp echoes the numeric suffix of the content so tests can
        // match results to inputs.
        Ok(msgs
            .iter()
            .map(|m| {
                let tag = m.content.trim_start_matches(|c: char| !c.is_ascii_digit());
                PushResult::accepted(tag.parse().unwrap_or(0), node.sequence.fetch_add(1, Ordering::SeqCst) + 1)
            })
            .collect())
    }
}

/// Endpoints addressed by name, with a fast keepalive.
pub fn config(names: &[&str]) -> GatewayConfig {
    GatewayConfig {
        endpoints: names.iter().map(|n| EndpointConfig::new(*n, *n)).collect(),
        keepalive: KeepaliveConfig {
            period_ms: 20,
            failure_threshold: 2,
            probe_timeout_ms: 200,
        },
        ..Default::default()
    }
}

/// Polls `cond` until it holds or five seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    let wait = async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("condition not reached within 5s");
}
