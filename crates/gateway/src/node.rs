//! Service nodes.
//!
//! A [`ServiceNode`] is one backend process: a stable identity, an address,
//! a private connection pool and a health flag flipped by its keepalive
//! task. Its ring hash is computed once from the identity, so placement
//! never depends on connection churn.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use corelib::{Bucket, NodeId};
use pool::{DripFactory, Lease, Pool, PoolEvent, PoolEventKind};
use tracing::{debug, info, warn};

use crate::config::{EndpointConfig, PoolConfig};
use crate::error::{GateError, Result};
use crate::message::{MessageBody, PushResult};
use crate::transport::ServiceTransport;

const PROBE_PAYLOAD: &str = "keepalive";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeState {
    Unavailable = 0,
    Available = 1,
}

impl NodeState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => NodeState::Available,
            _ => NodeState::Unavailable,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Available => "available",
            NodeState::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A health transition reported by a keepalive task.
pub struct NodeEvent<T: ServiceTransport> {
    pub node: Arc<ServiceNode<T>>,
    pub from: NodeState,
    pub to: NodeState,
}

impl<T: ServiceTransport> fmt::Debug for NodeEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeEvent")
            .field("node", &self.node.name())
            .field("from", &self.from)
            .field("to", &self.to)
            .finish()
    }
}

/// Dials pooled clients for one node.
pub struct NodeConnector<T: ServiceTransport> {
    transport: Arc<T>,
    node: String,
    address: String,
}

impl<T: ServiceTransport> NodeConnector<T> {
    pub fn transport(&self) -> &T {
        &self.transport
    }
}

#[async_trait]
impl<T: ServiceTransport> DripFactory for NodeConnector<T> {
    type Conn = T::Client;
    type Error = GateError;

    async fn create(&self) -> Result<T::Client> {
        self.transport.dial(&self.address).await
    }

    fn healthy(&self, conn: &T::Client, err: Option<&GateError>) -> bool {
        self.transport.healthy(conn, err)
    }

    fn destroy(&self, conn: &T::Client) {
        self.transport.close(conn);
    }

    fn notify(&self, event: &PoolEvent) {
        match event.kind {
            PoolEventKind::NewDripFailure => {
                warn!(node = %self.node, address = %self.address, "failed to dial service node")
            }
            PoolEventKind::RemoveDrip => {
                info!(node = %self.node, drip_count = event.drip_count, "evicted unhealthy client")
            }
            _ => debug!(node = %self.node, %event, "pool event"),
        }
    }
}

pub struct ServiceNode<T: ServiceTransport> {
    id: NodeId,
    name: String,
    address: String,
    hash: u32,
    state: AtomicU8,
    failures: AtomicU32,
    pool: Pool<NodeConnector<T>>,
    checkout_timeout: Option<Duration>,
}

impl<T: ServiceTransport> ServiceNode<T> {
    /// Builds a node in the `Unavailable` state; its first successful probe
    /// brings it onto the ring.
    pub fn new(endpoint: &EndpointConfig, transport: Arc<T>, pool: &PoolConfig) -> Self {
        let id = endpoint.node_id();
        let connector = NodeConnector {
            transport,
            node: endpoint.name.clone(),
            address: endpoint.address.clone(),
        };
        Self {
            id,
            name: endpoint.name.clone(),
            address: endpoint.address.clone(),
            hash: id.ring_hash(),
            state: AtomicU8::new(NodeState::Unavailable as u8),
            failures: AtomicU32::new(0),
            pool: Pool::new(connector, pool.options()),
            checkout_timeout: pool.checkout_timeout(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_available(&self) -> bool {
        self.state() == NodeState::Available
    }

    /// Consecutive failed probes.
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn pool(&self) -> &Pool<NodeConnector<T>> {
        &self.pool
    }

    fn transport(&self) -> &T {
        self.pool.factory().transport()
    }

    /// Checks out a pooled client, waiting up to the configured checkout
    /// timeout.
    pub async fn client(&self) -> Result<Lease<NodeConnector<T>>> {
        Ok(self.pool.get(true, self.checkout_timeout).await?)
    }

    /// Checks out a pooled client without waiting.
    pub async fn try_client(&self) -> Result<Lease<NodeConnector<T>>> {
        Ok(self.pool.try_get().await?)
    }

    pub async fn push(&self, session: &str, msgs: &[MessageBody]) -> Result<Vec<PushResult>> {
        let client = self.client().await?;
        let result = self.transport().push(&client, session, msgs).await;
        client.release(result.as_ref().err());
        result
    }

    pub async fn echo(&self, payload: &str) -> Result<String> {
        let client = self.client().await?;
        let result = self.transport().echo(&client, payload).await;
        client.release(result.as_ref().err());
        result
    }

    /// One keepalive round-trip: check out a client, echo, give it back.
    pub async fn probe(&self, timeout: Duration) -> Result<()> {
        let client = self.pool.get(true, Some(timeout)).await?;
        let result = match tokio::time::timeout(timeout, self.transport().echo(&client, PROBE_PAYLOAD)).await {
            Ok(Ok(reply)) if reply == PROBE_PAYLOAD => Ok(()),
            Ok(Ok(reply)) => Err(GateError::Transport(format!("probe echoed {reply:?}"))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(GateError::Timeout(timeout)),
        };
        client.release(result.as_ref().err());
        result
    }

    /// Folds a probe outcome into the health state. Returns the transition,
    /// if this probe caused one.
    pub(crate) fn record_probe(&self, ok: bool, threshold: u32) -> Option<(NodeState, NodeState)> {
        let target = if ok {
            self.failures.store(0, Ordering::Relaxed);
            NodeState::Available
        } else {
            let failures = self.failures.fetch_add(1, Ordering::Relaxed).saturating_add(1);
            if failures < threshold {
                return None;
            }
            NodeState::Unavailable
        };
        let previous = NodeState::from_u8(self.state.swap(target as u8, Ordering::AcqRel));
        (previous != target).then_some((previous, target))
    }

    pub fn close(&self) {
        self.pool.close();
    }
}

impl<T: ServiceTransport> Bucket for ServiceNode<T> {
    fn hash(&self) -> u32 {
        self.hash
    }
}

impl<T: ServiceTransport> fmt::Debug for ServiceNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("address", &self.address)
            .field("hash", &format_args!("{:#010x}", self.hash))
            .field("state", &self.state())
            .finish()
    }
}
