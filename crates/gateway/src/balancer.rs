//! Load balancer over the node ring.
//!
//! Keepalive tasks report health transitions on a bounded channel. One
//! consumer task drains it and applies every ring mutation, so the ring
//! only ever has one writer. Selection takes the ring's read lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use corelib::{hash_key, Bucket, HashRing};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::KeepaliveConfig;
use crate::error::{GateError, Result};
use crate::keepalive::KeepaliveHandle;
use crate::node::{NodeEvent, NodeState, ServiceNode};
use crate::transport::ServiceTransport;

type NodeRing<T> = HashRing<Arc<ServiceNode<T>>>;

/// Work for the ring consumer.
pub(crate) enum RingCommand<T: ServiceTransport> {
    Transition(NodeEvent<T>),
    /// Take a deregistered node off the ring, then acknowledge.
    Evict(Arc<ServiceNode<T>>, oneshot::Sender<()>),
    Shutdown,
}

pub struct LoadBalancer<T: ServiceTransport> {
    ring: Arc<NodeRing<T>>,
    nodes: DashMap<String, Arc<ServiceNode<T>>>,
    cursor: AtomicUsize,
    keepalive: KeepaliveConfig,
    commands: mpsc::Sender<RingCommand<T>>,
    keepalives: Mutex<HashMap<String, KeepaliveHandle>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl<T: ServiceTransport> LoadBalancer<T> {
    /// Starts the ring consumer. Must be called inside a tokio runtime.
    pub fn new(keepalive: KeepaliveConfig, channel_capacity: usize) -> Self {
        let ring = Arc::new(HashRing::new());
        let (commands, rx) = mpsc::channel(channel_capacity.max(1));
        let consumer = tokio::spawn(apply_commands(Arc::clone(&ring), rx));
        Self {
            ring,
            nodes: DashMap::new(),
            cursor: AtomicUsize::new(0),
            keepalive,
            commands,
            keepalives: Mutex::new(HashMap::new()),
            consumer: Mutex::new(Some(consumer)),
        }
    }

    /// Registers a node and starts its keepalive. The node joins the ring
    /// after its first successful probe.
    pub fn add_node(&self, node: ServiceNode<T>) -> Result<Arc<ServiceNode<T>>> {
        let node = Arc::new(node);
        match self.nodes.entry(node.name().to_string()) {
            Entry::Occupied(_) => return Err(GateError::DuplicateNode(node.name().to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&node));
            }
        }

        let handle = KeepaliveHandle::spawn(Arc::clone(&node), self.keepalive, self.commands.clone());
        self.keepalives.lock().insert(node.name().to_string(), handle);
        info!(node = %node.name(), address = %node.address(), id = %node.id(), "node registered");
        Ok(node)
    }

    /// Deregisters a node: stops its keepalive, takes it off the ring and
    /// closes its pool.
    pub async fn remove_node(&self, name: &str) -> Option<Arc<ServiceNode<T>>> {
        let (_, node) = self.nodes.remove(name)?;
        let handle = self.keepalives.lock().remove(name);
        if let Some(handle) = handle {
            handle.stop(name).await;
        }

        let (ack, acked) = oneshot::channel();
        if self.commands.send(RingCommand::Evict(Arc::clone(&node), ack)).await.is_ok() {
            let _ = acked.await;
        }
        node.close();
        info!(node = %name, "node deregistered");
        Some(node)
    }

    pub fn node(&self, name: &str) -> Option<Arc<ServiceNode<T>>> {
        self.nodes.get(name).map(|n| Arc::clone(n.value()))
    }

    /// Every registered node, available or not, sorted by name.
    pub fn nodes(&self) -> Vec<Arc<ServiceNode<T>>> {
        let mut nodes: Vec<_> = self.nodes.iter().map(|n| Arc::clone(n.value())).collect();
        nodes.sort_by(|a, b| a.name().cmp(b.name()));
        nodes
    }

    pub fn ring(&self) -> &HashRing<Arc<ServiceNode<T>>> {
        &self.ring
    }

    /// Number of nodes currently on the ring.
    pub fn available(&self) -> usize {
        self.ring.len()
    }

    /// The node owning `key` (or the first one after it on the ring).
    pub fn hash_select(&self, key: &str) -> Result<Arc<ServiceNode<T>>> {
        self.hash_value_select(hash_key(key))
    }

    pub fn hash_value_select(&self, hash: u32) -> Result<Arc<ServiceNode<T>>> {
        self.ring.hit(hash).map(|(_, node)| node).ok_or(GateError::NoAvailableNode)
    }

    pub fn round_robin_select(&self) -> Result<Arc<ServiceNode<T>>> {
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.ring.at_wrapping(n).ok_or(GateError::NoAvailableNode)
    }

    /// Stops every keepalive, waits for all of them to exit, then empties
    /// the ring, stops its consumer and closes every node's pool.
    pub async fn close(&self) {
        let handles: Vec<(String, KeepaliveHandle)> = self.keepalives.lock().drain().collect();
        for (_, handle) in &handles {
            handle.signal();
        }
        for (name, handle) in handles {
            handle.stop(&name).await;
        }

        let _ = self.commands.send(RingCommand::Shutdown).await;
        let consumer = self.consumer.lock().take();
        if let Some(consumer) = consumer {
            if let Err(e) = consumer.await {
                error!(error = %e, "ring consumer failed");
            }
        }

        for node in self.nodes.iter() {
            node.close();
        }
        debug!("load balancer closed");
    }
}

impl<T: ServiceTransport> Drop for LoadBalancer<T> {
    fn drop(&mut self) {
        // Keepalives hold command senders; once they exit the consumer ends too.
        for handle in self.keepalives.get_mut().values() {
            handle.signal();
        }
    }
}

impl<T: ServiceTransport> fmt::Debug for LoadBalancer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("nodes", &self.nodes.len())
            .field("ring", &self.ring.hashes())
            .finish()
    }
}

async fn apply_commands<T: ServiceTransport>(ring: Arc<NodeRing<T>>, mut rx: mpsc::Receiver<RingCommand<T>>) {
    while let Some(command) = rx.recv().await {
        match command {
            RingCommand::Transition(event) => match event.to {
                NodeState::Available => place(&ring, event.node),
                NodeState::Unavailable => evict(&ring, &event.node),
            },
            RingCommand::Evict(node, ack) => {
                evict(&ring, &node);
                let _ = ack.send(());
            }
            RingCommand::Shutdown => {
                let left = ring.clear();
                debug!(nodes = left.len(), "ring cleared");
                break;
            }
        }
    }
    debug!("ring consumer stopped");
}

fn place<T: ServiceTransport>(ring: &NodeRing<T>, node: Arc<ServiceNode<T>>) {
    let name = node.name().to_string();
    match ring.append(node) {
        Ok(successor) => info!(node = %name, successor = %successor.name(), ring = %ring, "node joined ring"),
        Err(collision) if Arc::ptr_eq(&collision.existing, &collision.rejected) => {}
        Err(collision) => error!(
            node = %name,
            existing = %collision.existing.name(),
            hash = collision.hash,
            "ring hash collision, node not placed"
        ),
    }
}

fn evict<T: ServiceTransport>(ring: &NodeRing<T>, node: &Arc<ServiceNode<T>>) {
    if let Some((_, successor)) = ring.remove_hash_if(node.hash(), |b| Arc::ptr_eq(b, node)) {
        let successor = successor.map(|s| s.name().to_string()).unwrap_or_default();
        info!(node = %node.name(), %successor, ring = %ring, "node left ring");
    }
}
