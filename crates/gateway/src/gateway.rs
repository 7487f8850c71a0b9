//! The gateway: balancer plus hub, with push dispatch on top.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use corelib::hash_key;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::balancer::LoadBalancer;
use crate::config::GatewayConfig;
use crate::connection::Delivery;
use crate::error::{GateError, Result};
use crate::hub::Hub;
use crate::message::{MessageBody, MessageGroup, PushResult};
use crate::node::ServiceNode;
use crate::transport::ServiceTransport;

/// Messages sharing one group hash, with their positions in the request.
struct Batch {
    hash: u32,
    positions: Vec<usize>,
    msgs: Vec<MessageBody>,
}

pub struct Gateway<T: ServiceTransport> {
    config: GatewayConfig,
    balancer: LoadBalancer<T>,
    hub: Hub,
}

impl<T: ServiceTransport> Gateway<T> {
    /// Validates `config`, registers every endpoint and starts keepalives.
    /// Must be called inside a tokio runtime.
    pub fn new(config: GatewayConfig, transport: Arc<T>) -> Result<Self> {
        config.validate()?;
        let balancer = LoadBalancer::new(config.keepalive, config.event_channel_capacity);
        for endpoint in &config.endpoints {
            balancer.add_node(ServiceNode::new(endpoint, Arc::clone(&transport), &config.pool))?;
        }
        let hub = Hub::new(config.hub);
        Ok(Self { config, balancer, hub })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn balancer(&self) -> &LoadBalancer<T> {
        &self.balancer
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Waits until at least `n` nodes are on the ring.
    pub async fn wait_available(&self, n: usize, timeout: Duration) -> Result<()> {
        let poll = async {
            while self.balancer.available() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| GateError::NoAvailableNode)
    }

    /// Submits messages on behalf of `session`.
    ///
    /// Messages are bucketed by group hash and each bucket goes to the node
    /// owning that hash, all buckets in parallel. Results come back in input
    /// order; within a group, the node sees messages in submission order.
    /// Nothing is sent unless every bucket resolves to a node.
    pub async fn push(&self, session: &str, msgs: Vec<MessageBody>) -> Result<Vec<PushResult>> {
        let total = msgs.len();
        let mut routed = Vec::new();
        for batch in bucket_by_group(msgs) {
            let node = self.balancer.hash_value_select(batch.hash)?;
            routed.push((node, batch));
        }

        if let [(node, batch)] = routed.as_slice() {
            let results = node.push(session, &batch.msgs).await?;
            check_len(node, &results, batch.msgs.len())?;
            return Ok(results);
        }

        let mut tasks = JoinSet::new();
        for (node, batch) in routed {
            let session = session.to_string();
            tasks.spawn(async move {
                let results = node.push(&session, &batch.msgs).await;
                (node, batch, results)
            });
        }

        // Every task runs to completion so no pooled client is abandoned mid-request.
        let mut slots: Vec<Option<PushResult>> = vec![None; total];
        let mut first_err = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| GateError::TaskFailed(e.to_string()))
                .and_then(|(node, batch, results)| {
                    let results = results?;
                    check_len(&node, &results, batch.msgs.len())?;
                    Ok((batch.positions, results))
                });
            match outcome {
                Ok((positions, results)) => {
                    for (pos, result) in positions.into_iter().zip(results) {
                        slots[pos] = Some(result);
                    }
                }
                Err(e) => {
                    warn!(session, error = %e, "push batch failed");
                    first_err.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_err {
            return Err(e);
        }
        debug!(session, messages = total, "pushed");
        Ok(slots.into_iter().flatten().collect())
    }

    /// Runs `op` against a round-robin-selected node, for requests with no
    /// group affinity.
    pub async fn round_robin<R, F, Fut>(&self, op: F) -> Result<R>
    where
        F: FnOnce(Arc<ServiceNode<T>>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let node = self.balancer.round_robin_select()?;
        op(node).await
    }

    pub async fn echo(&self, payload: &str) -> Result<String> {
        self.round_robin(|node| async move { node.echo(payload).await }).await
    }

    /// Hands serialized messages to the sessions waiting for them.
    pub fn deliver(&self, groups: &[MessageGroup]) -> Delivery {
        self.hub.push(groups)
    }

    /// Stops keepalives and closes every node pool.
    pub async fn close(&self) {
        self.balancer.close().await;
    }
}

fn bucket_by_group(msgs: Vec<MessageBody>) -> Vec<Batch> {
    let mut index: HashMap<u32, usize> = HashMap::new();
    let mut batches: Vec<Batch> = Vec::new();
    for (pos, msg) in msgs.into_iter().enumerate() {
        let hash = hash_key(&msg.group);
        let slot = *index.entry(hash).or_insert_with(|| {
            batches.push(Batch {
                hash,
                positions: Vec::new(),
                msgs: Vec::new(),
            });
            batches.len() - 1
        });
        batches[slot].positions.push(pos);
        batches[slot].msgs.push(msg);
    }
    batches
}

fn check_len<T: ServiceTransport>(node: &ServiceNode<T>, results: &[PushResult], expected: usize) -> Result<()> {
    if results.len() == expected {
        return Ok(());
    }
    Err(GateError::Remote(format!(
        "node {} answered {} results for {} messages",
        node.name(),
        results.len(),
        expected
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_by_group_keeps_order() {
        let batches = bucket_by_group(vec![
            MessageBody::new("g1", "a"),
            MessageBody::new("g2", "b"),
            MessageBody::new("g1", "c"),
        ]);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].hash, hash_key("g1"));
        assert_eq!(batches[0].positions, vec![0, 2]);
        let contents: Vec<&str> = batches[0].msgs.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "c"]);
        assert_eq!(batches[1].positions, vec![1]);
    }

    #[test]
    fn test_bucket_by_group_empty() {
        assert!(bucket_by_group(Vec::new()).is_empty());
    }
}
