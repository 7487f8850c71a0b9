//! Per-node keepalive loop.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::balancer::RingCommand;
use crate::config::KeepaliveConfig;
use crate::error::GateError;
use crate::node::{NodeEvent, ServiceNode};
use crate::transport::ServiceTransport;

/// A running keepalive task and its stop signal.
pub(crate) struct KeepaliveHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl KeepaliveHandle {
    pub(crate) fn spawn<T: ServiceTransport>(
        node: Arc<ServiceNode<T>>,
        config: KeepaliveConfig,
        events: mpsc::Sender<RingCommand<T>>,
    ) -> Self {
        let (stop, stopped) = watch::channel(false);
        let task = tokio::spawn(run(node, config, events, stopped));
        Self { stop, task }
    }

    /// Asks the task to exit after its in-flight probe, if any.
    pub(crate) fn signal(&self) {
        let _ = self.stop.send(true);
    }

    /// Signals the task and waits for it to exit.
    pub(crate) async fn stop(self, node: &str) {
        self.signal();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!(node, "keepalive task panicked");
            }
        }
    }
}

async fn run<T: ServiceTransport>(
    node: Arc<ServiceNode<T>>,
    config: KeepaliveConfig,
    events: mpsc::Sender<RingCommand<T>>,
    mut stopped: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(node = %node.name(), period_ms = config.period_ms, "keepalive started");

    loop {
        tokio::select! {
            biased;
            _ = stopped.changed() => break,
            _ = ticker.tick() => {}
        }

        // Not raced against the stop signal: a started probe always finishes.
        let ok = match node.probe(config.probe_timeout()).await {
            Ok(()) => true,
            Err(e @ (GateError::PoolFull | GateError::WaitTimeout)) => {
                // Saturated by live traffic; says nothing about liveness.
                debug!(node = %node.name(), error = %e, "probe skipped");
                continue;
            }
            Err(e) => {
                warn!(
                    node = %node.name(),
                    failures = node.failures() + 1,
                    threshold = config.failure_threshold,
                    error = %e,
                    "keepalive probe failed"
                );
                false
            }
        };

        if let Some((from, to)) = node.record_probe(ok, config.failure_threshold) {
            info!(node = %node.name(), %from, %to, "node health changed");
            let event = NodeEvent {
                node: Arc::clone(&node),
                from,
                to,
            };
            if events.send(RingCommand::Transition(event)).await.is_err() {
                break;
            }
        }
    }

    debug!(node = %node.name(), "keepalive stopped");
}
