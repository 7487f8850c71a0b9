//! Subcommands.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Subcommand;
use corelib::{hash_key, HashRing, Hashed};
use gateway::transport::backend::Backend;
use gateway::transport::TcpTransport;
use gateway::{Gateway, GatewayConfig, MessageBody, ServiceNode};
use tokio::net::TcpListener;
use tracing::info;

use crate::config::CliConfig;

pub type CommandResult = anyhow::Result<()>;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print every endpoint with its identity and ring position.
    Inspect,

    /// Show which endpoint owns each group, assuming every endpoint is up.
    Route {
        #[arg(required = true)]
        groups: Vec<String>,
    },

    /// Probe every endpoint once and report its health.
    Probe,

    /// Push messages to a group through the gateway.
    Push {
        #[arg(long)]
        session: String,
        #[arg(long)]
        group: String,
        /// Message contents, one message each.
        #[arg(required = true)]
        messages: Vec<String>,
        /// How long to wait for endpoints to come up.
        #[arg(long, default_value_t = 5000)]
        wait_ms: u64,
    },

    /// Run a toy backend node.
    Backend {
        #[arg(long, default_value = "127.0.0.1:7000")]
        bind: String,
        #[arg(long, default_value = "backend")]
        name: String,
    },
}

pub async fn execute(cli: &CliConfig) -> CommandResult {
    match &cli.command {
        Command::Inspect => inspect(&cli.gateway_config()?),
        Command::Route { groups } => route(&cli.gateway_config()?, groups),
        Command::Probe => probe(&cli.gateway_config()?).await,
        Command::Push {
            session,
            group,
            messages,
            wait_ms,
        } => push(cli.gateway_config()?, session, group, messages, Duration::from_millis(*wait_ms)).await,
        Command::Backend { bind, name } => backend(bind, name).await,
    }
}

/// Ring of endpoint hashes, all endpoints assumed available.
fn offline_ring(config: &GatewayConfig) -> anyhow::Result<(HashRing<Hashed>, Vec<(u32, String)>)> {
    let ring = HashRing::new();
    let mut owners = Vec::with_capacity(config.endpoints.len());
    for endpoint in &config.endpoints {
        let hash = endpoint.node_id().ring_hash();
        if let Err(collision) = ring.append(Hashed(hash)) {
            bail!("endpoint {} collides with another endpoint ({collision})", endpoint.name);
        }
        owners.push((hash, endpoint.name.clone()));
    }
    Ok((ring, owners))
}

fn inspect(config: &GatewayConfig) -> CommandResult {
    let (ring, _) = offline_ring(config)?;
    let mut endpoints: Vec<_> = config.endpoints.iter().collect();
    endpoints.sort_by_key(|e| e.node_id().ring_hash());

    println!("{} endpoints, ring {}", endpoints.len(), ring);
    for endpoint in endpoints {
        let id = endpoint.node_id();
        println!("  {:#010x}  {:<16} {:<24} {}", id.ring_hash(), endpoint.name, endpoint.address, id);
    }
    println!(
        "pool: {} connections x {} concurrent, keepalive every {}ms (threshold {})",
        config.pool.max_connections, config.pool.max_concurrent, config.keepalive.period_ms, config.keepalive.failure_threshold
    );
    Ok(())
}

fn route(config: &GatewayConfig, groups: &[String]) -> CommandResult {
    let (ring, owners) = offline_ring(config)?;
    for group in groups {
        let hash = hash_key(group);
        let owner = ring
            .hit(hash)
            .and_then(|(_, bucket)| owners.iter().find(|(h, _)| *h == bucket.0))
            .map(|(_, name)| name.as_str())
            .unwrap_or("<none>");
        println!("{group} ({hash:#010x}) -> {owner}");
    }
    Ok(())
}

async fn probe(config: &GatewayConfig) -> CommandResult {
    let transport = Arc::new(TcpTransport::default());
    let timeout = config.keepalive.probe_timeout();
    let mut failed = 0;
    for endpoint in &config.endpoints {
        let node = ServiceNode::new(endpoint, Arc::clone(&transport), &config.pool);
        match node.probe(timeout).await {
            Ok(()) => println!("{:<16} {:<24} ok", node.name(), node.address()),
            Err(e) => {
                failed += 1;
                println!("{:<16} {:<24} FAILED: {e}", node.name(), node.address());
            }
        }
        node.close();
    }
    if failed > 0 {
        bail!("{failed} of {} endpoints failed", config.endpoints.len());
    }
    Ok(())
}

async fn push(config: GatewayConfig, session: &str, group: &str, messages: &[String], wait: Duration) -> CommandResult {
    if config.endpoints.is_empty() {
        bail!("no endpoints configured");
    }
    let gate = Gateway::new(config, Arc::new(TcpTransport::default()))?;
    gate.wait_available(1, wait)
        .await
        .context("no endpoint became available")?;

    let msgs = messages.iter().map(|m| MessageBody::new(group, m.as_str())).collect();
    let result = gate.push(session, msgs).await;
    gate.close().await;

    for r in result? {
        println!("{}", serde_json::to_string(&r)?);
    }
    Ok(())
}

async fn backend(bind: &str, name: &str) -> CommandResult {
    let listener = TcpListener::bind(bind).await.with_context(|| format!("binding {bind}"))?;
    info!(backend = name, bind, "starting backend");
    Backend::new(name).serve(listener).await?;
    Ok(())
}
