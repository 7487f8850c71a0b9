//! Command-line flags and configuration loading.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use gateway::config::EndpointConfig;
use gateway::GatewayConfig;
use tracing_subscriber::EnvFilter;

use crate::commands::{self, Command};

#[derive(Debug, Parser)]
#[command(name = "linker-gate", version, about = "IM gateway routing and delivery tools")]
pub struct CliConfig {
    /// JSON configuration file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Extra service node, as NAME=ADDRESS. Repeatable.
    #[arg(short, long = "endpoint", value_name = "NAME=ADDRESS", global = true)]
    pub endpoints: Vec<EndpointConfig>,

    /// Log filter, e.g. `debug` or `gateway=trace`. Overrides RUST_LOG.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

impl CliConfig {
    /// The file configuration (or defaults) plus command-line endpoints.
    pub fn gateway_config(&self) -> anyhow::Result<GatewayConfig> {
        let mut config = match &self.config {
            Some(path) => GatewayConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
            None => GatewayConfig::default(),
        };
        config.endpoints.extend(self.endpoints.iter().cloned());
        config.validate()?;
        Ok(config)
    }

    pub fn run(self) -> anyhow::Result<()> {
        init_tracing(self.log_level.as_deref());
        let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
        runtime.block_on(commands::execute(&self))
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}
