//! Command-line front end for the gateway.
//!
//! Provides commands for:
//! - Inspecting endpoint placement on the ring
//! - Resolving which endpoint owns a group
//! - Probing endpoint health
//! - Pushing messages through the gateway
//! - Running a toy backend node

pub mod commands;
pub mod config;

pub use commands::{Command, CommandResult};
pub use config::CliConfig;
