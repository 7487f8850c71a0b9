//! Node transports.
//!
//! A [`ServiceTransport`] knows how to dial a service node and issue the two
//! calls the gateway needs: a cheap `echo` round-trip for keepalive probes and
//! `push` for message submission. Each dialed client is pooled per node.

pub mod backend;
pub mod tcp;

use async_trait::async_trait;

use crate::error::{GateError, Result};
use crate::message::{MessageBody, PushResult};

pub use tcp::TcpTransport;

#[async_trait]
pub trait ServiceTransport: Send + Sync + 'static {
    /// One pooled client to a node.
    type Client: Send + Sync + 'static;

    async fn dial(&self, address: &str) -> Result<Self::Client>;

    /// Lightweight round-trip; answers with `payload`.
    async fn echo(&self, client: &Self::Client, payload: &str) -> Result<String>;

    /// Submits `msgs` for `session`, answering one result per message in order.
    async fn push(&self, client: &Self::Client, session: &str, msgs: &[MessageBody]) -> Result<Vec<PushResult>>;

    /// Whether `client` may be reused after a call that ended with `err`.
    fn healthy(&self, _client: &Self::Client, err: Option<&GateError>) -> bool {
        !err.is_some_and(GateError::is_connection_fault)
    }

    /// Tears a client down when its pool evicts it.
    fn close(&self, _client: &Self::Client) {}
}
