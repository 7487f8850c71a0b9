//! Gateway error taxonomy.

use std::time::Duration;

use pool::PoolError;
use thiserror::Error;

/// Result type alias for the gateway.
pub type Result<T> = std::result::Result<T, GateError>;

/// Errors surfaced by routing, pooling and delivery.
///
/// The gateway performs no hidden retries: callers map
/// [`is_unavailable`](Self::is_unavailable) to "no available backend" and
/// [`is_retryable`](Self::is_retryable) to "try again later".
#[derive(Debug, Error)]
pub enum GateError {
    /// The ring is empty, so no node can serve the request.
    #[error("no available node")]
    NoAvailableNode,

    /// A node with this name is already registered.
    #[error("node already registered: {0}")]
    DuplicateNode(String),

    /// Non-blocking checkout found every pooled client saturated.
    #[error("connection pool is full")]
    PoolFull,

    /// Blocking checkout exceeded its deadline.
    #[error("timed out waiting for a pooled connection")]
    WaitTimeout,

    #[error("connection pool is closed")]
    PoolClosed,

    /// A connection's buffer is full and its overflow policy rejects writes.
    #[error("ring buffer is full")]
    RingFull,

    /// No attached connection for this session key.
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// A connection already has a long-poll receiver attached.
    #[error("connection already has an active receiver")]
    ConcurrentReceive,

    /// The transport to a node is broken.
    #[error("transport error: {0}")]
    Transport(String),

    /// A request to a node got no answer in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The node answered with an error.
    #[error("remote error: {0}")]
    Remote(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A dispatch task panicked or was cancelled.
    #[error("dispatch task failed: {0}")]
    TaskFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GateError {
    /// Errors that mean no backend can take the request right now.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            GateError::NoAvailableNode | GateError::PoolClosed | GateError::Transport(_) | GateError::Io(_)
        )
    }

    /// Errors that mean the gateway is saturated and a later retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GateError::PoolFull | GateError::WaitTimeout | GateError::RingFull | GateError::Timeout(_)
        )
    }

    /// Errors after which a pooled client can no longer be trusted.
    ///
    /// A timed-out request may leave a late reply on the stream, so timeouts
    /// count as faults too. Remote error replies do not.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            GateError::Transport(_) | GateError::Timeout(_) | GateError::Io(_) | GateError::Json(_)
        )
    }
}

impl From<PoolError<GateError>> for GateError {
    fn from(err: PoolError<GateError>) -> Self {
        match err {
            PoolError::Full => GateError::PoolFull,
            PoolError::WaitTimeout => GateError::WaitTimeout,
            PoolError::Closed => GateError::PoolClosed,
            PoolError::Create(err) => err,
        }
    }
}
