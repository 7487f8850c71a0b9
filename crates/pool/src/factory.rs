//! The pluggable connection factory.

use async_trait::async_trait;

use crate::event::PoolEvent;

/// Creates, checks and tears down the connections held by a `Pool`.
///
/// # Thread Safety
///
/// One factory is shared by every caller of its pool, so implementations
/// must be `Send + Sync`.
#[async_trait]
pub trait DripFactory: Send + Sync + 'static {
    /// The pooled resource.
    type Conn: Send + Sync + 'static;
    /// Error produced while creating or using a connection.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Opens a new connection.
    async fn create(&self) -> Result<Self::Conn, Self::Error>;

    /// Decides whether a connection may stay in the pool after a use that
    /// ended with `err`. Unhealthy connections are evicted.
    fn healthy(&self, _conn: &Self::Conn, _err: Option<&Self::Error>) -> bool {
        true
    }

    /// Tears down a connection that left the pool. Called once per
    /// connection, after its last lease was returned.
    fn destroy(&self, _conn: &Self::Conn) {}

    fn notify(&self, _event: &PoolEvent) {}
}
