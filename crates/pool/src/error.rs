//! Pool errors.

use thiserror::Error;

/// Errors returned by `Pool::get`.
///
/// `E` is the factory's own error type, surfaced when creating a new drip
/// fails.
#[derive(Debug, Error)]
pub enum PoolError<E> {
    /// Every drip is saturated and the caller asked not to wait.
    #[error("pool is full")]
    Full,

    /// The caller waited for a free drip past its deadline.
    #[error("waiting time elapsed")]
    WaitTimeout,

    #[error("pool is closed")]
    Closed,

    /// The factory failed to open a new connection.
    #[error("failed to create connection: {0}")]
    Create(#[source] E),
}

impl<E> PoolError<E> {
    /// True for errors that say "try again later" rather than "broken".
    pub fn is_exhausted(&self) -> bool {
        matches!(self, PoolError::Full | PoolError::WaitTimeout)
    }
}
