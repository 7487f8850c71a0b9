//! Health-aware connection pooling.
//!
//! A `Pool` bounds the number of connections ("drips") to one remote
//! endpoint, spreads checkouts over the least-used drip, queues callers
//! FIFO when every drip is saturated, and evicts drips the factory reports
//! as unhealthy.

pub mod error;
pub mod event;
pub mod factory;
pub mod pool;

pub use error::PoolError;
pub use event::{PoolEvent, PoolEventKind};
pub use factory::DripFactory;
pub use pool::{Lease, Pool, PoolOptions};
