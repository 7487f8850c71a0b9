//! Routing, pooling and delivery for the IM gateway.
//!
//! Push path: messages are hashed by group onto the [`LoadBalancer`]'s ring,
//! sent over the owning [`ServiceNode`]'s connection pool, and answered with
//! per-message [`PushResult`]s.
//!
//! Pull path: a client attaches to the [`Hub`] under its session key and
//! long-polls its [`Connection`], whose [`RingBuffer`] the delivery side
//! writes into.

pub mod balancer;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod keepalive;
pub mod message;
pub mod node;
pub mod transport;

pub use balancer::LoadBalancer;
pub use buffer::RingBuffer;
pub use config::GatewayConfig;
pub use connection::{ConnState, ConnectMetadata, Connection, Delivery, OverflowPolicy, Protocol};
pub use error::{GateError, Result};
pub use gateway::Gateway;
pub use hub::Hub;
pub use message::{Message, MessageBody, MessageGroup, PushResult};
pub use node::{NodeEvent, NodeState, ServiceNode};
pub use transport::ServiceTransport;
