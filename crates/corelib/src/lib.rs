//! Core library for the gateway's consistent hashing.
//!
//! This crate provides the fundamental abstractions for group-to-node placement:
//! - The `Bucket` capability (anything with a stable 32-bit hash)
//! - The circular, sorted `HashRing`
//! - Compact node identities
//! - Key hashing shared by every dispatch path

pub mod error;
pub mod hash;
pub mod node;
pub mod ring;

pub use error::{Error, Result};
pub use hash::{hash_bytes, hash_key, Hashed};
pub use node::NodeId;
pub use ring::{Bucket, Collision, HashRing};
