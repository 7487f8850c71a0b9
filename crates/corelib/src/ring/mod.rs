//! Consistent hash ring implementation.
//!
//! The ring keeps buckets sorted by their 32-bit hash and provides circular
//! nearest-successor lookup for finding the bucket responsible for a key.

pub mod bucket;
pub mod ring;

pub use bucket::Bucket;
pub use ring::{Collision, HashRing};
