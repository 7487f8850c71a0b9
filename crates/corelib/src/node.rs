//! Node identity.
//!
//! Backend service nodes are identified by a compact `NodeId` that is cheap to
//! compare and hash. The identity is the only input to a node's ring position.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_128;

use crate::error::Error;
use crate::hash::hash_bytes;

/// Compact identifier for a node in the cluster.
///
/// Newtype over `u128` (UUID-sized) so comparisons and hashing are very fast.
/// Rendered as 32 lowercase hex digits without dashes.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(pub u128);

impl NodeId {
    /// Derives a deterministic identity from a configured endpoint name.
    pub fn from_name(name: &str) -> Self {
        NodeId(xxh3_128(name.as_bytes()))
    }

    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    /// Ring position of this identity. Computed from the id bytes only.
    pub fn ring_hash(self) -> u32 {
        hash_bytes(&self.to_bytes())
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = Error;

    /// Accepts plain hex or dashed UUID notation.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().filter(|c| *c != '-').collect();
        if digits.is_empty() || digits.len() > 32 {
            return Err(Error::InvalidNodeId(s.to_string()));
        }
        u128::from_str_radix(&digits, 16)
            .map(NodeId)
            .map_err(|_| Error::InvalidNodeId(s.to_string()))
    }
}

impl TryFrom<String> for NodeId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.to_string()
    }
}
