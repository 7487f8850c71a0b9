//! Key hashing.
//!
//! Every path that places something on the ring (node identities, message
//! groups, routing keys) goes through the same 32-bit function so that
//! lookups and placements agree.

use crate::ring::Bucket;
use xxhash_rust::xxh32::xxh32;

const SEED: u32 = 0;

/// Hashes raw bytes onto the 32-bit ring space.
#[inline]
pub fn hash_bytes(data: &[u8]) -> u32 {
    xxh32(data, SEED)
}

/// Hashes a string key (e.g. a message group) onto the ring space.
#[inline]
pub fn hash_key(key: &str) -> u32 {
    hash_bytes(key.as_bytes())
}

/// A bare hash value usable wherever a `Bucket` is expected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Hashed(pub u32);

impl Hashed {
    pub fn of(key: &str) -> Self {
        Hashed(hash_key(key))
    }
}

impl Bucket for Hashed {
    fn hash(&self) -> u32 {
        self.0
    }
}
