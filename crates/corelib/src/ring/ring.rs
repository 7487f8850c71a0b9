//! Hash ring data structure.
//!
//! Buckets live in a `Vec` kept strictly ascending by hash, so every lookup is
//! a binary search. One read-write lock guards the vector: mutations take the
//! write lock, lookups take the read lock.

use std::fmt;

use parking_lot::RwLock;

use super::bucket::Bucket;

/// A rejected insertion: the ring already holds a bucket with the same hash.
///
/// The ring is left untouched; both buckets are handed back to the caller.
pub struct Collision<B> {
    pub hash: u32,
    /// Bucket already on the ring.
    pub existing: B,
    /// Bucket the caller tried to insert.
    pub rejected: B,
}

impl<B> fmt::Debug for Collision<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collision").field("hash", &self.hash).finish_non_exhaustive()
    }
}

impl<B> fmt::Display for Collision<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hash collision at {:#010x}", self.hash)
    }
}

impl<B> std::error::Error for Collision<B> {}

/// Circular, sorted set of buckets for consistent key placement.
///
/// # Invariants
///
/// - Buckets are strictly ascending by `Bucket::hash()`
/// - No two buckets share a hash value
///
/// # Example
///
/// ```rust
/// use corelib::{HashRing, Hashed};
///
/// let ring = HashRing::new();
/// ring.append(Hashed(100)).unwrap();
/// ring.append(Hashed(200)).unwrap();
///
/// assert_eq!(ring.hit(150).map(|(_, b)| b), Some(Hashed(200)));
/// // Past the last bucket the ring wraps to the first one.
/// assert_eq!(ring.hit(250).map(|(_, b)| b), Some(Hashed(100)));
/// ```
pub struct HashRing<B> {
    ring: RwLock<Vec<B>>,
}

impl<B: Bucket + Clone> HashRing<B> {
    pub fn new() -> Self {
        Self {
            ring: RwLock::new(Vec::with_capacity(4)),
        }
    }

    pub fn len(&self) -> usize {
        self.ring.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.read().is_empty()
    }

    /// Inserts a bucket at its sorted position.
    ///
    /// Returns the immediate successor of the new bucket (the bucket whose
    /// key range the new one has split). On a ring of one, that is the new
    /// bucket itself.
    pub fn append(&self, bucket: B) -> Result<B, Collision<B>> {
        let hash = bucket.hash();
        let mut ring = self.ring.write();
        match ring.binary_search_by_key(&hash, |b| b.hash()) {
            Ok(idx) => Err(Collision {
                hash,
                existing: ring[idx].clone(),
                rejected: bucket,
            }),
            Err(idx) => {
                ring.insert(idx, bucket);
                let next = if idx + 1 == ring.len() { 0 } else { idx + 1 };
                Ok(ring[next].clone())
            }
        }
    }

    /// Removes the bucket at `index`.
    ///
    /// Returns the removed bucket and its former successor, which now covers
    /// the removed bucket's key range (`None` once the ring is empty).
    pub fn remove(&self, index: usize) -> Option<(B, Option<B>)> {
        let mut ring = self.ring.write();
        Self::remove_locked(&mut ring, index)
    }

    /// Removes the bucket whose hash is exactly `hash`.
    pub fn remove_hash(&self, hash: u32) -> Option<(B, Option<B>)> {
        let mut ring = self.ring.write();
        let idx = ring.binary_search_by_key(&hash, |b| b.hash()).ok()?;
        Self::remove_locked(&mut ring, idx)
    }

    /// Removes the bucket at `hash` only if `matches` accepts it.
    ///
    /// Lets owners guard against evicting a different bucket that happens
    /// to hold the same position.
    pub fn remove_hash_if(&self, hash: u32, matches: impl FnOnce(&B) -> bool) -> Option<(B, Option<B>)> {
        let mut ring = self.ring.write();
        let idx = ring.binary_search_by_key(&hash, |b| b.hash()).ok()?;
        if !matches(&ring[idx]) {
            return None;
        }
        Self::remove_locked(&mut ring, idx)
    }

    fn remove_locked(ring: &mut Vec<B>, index: usize) -> Option<(B, Option<B>)> {
        if index >= ring.len() {
            return None;
        }
        let removed = ring.remove(index);
        if ring.is_empty() {
            return Some((removed, None));
        }
        let next = if index >= ring.len() { 0 } else { index };
        Some((removed, Some(ring[next].clone())))
    }

    /// Finds the bucket responsible for `hash`: the smallest bucket hash
    /// `>= hash`, wrapping to the first bucket past the end of the ring.
    pub fn hit(&self, hash: u32) -> Option<(usize, B)> {
        let ring = self.ring.read();
        if ring.is_empty() {
            return None;
        }
        let mut idx = ring.partition_point(|b| b.hash() < hash);
        if idx == ring.len() {
            idx = 0;
        }
        Some((idx, ring[idx].clone()))
    }

    /// Exact-match lookup.
    pub fn find(&self, hash: u32) -> Option<(usize, B)> {
        let ring = self.ring.read();
        let idx = ring.binary_search_by_key(&hash, |b| b.hash()).ok()?;
        Some((idx, ring[idx].clone()))
    }

    pub fn at(&self, index: usize) -> Option<B> {
        self.ring.read().get(index).cloned()
    }

    /// Positional access modulo the current ring size, under a single read
    /// lock so the size cannot change between the modulo and the access.
    pub fn at_wrapping(&self, n: usize) -> Option<B> {
        let ring = self.ring.read();
        if ring.is_empty() {
            return None;
        }
        Some(ring[n % ring.len()].clone())
    }

    /// Empties the ring, returning its buckets in ring order.
    pub fn clear(&self) -> Vec<B> {
        std::mem::take(&mut *self.ring.write())
    }

    /// Snapshot of all buckets in ring order.
    pub fn buckets(&self) -> Vec<B> {
        self.ring.read().clone()
    }

    pub fn hashes(&self) -> Vec<u32> {
        self.ring.read().iter().map(|b| b.hash()).collect()
    }
}

impl<B: Bucket + Clone> Default for HashRing<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Bucket> fmt::Display for HashRing<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ring = self.ring.read();
        write!(f, "{{")?;
        for (i, bucket) in ring.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", bucket.hash())?;
        }
        write!(f, "}}")
    }
}

impl<B: Bucket> fmt::Debug for HashRing<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashRing{}", self)
    }
}
