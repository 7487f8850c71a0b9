//! The `Bucket` capability.

use std::sync::Arc;

/// Anything that can be placed on a `HashRing`.
///
/// The hash must be stable for the lifetime of the bucket: the ring's sort
/// order is computed from it on insertion and never revisited.
pub trait Bucket {
    fn hash(&self) -> u32;
}

impl<B: Bucket + ?Sized> Bucket for Arc<B> {
    #[inline]
    fn hash(&self) -> u32 {
        (**self).hash()
    }
}

impl<B: Bucket + ?Sized> Bucket for &B {
    #[inline]
    fn hash(&self) -> u32 {
        (**self).hash()
    }
}
