//! Pool lifecycle notifications.
//!
//! Every structural change of a pool is reported to its factory. This is a
//! side channel for logging and metrics; no pool behavior depends on it.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolEventKind {
    /// A new drip was created and joined the pool.
    NewDrip,
    /// The factory failed to create a drip.
    NewDripFailure,
    /// An unhealthy drip left the balancing structure.
    RemoveDrip,
    /// A drip's connection was torn down.
    DestroyDrip,
    /// The pool was closed.
    Closed,
}

impl PoolEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolEventKind::NewDrip => "new_drip",
            PoolEventKind::NewDripFailure => "new_drip_failure",
            PoolEventKind::RemoveDrip => "remove_drip",
            PoolEventKind::DestroyDrip => "destroy_drip",
            PoolEventKind::Closed => "closed",
        }
    }
}

impl fmt::Display for PoolEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEvent {
    pub kind: PoolEventKind,
    /// The drip concerned, if any.
    pub drip: Option<u64>,
    /// Live drips in the balancing structure after the change.
    pub drip_count: usize,
}

impl PoolEvent {
    pub(crate) fn new(kind: PoolEventKind, drip: Option<u64>, drip_count: usize) -> Self {
        Self { kind, drip, drip_count }
    }
}

impl fmt::Display for PoolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.drip {
            Some(id) => write!(f, "{{event: {}, drip: {}, drip_count: {}}}", self.kind, id, self.drip_count),
            None => write!(f, "{{event: {}, drip_count: {}}}", self.kind, self.drip_count),
        }
    }
}
