//! Per-occurrence UID allocation
//!
//! A UID distinguishes occurrences of the same logical entity across
//! simultaneous ordered lists (the same track in two playlists). UIDs are
//! never a cache primary key; both tiers key by `kind:id`.

use crate::kind::Kind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque per-occurrence identifier, `kind-id-serial`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uid(String);

impl Uid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session-owned UID mint. One allocator per `CacheSession`; the serial
/// makes every allocation unique within the session.
#[derive(Debug, Default)]
pub struct UidAllocator {
    serial: AtomicU64,
}

impl UidAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self, kind: Kind, id: i64) -> Uid {
        let n = self.serial.fetch_add(1, Ordering::Relaxed);
        Uid(format!("{kind}-{id}-{n}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_entity_gets_distinct_uids_per_occurrence() {
        let uids = UidAllocator::new();
        let a = uids.allocate(Kind::Track, 7);
        let b = uids.allocate(Kind::Track, 7);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("Track-7-"));
    }
}
