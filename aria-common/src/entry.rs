//! Cached entity records and keys

use crate::kind::Kind;
use crate::merge::merge_metadata;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// One cached entity version.
///
/// `metadata` is always a JSON object. `timestamp` records the last write
/// and never decreases for a given id (monotonic bump on merge).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: i64,
    pub kind: Kind,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
    pub is_deleted: bool,
}

impl CacheEntry {
    pub fn new(kind: Kind, id: i64, metadata: Value) -> Self {
        Self {
            id,
            kind,
            metadata,
            timestamp: Utc::now(),
            is_deleted: false,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey { kind: self.kind, id: self.id }
    }

    /// Merge `incoming` metadata into this entry per the shared
    /// customizer, bumping the timestamp monotonically.
    pub fn merge_from(&mut self, incoming: &Value) {
        self.metadata = merge_metadata(&self.metadata, incoming, self.kind.strategy());
        self.touch();
    }

    /// Replace metadata wholesale (the `replace = true` path).
    pub fn supersede(&mut self, incoming: Value) {
        self.metadata = incoming;
        self.touch();
    }

    fn touch(&mut self) {
        let now = Utc::now();
        if now > self.timestamp {
            self.timestamp = now;
        }
    }

    /// Age-based freshness against a TTL.
    pub fn freshness(&self, ttl: std::time::Duration, now: DateTime<Utc>) -> Freshness {
        let ttl = Duration::from_std(ttl).unwrap_or(Duration::MAX);
        if now - self.timestamp <= ttl {
            Freshness::Fresh
        } else {
            Freshness::Stale
        }
    }
}

/// Freshness of a cached id relative to the configured TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    Missing,
}

/// Composite `kind:id` key addressing one entity across both tiers and
/// the confirmation queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: Kind,
    pub id: i64,
}

impl EntityKey {
    pub fn new(kind: Kind, id: i64) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for EntityKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("malformed entity key: {s}"))?;
        let kind = Kind::parse(kind).ok_or_else(|| format!("unknown kind in key: {s}"))?;
        let id = id.parse().map_err(|_| format!("bad id in key: {s}"))?;
        Ok(EntityKey { kind, id })
    }
}
