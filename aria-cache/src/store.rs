//! In-memory cache tier
//!
//! Pure keyed store per entity kind. No I/O and no await points: every
//! operation runs to completion under one lock section, so interleaving
//! across suspension points cannot observe a half-applied mutation.
//! All writes flow through the owning session; nothing else mutates
//! entries directly.

use aria_common::{CacheEntry, Freshness, Kind};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// One incoming entity payload for `add`/`update`.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub id: i64,
    pub metadata: Value,
}

impl NewEntry {
    pub fn new(id: i64, metadata: Value) -> Self {
        Self { id, metadata }
    }
}

/// In-memory keyed store. Kinds are separate maps, so an id can never
/// collide across kinds.
#[derive(Debug, Default)]
pub struct CacheStore {
    entries: HashMap<Kind, HashMap<i64, CacheEntry>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch entries for `ids`. Unknown ids are omitted; tombstoned
    /// entries are excluded from normal reads. Never fails.
    pub fn get(&self, kind: Kind, ids: &[i64]) -> HashMap<i64, CacheEntry> {
        let Some(map) = self.entries.get(&kind) else {
            return HashMap::new();
        };
        ids.iter()
            .filter_map(|id| map.get(id))
            .filter(|entry| !entry.is_deleted)
            .map(|entry| (entry.id, entry.clone()))
            .collect()
    }

    /// Raw accessor that does not filter tombstones. Internal callers
    /// (retrieval reconciliation, confirmation read-back) need the
    /// flagged entry itself.
    pub fn entry(&self, kind: Kind, id: i64) -> Option<&CacheEntry> {
        self.entries.get(&kind).and_then(|map| map.get(&id))
    }

    /// Insert or merge entries. With `replace = false` each payload is
    /// merged into any existing entry via the shared customizer; with
    /// `replace = true` the payload fully supersedes. Timestamps bump
    /// monotonically either way. Tombstone flags are left untouched by
    /// merges (refetch must not resurrect a local delete).
    pub fn add(&mut self, kind: Kind, entries: Vec<NewEntry>, replace: bool) {
        let map = self.entries.entry(kind).or_default();
        for incoming in entries {
            match map.get_mut(&incoming.id) {
                Some(existing) => {
                    if replace {
                        existing.supersede(incoming.metadata);
                    } else {
                        existing.merge_from(&incoming.metadata);
                    }
                }
                None => {
                    map.insert(incoming.id, CacheEntry::new(kind, incoming.id, incoming.metadata));
                }
            }
        }
    }

    /// Merge patches into existing entries. Strict no-op for unknown
    /// ids: update never creates an entry.
    pub fn update(&mut self, kind: Kind, patches: Vec<NewEntry>) {
        let Some(map) = self.entries.get_mut(&kind) else {
            return;
        };
        for patch in patches {
            if let Some(existing) = map.get_mut(&patch.id) {
                existing.merge_from(&patch.metadata);
            } else {
                tracing::debug!(%kind, id = patch.id, "update for unknown id ignored");
            }
        }
    }

    /// Tombstone a local delete. The entry stays flagged across refetch
    /// reconciliation until `clear_tombstone` or a hard `remove`.
    pub fn mark_deleted(&mut self, kind: Kind, id: i64) {
        if let Some(entry) = self.entries.entry(kind).or_default().get_mut(&id) {
            entry.is_deleted = true;
        }
    }

    /// Explicit reconciliation: lift the tombstone.
    pub fn clear_tombstone(&mut self, kind: Kind, id: i64) {
        if let Some(entry) = self.entries.entry(kind).or_default().get_mut(&id) {
            entry.is_deleted = false;
        }
    }

    /// Hard delete, used only once the server confirmed the removal.
    pub fn remove(&mut self, kind: Kind, id: i64) {
        if let Some(map) = self.entries.get_mut(&kind) {
            map.remove(&id);
        }
    }

    pub fn is_tombstoned(&self, kind: Kind, id: i64) -> bool {
        self.entry(kind, id).map(|e| e.is_deleted).unwrap_or(false)
    }

    /// Age-vs-TTL partition input for the retrieval coordinator.
    pub fn freshness(&self, kind: Kind, id: i64, ttl: Duration, now: DateTime<Utc>) -> Freshness {
        match self.entry(kind, id) {
            Some(entry) => entry.freshness(ttl, now),
            None => Freshness::Missing,
        }
    }

    /// Drop everything (logout/account switch).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self, kind: Kind) -> usize {
        self.entries.get(&kind).map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(|m| m.is_empty())
    }
}
