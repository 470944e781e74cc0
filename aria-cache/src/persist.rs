//! Persistent cache tier
//!
//! Sqlite-backed, TTL-bounded second tier keyed by `kind:id`. Survives
//! process restarts and merges with whatever later sessions write, using
//! the same customizer as the in-memory tier.
//!
//! Storage failures never reach cache callers: reads degrade to a miss,
//! writes are dropped, both with a warning. When the medium is
//! unavailable (or persistence is administratively disabled) every
//! operation is a silent no-op and the in-memory tier carries the whole
//! load.
//!
//! Eviction is driven by an expiry min-heap instead of enumerating all
//! keys per call: expired keys are popped in O(log n) and deleted
//! fire-and-forget; reads additionally filter by the TTL cutoff so the
//! boundary is exact regardless of delete completion.

use crate::store::NewEntry;
use aria_common::{CacheEntry, EntityKey, Kind, Uid, UidAllocator};
use aria_common::merge::merge_metadata;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// A live persisted record with a fresh per-occurrence UID for the
/// caller's context.
#[derive(Debug, Clone)]
pub struct PersistedItem {
    pub uid: Uid,
    pub entry: CacheEntry,
}

/// Disk-backed second cache tier.
pub struct PersistentCache {
    pool: Option<Pool<Sqlite>>,
    ttl: Duration,
    enabled: AtomicBool,
    // (expires_at_ms, cache_key) min-heap
    expiry: Mutex<BinaryHeap<Reverse<(i64, String)>>>,
}

impl PersistentCache {
    /// Open the persistent tier. `path = None` uses a private in-memory
    /// database (useful for tests and for sessions that want tier-two
    /// semantics without surviving restarts).
    ///
    /// A medium that cannot be opened does not fail the session: the
    /// tier comes up disabled and the in-memory store continues alone.
    pub async fn open(path: Option<&Path>, ttl: Duration, enabled: bool) -> Self {
        let pool = match Self::connect(path).await {
            Ok(pool) => Some(pool),
            Err(e) => {
                tracing::warn!(error = %e, "Persistent cache unavailable, continuing in-memory only");
                None
            }
        };
        let cache = Self {
            pool,
            ttl,
            enabled: AtomicBool::new(enabled),
            expiry: Mutex::new(BinaryHeap::new()),
        };
        cache.seed_expiry_heap().await;
        cache
    }

    async fn connect(path: Option<&Path>) -> aria_common::Result<Pool<Sqlite>> {
        let options = match path {
            Some(path) => SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true),
            None => SqliteConnectOptions::new().in_memory(true),
        };
        // A single connection keeps in-memory databases coherent and is
        // plenty for a per-session cache file.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                cache_key   TEXT PRIMARY KEY,
                kind        TEXT NOT NULL,
                entity_id   INTEGER NOT NULL,
                metadata    TEXT NOT NULL,
                is_deleted  INTEGER NOT NULL DEFAULT 0,
                written_at  INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        Ok(pool)
    }

    /// Load expiry times for rows written by earlier sessions so they
    /// participate in heap-driven eviction too.
    async fn seed_expiry_heap(&self) {
        let Some(pool) = self.active_pool() else { return };
        let rows = sqlx::query("SELECT cache_key, written_at FROM cache_entries")
            .fetch_all(pool)
            .await;
        match rows {
            Ok(rows) => {
                let ttl_ms = self.ttl.as_millis() as i64;
                let mut heap = self.expiry.lock().unwrap();
                for row in rows {
                    let key: String = row.get("cache_key");
                    let written_at: i64 = row.get("written_at");
                    heap.push(Reverse((written_at + ttl_ms, key)));
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to seed expiry heap"),
        }
    }

    fn active_pool(&self) -> Option<&Pool<Sqlite>> {
        if !self.enabled.load(Ordering::SeqCst) {
            return None;
        }
        self.pool.as_ref()
    }

    /// Administrative/master switch. While disabled, reads return empty
    /// and writes are accepted but dropped.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && self.pool.is_some()
    }

    fn cutoff_ms(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp_millis() - self.ttl.as_millis() as i64
    }

    /// Insert or merge entries. Existing live rows merge via the shared
    /// customizer (`replace = true` supersedes); expired rows are treated
    /// as absent.
    pub async fn add(&self, kind: Kind, entries: &[NewEntry], replace: bool) {
        let Some(pool) = self.active_pool() else { return };
        let now = Utc::now();
        let cutoff = self.cutoff_ms(now);
        let written_at = now.timestamp_millis();
        let ttl_ms = self.ttl.as_millis() as i64;

        for incoming in entries {
            let key = EntityKey::new(kind, incoming.id).to_string();
            let metadata = if replace {
                incoming.metadata.clone()
            } else {
                match self.read_row(pool, &key, cutoff).await {
                    Some((existing, _)) => {
                        merge_metadata(&existing, &incoming.metadata, kind.strategy())
                    }
                    None => incoming.metadata.clone(),
                }
            };
            let result = sqlx::query(
                r#"
                INSERT INTO cache_entries (cache_key, kind, entity_id, metadata, is_deleted, written_at)
                VALUES (?, ?, ?, ?, COALESCE((SELECT is_deleted FROM cache_entries WHERE cache_key = ?), 0), ?)
                ON CONFLICT(cache_key) DO UPDATE SET metadata = excluded.metadata, written_at = excluded.written_at
                "#,
            )
            .bind(&key)
            .bind(kind.as_str())
            .bind(incoming.id)
            .bind(metadata.to_string())
            .bind(&key)
            .bind(written_at)
            .execute(pool)
            .await;

            match result {
                Ok(_) => {
                    let mut heap = self.expiry.lock().unwrap();
                    heap.push(Reverse((written_at + ttl_ms, key)));
                }
                Err(e) => tracing::warn!(%key, error = %e, "Persistent cache write dropped"),
            }
        }
        self.evict_expired(now);
    }

    async fn read_row(
        &self,
        pool: &Pool<Sqlite>,
        key: &str,
        cutoff: i64,
    ) -> Option<(serde_json::Value, bool)> {
        let row = sqlx::query(
            "SELECT metadata, is_deleted FROM cache_entries WHERE cache_key = ? AND written_at > ?",
        )
        .bind(key)
        .bind(cutoff)
        .fetch_optional(pool)
        .await;
        match row {
            Ok(Some(row)) => {
                let raw: String = row.get("metadata");
                let is_deleted: i64 = row.get("is_deleted");
                match serde_json::from_str(&raw) {
                    Ok(value) => Some((value, is_deleted != 0)),
                    Err(e) => {
                        tracing::warn!(%key, error = %e, "Corrupt persisted metadata treated as miss");
                        None
                    }
                }
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(%key, error = %e, "Persistent cache read degraded to miss");
                None
            }
        }
    }

    /// Point probe for the retrieval coordinator's tier-two step.
    /// Expired rows are misses. Tombstoned rows come back with the flag
    /// set so reconciliation can preserve it.
    pub async fn get(&self, kind: Kind, ids: &[i64]) -> HashMap<i64, CacheEntry> {
        let Some(pool) = self.active_pool() else {
            return HashMap::new();
        };
        let now = Utc::now();
        let cutoff = self.cutoff_ms(now);
        let mut found = HashMap::new();
        for &id in ids {
            let key = EntityKey::new(kind, id).to_string();
            if let Some((metadata, is_deleted)) = self.read_row(pool, &key, cutoff).await {
                let mut entry = CacheEntry::new(kind, id, metadata);
                entry.is_deleted = is_deleted;
                found.insert(id, entry);
            }
        }
        self.evict_expired(now);
        found
    }

    /// Enumerate all live, non-tombstoned records partitioned by kind,
    /// assigning each a fresh UID for the caller's context. Expired
    /// records are evicted fire-and-forget.
    pub async fn get_all_items(&self, uids: &UidAllocator) -> HashMap<Kind, Vec<PersistedItem>> {
        let Some(pool) = self.active_pool() else {
            return HashMap::new();
        };
        let now = Utc::now();
        let cutoff = self.cutoff_ms(now);
        self.evict_expired(now);

        let rows = sqlx::query(
            "SELECT kind, entity_id, metadata, written_at FROM cache_entries \
             WHERE written_at > ? AND is_deleted = 0",
        )
        .bind(cutoff)
        .fetch_all(pool)
        .await;

        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "Persistent cache enumeration degraded to empty");
                return HashMap::new();
            }
        };

        let mut items: HashMap<Kind, Vec<PersistedItem>> = HashMap::new();
        for row in rows {
            let kind_str: String = row.get("kind");
            let Some(kind) = Kind::parse(&kind_str) else {
                tracing::warn!(kind = %kind_str, "Skipping row with unknown kind");
                continue;
            };
            let id: i64 = row.get("entity_id");
            let raw: String = row.get("metadata");
            let written_at: i64 = row.get("written_at");
            let Ok(metadata) = serde_json::from_str(&raw) else {
                tracing::warn!(%kind, id, "Skipping corrupt persisted metadata");
                continue;
            };
            let mut entry = CacheEntry::new(kind, id, metadata);
            if let Some(ts) = DateTime::from_timestamp_millis(written_at) {
                entry.timestamp = ts;
            }
            items.entry(kind).or_default().push(PersistedItem {
                uid: uids.allocate(kind, id),
                entry,
            });
        }
        items
    }

    /// Persist the tombstone flag for a local delete.
    pub async fn mark_deleted(&self, kind: Kind, id: i64) {
        let Some(pool) = self.active_pool() else { return };
        let key = EntityKey::new(kind, id).to_string();
        if let Err(e) = sqlx::query("UPDATE cache_entries SET is_deleted = 1 WHERE cache_key = ?")
            .bind(&key)
            .execute(pool)
            .await
        {
            tracing::warn!(%key, error = %e, "Tombstone write dropped");
        }
    }

    pub async fn clear_tombstone(&self, kind: Kind, id: i64) {
        let Some(pool) = self.active_pool() else { return };
        let key = EntityKey::new(kind, id).to_string();
        if let Err(e) = sqlx::query("UPDATE cache_entries SET is_deleted = 0 WHERE cache_key = ?")
            .bind(&key)
            .execute(pool)
            .await
        {
            tracing::warn!(%key, error = %e, "Tombstone clear dropped");
        }
    }

    /// Hard delete, used only on confirmed server-side removal.
    pub async fn remove(&self, kind: Kind, id: i64) {
        let Some(pool) = self.active_pool() else { return };
        let key = EntityKey::new(kind, id).to_string();
        if let Err(e) = sqlx::query("DELETE FROM cache_entries WHERE cache_key = ?")
            .bind(&key)
            .execute(pool)
            .await
        {
            tracing::warn!(%key, error = %e, "Persistent delete dropped");
        }
    }

    /// Pop expired keys off the heap and delete them fire-and-forget.
    /// The written_at guard keeps a row alive if it was rewritten after
    /// this expiry entry was pushed.
    fn evict_expired(&self, now: DateTime<Utc>) {
        let Some(pool) = self.active_pool() else { return };
        let now_ms = now.timestamp_millis();
        let cutoff = self.cutoff_ms(now);
        let mut expired: Vec<String> = Vec::new();
        {
            let mut heap = self.expiry.lock().unwrap();
            while let Some(Reverse((expires_at, _))) = heap.peek() {
                if *expires_at > now_ms {
                    break;
                }
                let Reverse((_, key)) = heap.pop().unwrap();
                expired.push(key);
            }
        }
        for key in expired {
            let pool = pool.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    sqlx::query("DELETE FROM cache_entries WHERE cache_key = ? AND written_at <= ?")
                        .bind(&key)
                        .bind(cutoff)
                        .execute(&pool)
                        .await
                {
                    tracing::warn!(%key, error = %e, "TTL eviction delete failed");
                } else {
                    tracing::trace!(%key, "Evicted expired cache record");
                }
            });
        }
    }

    /// Stop further writes and purge all records. Invoked on
    /// logout/account switch so the next account never sees this one's
    /// data.
    pub async fn clear_all(&self) {
        let pool = self.pool.clone();
        self.enabled.store(false, Ordering::SeqCst);
        self.expiry.lock().unwrap().clear();
        if let Some(pool) = pool {
            if let Err(e) = sqlx::query("DELETE FROM cache_entries").execute(&pool).await {
                tracing::warn!(error = %e, "Persistent cache purge failed");
            }
        }
    }
}
