//! Write confirmation queue
//!
//! Guarantees at most one in-flight remote mutation per entity key while
//! the caller's optimistic view stays instant. Requests for the same key
//! queue FIFO behind the pending one (tokio's mutex hands the lock out
//! in acquisition order); requests for different keys proceed
//! independently.
//!
//! The work future performs the remote write plus a read-back of
//! canonical state. Transient failures retry with exponential backoff;
//! on success the canonical fields are merged over the optimistic entry,
//! with locally-derived fields (attached relations, disjoint optimistic
//! edits) preserved.

use crate::persist::PersistentCache;
use crate::store::{CacheStore, NewEntry};
use aria_common::config::CacheConfig;
use aria_common::{CacheEntry, EntityKey, Error};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Successful confirmation outcome.
#[derive(Debug, Clone)]
pub struct Confirmation {
    /// The reconciled entry as it now sits in the cache.
    pub entry: CacheEntry,
    /// True when canonical state diverged from the optimistic view and
    /// overwrote it on one or more fields.
    pub reconciled: bool,
    /// The overwritten field names, for user-facing messaging.
    pub changed_fields: Vec<String>,
}

/// Terminal confirmation failure.
#[derive(Debug, thiserror::Error)]
pub enum ConfirmError {
    /// Deadline elapsed. The underlying network call may still land;
    /// its result is discarded for cache purposes (last-writer-ignored).
    /// Message the user "still processing", not "failed".
    #[error("Confirmation deadline elapsed; the remote write may still complete")]
    Timeout,

    /// Explicit rejection, or retries exhausted.
    #[error("Confirmation rejected: {0}")]
    Rejected(#[source] Error),
}

impl ConfirmError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ConfirmError::Timeout)
    }
}

/// Per-key FIFO serializer for remote mutations.
pub struct ConfirmationQueue {
    store: Arc<Mutex<CacheStore>>,
    persist: Arc<PersistentCache>,
    locks: Mutex<HashMap<EntityKey, Arc<tokio::sync::Mutex<()>>>>,
    timeout: Duration,
    attempts: u32,
    backoff_initial: Duration,
}

impl ConfirmationQueue {
    pub fn new(
        store: Arc<Mutex<CacheStore>>,
        persist: Arc<PersistentCache>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            store,
            persist,
            locks: Mutex::new(HashMap::new()),
            timeout: config.confirmation_timeout(),
            attempts: config.confirmation_attempts,
            backoff_initial: config.confirmation_backoff_initial(),
        }
    }

    fn key_lock(&self, key: EntityKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(key)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Run `work` (remote write + canonical read-back) for `key`,
    /// serialized FIFO behind any pending confirmation for the same key,
    /// then reconcile the canonical metadata into both cache tiers.
    ///
    /// `work` is re-invoked on transient failures, with exponential
    /// backoff, up to the configured attempt count. On deadline the
    /// caller gets [`ConfirmError::Timeout`] while the work is left to
    /// finish in the background; a late result is logged and discarded.
    pub async fn request_confirmation<F, Fut>(
        &self,
        key: EntityKey,
        work: F,
    ) -> Result<Confirmation, ConfirmError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = aria_common::Result<Value>> + Send + 'static,
    {
        let guard = self.key_lock(key).lock_owned().await;
        let result = self.confirm_serialized(key, work).await;

        // Release under the map lock so the per-key mutex can be pruned
        // once no waiter holds a clone; a new arrival has to take the
        // map lock first, so the check cannot race a fresh clone
        let mut locks = self.locks.lock().unwrap();
        drop(guard);
        if locks.get(&key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&key);
        }
        result
    }

    async fn confirm_serialized<F, Fut>(
        &self,
        key: EntityKey,
        work: F,
    ) -> Result<Confirmation, ConfirmError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = aria_common::Result<Value>> + Send + 'static,
    {
        let attempts = self.attempts;
        let backoff_initial = self.backoff_initial;
        let mut handle = tokio::spawn(run_with_retries(key, work, attempts, backoff_initial));

        let canonical = match tokio::time::timeout(self.timeout, &mut handle).await {
            Err(_) => {
                // The spawned work keeps running; drain it off to the
                // side so a late success is visibly discarded
                tracing::warn!(%key, "Confirmation deadline elapsed, reporting timeout");
                tokio::spawn(async move {
                    match handle.await {
                        Ok(Ok(_)) => {
                            tracing::debug!(%key, "Late confirmation result discarded")
                        }
                        Ok(Err(e)) => {
                            tracing::debug!(%key, error = %e, "Late confirmation failure ignored")
                        }
                        Err(_) => {}
                    }
                });
                return Err(ConfirmError::Timeout);
            }
            Ok(Err(join_err)) => {
                return Err(ConfirmError::Rejected(Error::Internal(format!(
                    "confirmation task failed: {join_err}"
                ))));
            }
            Ok(Ok(Err(e))) => {
                tracing::warn!(%key, error = %e, "Confirmation rejected");
                return Err(ConfirmError::Rejected(e));
            }
            Ok(Ok(Ok(canonical))) => canonical,
        };

        Ok(self.reconcile(key, canonical).await)
    }

    /// Merge canonical state over the optimistic entry. Canonical wins
    /// on the fields it names; everything else (attached relations,
    /// disjoint optimistic edits) survives the merge.
    async fn reconcile(&self, key: EntityKey, canonical: Value) -> Confirmation {
        let (entry, changed_fields) = {
            let mut store = self.store.lock().unwrap();
            let before = store.entry(key.kind, key.id).map(|e| e.metadata.clone());
            store.add(key.kind, vec![NewEntry::new(key.id, canonical.clone())], false);
            let entry = store
                .entry(key.kind, key.id)
                .cloned()
                .unwrap_or_else(|| CacheEntry::new(key.kind, key.id, canonical.clone()));

            let changed = match (&before, canonical.as_object()) {
                (Some(before), Some(fields)) => fields
                    .keys()
                    .filter(|field| {
                        let old = before.get(field.as_str());
                        let new = entry.metadata.get(field.as_str());
                        old.is_some() && old != new
                    })
                    .cloned()
                    .collect(),
                _ => Vec::new(),
            };
            (entry, changed)
        };

        self.persist
            .add(key.kind, &[NewEntry::new(key.id, canonical)], false)
            .await;

        if !changed_fields.is_empty() {
            tracing::info!(%key, fields = ?changed_fields, "Canonical state overwrote optimistic fields");
        }
        Confirmation {
            entry,
            reconciled: !changed_fields.is_empty(),
            changed_fields,
        }
    }
}

/// Retry loop for one confirmation: transient failures back off and
/// retry; anything else is terminal. Mid-retry failures are logged, not
/// surfaced.
async fn run_with_retries<F, Fut>(
    key: EntityKey,
    mut work: F,
    attempts: u32,
    backoff_initial: Duration,
) -> aria_common::Result<Value>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = aria_common::Result<Value>> + Send,
{
    let mut backoff = backoff_initial;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match work().await {
            Ok(canonical) => {
                if attempt > 1 {
                    tracing::debug!(%key, attempt, "Confirmation succeeded after retry");
                }
                return Ok(canonical);
            }
            Err(e) if e.is_transient() && attempt < attempts => {
                tracing::warn!(
                    %key,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Transient confirmation failure, will retry"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
            Err(e) => return Err(e),
        }
    }
}
