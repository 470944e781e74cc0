//! Session-scoped cache service
//!
//! One `CacheSession` per login session owns every piece of cache state:
//! the in-memory store, the persistent tier, the retrieval coordinator,
//! the confirmation queue, the reference resolver, and the UID
//! allocator. There are no ambient singletons; consumers hold the
//! session by reference and all writes flow through it. Logout tears the
//! whole thing down via [`CacheSession::clear_all`].

use crate::confirm::{ConfirmError, Confirmation, ConfirmationQueue};
use crate::persist::{PersistedItem, PersistentCache};
use crate::resolve::ReferenceResolver;
use crate::retrieve::{FetchOptions, MissPolicy, RetrievalCoordinator};
use crate::source::RemoteSource;
use crate::store::{CacheStore, NewEntry};
use aria_common::config::CacheConfig;
use aria_common::{CacheEntry, EntityKey, Error, Kind, Result, UidAllocator};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Whether a local write is mirrored to the persistent tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistMode {
    WriteThrough,
    MemoryOnly,
}

/// A discrete caller intent crossing the command boundary.
#[derive(Debug, Clone)]
pub struct Command {
    pub kind: Kind,
    pub operation: Operation,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Fetch,
    Create,
    Update,
    Delete,
}

/// Owned reply values; no shared mutable state crosses the boundary.
#[derive(Debug, Clone)]
pub enum CommandReply {
    Entries(Vec<(i64, Option<CacheEntry>)>),
    Confirmed(Confirmation),
    Deleted { id: i64 },
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Cache(#[from] Error),
    #[error(transparent)]
    Confirm(#[from] ConfirmError),
}

/// Application-scoped entity cache service.
pub struct CacheSession {
    session_id: Uuid,
    store: Arc<Mutex<CacheStore>>,
    persist: Arc<PersistentCache>,
    coordinator: Arc<RetrievalCoordinator>,
    confirmer: Arc<ConfirmationQueue>,
    resolver: ReferenceResolver,
    uids: Arc<UidAllocator>,
    source: Arc<dyn RemoteSource>,
}

impl CacheSession {
    /// Construct the session's cache stack. A persistent medium that
    /// cannot be opened degrades to in-memory-only; a bad config is a
    /// hard error.
    pub async fn open(config: CacheConfig, source: Arc<dyn RemoteSource>) -> Result<Self> {
        config.validate()?;
        let session_id = Uuid::new_v4();
        let store = Arc::new(Mutex::new(CacheStore::new()));
        let persist = Arc::new(
            PersistentCache::open(
                config.database_path.as_deref(),
                config.entry_ttl(),
                config.persistence_enabled,
            )
            .await,
        );
        let coordinator = Arc::new(RetrievalCoordinator::new(
            store.clone(),
            persist.clone(),
            source.clone(),
            &config,
        ));
        let confirmer = Arc::new(ConfirmationQueue::new(store.clone(), persist.clone(), &config));
        let uids = Arc::new(UidAllocator::new());
        let resolver = ReferenceResolver::new(coordinator.clone(), uids.clone());

        tracing::info!(%session_id, persistent = persist.is_enabled(), "Cache session opened");
        Ok(Self {
            session_id,
            store,
            persist,
            coordinator,
            confirmer,
            resolver,
            uids,
            source,
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Pure in-memory read; tombstoned and unknown ids are omitted.
    pub fn get(&self, kind: Kind, ids: &[i64]) -> HashMap<i64, CacheEntry> {
        self.store.lock().unwrap().get(kind, ids)
    }

    /// Read through the tiers, then attach denormalized relations.
    pub async fn fetch(
        &self,
        kind: Kind,
        ids: &[i64],
        options: FetchOptions,
    ) -> Result<Vec<(i64, Option<CacheEntry>)>> {
        let fetched = self.coordinator.get_or_fetch(kind, ids, options).await?;

        let mut entries: Vec<CacheEntry> = fetched
            .iter()
            .filter_map(|(_, entry)| entry.clone())
            .collect();
        self.resolver.resolve(&mut entries).await;
        let resolved: HashMap<i64, CacheEntry> =
            entries.into_iter().map(|e| (e.id, e)).collect();

        Ok(fetched
            .into_iter()
            .map(|(id, entry)| match entry {
                Some(_) => (id, resolved.get(&id).cloned()),
                None => (id, None),
            })
            .collect())
    }

    /// Optimistic local insert/merge, mirrored to the persistent tier
    /// per `persist_mode`.
    pub async fn add(
        &self,
        kind: Kind,
        entries: Vec<NewEntry>,
        replace: bool,
        persist_mode: PersistMode,
    ) {
        self.store.lock().unwrap().add(kind, entries.clone(), replace);
        if persist_mode == PersistMode::WriteThrough {
            self.persist.add(kind, &entries, replace).await;
        }
    }

    /// Optimistic local patch of pre-existing entries (unknown ids are
    /// ignored), mirrored per `persist_mode`.
    pub async fn update(
        &self,
        kind: Kind,
        patches: Vec<NewEntry>,
        persist_mode: PersistMode,
    ) {
        let known: Vec<NewEntry> = {
            let mut store = self.store.lock().unwrap();
            let known = patches
                .into_iter()
                .filter(|p| store.entry(kind, p.id).is_some())
                .collect::<Vec<_>>();
            store.update(kind, known.clone());
            known
        };
        if persist_mode == PersistMode::WriteThrough {
            self.persist.add(kind, &known, false).await;
        }
    }

    /// Tombstone a local delete in both tiers.
    pub async fn mark_deleted(&self, kind: Kind, id: i64) {
        self.store.lock().unwrap().mark_deleted(kind, id);
        self.persist.mark_deleted(kind, id).await;
    }

    /// Explicit reconciliation: lift a tombstone in both tiers.
    pub async fn clear_tombstone(&self, kind: Kind, id: i64) {
        self.store.lock().unwrap().clear_tombstone(kind, id);
        self.persist.clear_tombstone(kind, id).await;
    }

    /// Merge everything still live in the persistent tier into memory.
    /// Returns the number of hydrated entries.
    pub async fn hydrate(&self) -> usize {
        let items = self.persist.get_all_items(&self.uids).await;
        let mut count = 0;
        let mut store = self.store.lock().unwrap();
        for (kind, items) in items {
            for PersistedItem { entry, .. } in items {
                store.add(kind, vec![NewEntry::new(entry.id, entry.metadata)], false);
                count += 1;
            }
        }
        count
    }

    /// Create an entity: optimistic insert, then confirmed remote
    /// create. Validation happens before the optimistic write and never
    /// enters the queue. A rejected confirmation rolls the optimistic
    /// insert back; a timeout leaves it in place (the remote write may
    /// still land).
    pub async fn create(
        &self,
        kind: Kind,
        id: i64,
        payload: Value,
    ) -> std::result::Result<Confirmation, ConfirmError> {
        validate_payload(kind, id, &payload).map_err(ConfirmError::Rejected)?;
        let snapshot = self.snapshot(kind, id);
        self.add(kind, vec![NewEntry::new(id, payload.clone())], false, PersistMode::WriteThrough)
            .await;

        let source = self.source.clone();
        let outcome = self
            .confirmer
            .request_confirmation(EntityKey::new(kind, id), move || {
                let source = source.clone();
                let payload = payload.clone();
                async move { source.create_entity(kind, id, payload).await }
            })
            .await;
        if let Err(ConfirmError::Rejected(e)) = &outcome {
            tracing::warn!(%kind, id, error = %e, "Create rejected, rolling optimistic insert back");
            self.restore(kind, id, snapshot).await;
        }
        outcome
    }

    /// Mutate an entity: optimistic merge, then confirmed remote update
    /// with canonical read-back. A rejected confirmation restores the
    /// pre-patch view; a timeout leaves the optimistic patch in place.
    pub async fn save(
        &self,
        kind: Kind,
        id: i64,
        payload: Value,
    ) -> std::result::Result<Confirmation, ConfirmError> {
        validate_payload(kind, id, &payload).map_err(ConfirmError::Rejected)?;
        let snapshot = self.snapshot(kind, id);
        if snapshot.is_none() {
            return Err(ConfirmError::Rejected(Error::Validation(format!(
                "cannot save {kind}:{id}: not cached"
            ))));
        }
        self.update(kind, vec![NewEntry::new(id, payload.clone())], PersistMode::WriteThrough)
            .await;

        let source = self.source.clone();
        let outcome = self
            .confirmer
            .request_confirmation(EntityKey::new(kind, id), move || {
                let source = source.clone();
                let payload = payload.clone();
                async move { source.update_entity(kind, id, payload).await }
            })
            .await;
        if let Err(ConfirmError::Rejected(e)) = &outcome {
            tracing::warn!(%kind, id, error = %e, "Save rejected, restoring pre-patch view");
            self.restore(kind, id, snapshot).await;
        }
        outcome
    }

    fn snapshot(&self, kind: Kind, id: i64) -> Option<Value> {
        self.store
            .lock()
            .unwrap()
            .entry(kind, id)
            .map(|e| e.metadata.clone())
    }

    /// Put an entity back to its pre-optimistic state in both tiers.
    async fn restore(&self, kind: Kind, id: i64, snapshot: Option<Value>) {
        match snapshot {
            Some(metadata) => {
                self.add(kind, vec![NewEntry::new(id, metadata)], true, PersistMode::WriteThrough)
                    .await;
            }
            None => {
                self.store.lock().unwrap().remove(kind, id);
                self.persist.remove(kind, id).await;
            }
        }
    }

    /// Delete an entity: tombstone immediately, confirm the remote
    /// delete, then hard-remove from both tiers. A rejected confirmation
    /// rolls the tombstone back; a timeout leaves it in place (the
    /// remote write may still land).
    pub async fn delete(
        &self,
        kind: Kind,
        id: i64,
    ) -> std::result::Result<(), ConfirmError> {
        self.mark_deleted(kind, id).await;

        let source = self.source.clone();
        let outcome = self
            .confirmer
            .request_confirmation(EntityKey::new(kind, id), move || {
                let source = source.clone();
                async move { source.delete_entity(kind, id).await }
            })
            .await;

        match outcome {
            Ok(_) => {
                self.store.lock().unwrap().remove(kind, id);
                self.persist.remove(kind, id).await;
                Ok(())
            }
            Err(ConfirmError::Rejected(e)) => {
                tracing::warn!(%kind, id, error = %e, "Delete rejected, rolling tombstone back");
                self.clear_tombstone(kind, id).await;
                Err(ConfirmError::Rejected(e))
            }
            Err(e) => Err(e),
        }
    }

    /// Dispatch one caller intent.
    pub async fn execute(&self, command: Command) -> std::result::Result<CommandReply, CommandError> {
        match command.operation {
            Operation::Fetch => {
                let ids: Vec<i64> = command
                    .payload
                    .get("ids")
                    .and_then(Value::as_array)
                    .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
                    .ok_or_else(|| Error::Validation("fetch payload needs an ids array".into()))?;
                let miss_policy = match command.payload.get("miss_policy").and_then(Value::as_str) {
                    Some("null") => MissPolicy::Null,
                    Some("omit") => MissPolicy::Omit,
                    other => {
                        return Err(CommandError::Cache(Error::Validation(format!(
                            "fetch payload needs miss_policy \"null\" or \"omit\", got {other:?}"
                        ))))
                    }
                };
                let bypass = command
                    .payload
                    .get("bypass_cache")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let options = if bypass {
                    FetchOptions::bypassing_cache(miss_policy)
                } else {
                    FetchOptions::new(miss_policy)
                };
                let entries = self.fetch(command.kind, &ids, options).await?;
                Ok(CommandReply::Entries(entries))
            }
            Operation::Create | Operation::Update => {
                let (id, metadata) = split_write_payload(&command.payload)?;
                let confirmation = match command.operation {
                    Operation::Create => self.create(command.kind, id, metadata).await?,
                    _ => self.save(command.kind, id, metadata).await?,
                };
                Ok(CommandReply::Confirmed(confirmation))
            }
            Operation::Delete => {
                let id = command
                    .payload
                    .get("id")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| Error::Validation("delete payload needs an id".into()))?;
                self.delete(command.kind, id).await?;
                Ok(CommandReply::Deleted { id })
            }
        }
    }

    /// Purge both tiers. Invoked on logout/account switch so no data
    /// leaks across accounts.
    pub async fn clear_all(&self) {
        tracing::info!(session_id = %self.session_id, "Clearing cache session");
        self.store.lock().unwrap().clear();
        self.persist.clear_all().await;
    }
}

fn split_write_payload(payload: &Value) -> Result<(i64, Value)> {
    let id = payload
        .get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Validation("write payload needs an id".into()))?;
    let metadata = payload
        .get("metadata")
        .cloned()
        .ok_or_else(|| Error::Validation("write payload needs a metadata object".into()))?;
    Ok((id, metadata))
}

/// Synchronous payload checks applied before any optimistic write.
fn validate_payload(kind: Kind, id: i64, payload: &Value) -> Result<()> {
    let Some(object) = payload.as_object() else {
        return Err(Error::Validation(format!(
            "{kind}:{id} payload must be a JSON object"
        )));
    };
    let id_field = kind.strategy().id_field;
    if let Some(embedded) = object.get(id_field) {
        if embedded.as_i64() != Some(id) {
            return Err(Error::Validation(format!(
                "{kind}:{id} payload carries mismatched {id_field} {embedded}"
            )));
        }
    }
    Ok(())
}
