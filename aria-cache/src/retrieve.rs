//! Retrieval coordination
//!
//! Resolves batches of ids through the tiers: in-memory store, then the
//! persistent tier, then the remote source, writing results through both
//! tiers on the way back. Concurrent callers asking for an id that is
//! already being fetched join the in-flight request instead of issuing a
//! duplicate network call.

use crate::persist::PersistentCache;
use crate::source::RemoteSource;
use crate::store::{CacheStore, NewEntry};
use aria_common::config::CacheConfig;
use aria_common::{CacheEntry, EntityKey, Freshness, Kind, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// How unresolvable ids appear in the result. An explicit caller
/// decision on every call; there is no default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissPolicy {
    /// Drop unresolvable ids from the result entirely.
    Omit,
    /// Keep unresolvable ids as explicit `(id, None)` pairs.
    Null,
}

/// Per-call fetch options.
#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    /// Skip the freshness check and go remote for every id.
    pub bypass_cache: bool,
    pub miss_policy: MissPolicy,
}

impl FetchOptions {
    pub fn new(miss_policy: MissPolicy) -> Self {
        Self { bypass_cache: false, miss_policy }
    }

    pub fn bypassing_cache(miss_policy: MissPolicy) -> Self {
        Self { bypass_cache: true, miss_policy }
    }
}

/// Lifecycle of one in-flight id. Pending ids become InFlight when a
/// caller takes ownership of the fetch; every requested id ends Resolved
/// or Failed.
#[derive(Debug, Clone, PartialEq)]
enum FetchState {
    InFlight,
    Resolved,
    Failed(String),
}

/// Batched, deduplicating reader over both tiers and the source.
pub struct RetrievalCoordinator {
    store: Arc<Mutex<CacheStore>>,
    persist: Arc<PersistentCache>,
    source: Arc<dyn RemoteSource>,
    in_flight: Mutex<HashMap<EntityKey, watch::Receiver<FetchState>>>,
    ttl: Duration,
    max_batch_size: usize,
}

impl RetrievalCoordinator {
    pub fn new(
        store: Arc<Mutex<CacheStore>>,
        persist: Arc<PersistentCache>,
        source: Arc<dyn RemoteSource>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            store,
            persist,
            source,
            in_flight: Mutex::new(HashMap::new()),
            ttl: config.entry_ttl(),
            max_batch_size: config.max_batch_size,
        }
    }

    /// Resolve `ids`, fetching whatever is stale or missing. The result
    /// follows the caller's requested order; unresolvable ids follow
    /// `options.miss_policy`. Per-id failures (source does not know the
    /// id) never fail the call; only a transport failure before any
    /// response was parsed returns `Err`.
    pub async fn get_or_fetch(
        &self,
        kind: Kind,
        ids: &[i64],
        options: FetchOptions,
    ) -> Result<Vec<(i64, Option<CacheEntry>)>> {
        // Partition by age vs TTL (one lock section, no await)
        let mut needed: Vec<i64> = Vec::new();
        {
            let store = self.store.lock().unwrap();
            let now = Utc::now();
            for &id in ids {
                if needed.contains(&id) {
                    continue;
                }
                let fresh = !options.bypass_cache
                    && store.freshness(kind, id, self.ttl, now) == Freshness::Fresh;
                if !fresh {
                    needed.push(id);
                }
            }
        }

        // Join fetches already in flight; take ownership of the rest
        let mut joined: Vec<watch::Receiver<FetchState>> = Vec::new();
        let mut owned: Vec<(i64, watch::Sender<FetchState>)> = Vec::new();
        {
            let mut registry = self.in_flight.lock().unwrap();
            for id in needed {
                let key = EntityKey::new(kind, id);
                match registry.get(&key) {
                    Some(rx) => joined.push(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(FetchState::InFlight);
                        registry.insert(key, rx);
                        owned.push((id, tx));
                    }
                }
            }
        }

        let fetch_result = if owned.is_empty() {
            Ok(())
        } else {
            self.fetch_owned(kind, owned).await
        };

        // Wait for fetches other callers own
        for mut rx in joined {
            while *rx.borrow() == FetchState::InFlight {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }

        fetch_result?;
        Ok(self.collect(kind, ids, options.miss_policy))
    }

    /// Fetch the ids this call owns: persistent-tier probe first, then
    /// chunked source calls, writing through both tiers. Registry entries
    /// are settled and cleared on every path out.
    async fn fetch_owned(
        &self,
        kind: Kind,
        owned: Vec<(i64, watch::Sender<FetchState>)>,
    ) -> Result<()> {
        let ids: Vec<i64> = owned.iter().map(|(id, _)| *id).collect();
        let mut senders: HashMap<i64, watch::Sender<FetchState>> = owned.into_iter().collect();

        // Tier two: live persisted records satisfy the fetch locally
        let persisted = self.persist.get(kind, &ids).await;
        let mut remote_ids: Vec<i64> = Vec::new();
        if !persisted.is_empty() {
            let mut store = self.store.lock().unwrap();
            for &id in &ids {
                match persisted.get(&id) {
                    Some(entry) => {
                        store.add(kind, vec![NewEntry::new(id, entry.metadata.clone())], false);
                        if entry.is_deleted {
                            store.mark_deleted(kind, id);
                        }
                    }
                    None => remote_ids.push(id),
                }
            }
        } else {
            remote_ids = ids.clone();
        }
        for (id, _) in persisted.iter() {
            self.settle(kind, *id, &mut senders, FetchState::Resolved);
        }

        // Tier three: the source, in bounded batches
        for chunk in remote_ids.chunks(self.max_batch_size) {
            tracing::debug!(%kind, batch = chunk.len(), "Fetching batch from remote source");
            match self.source.get_by_ids(kind, chunk.to_vec()).await {
                Ok(values) => {
                    let mut resolved: Vec<NewEntry> = Vec::new();
                    for (&id, value) in chunk.iter().zip(values.iter()) {
                        match value {
                            Some(metadata) => {
                                resolved.push(NewEntry::new(id, metadata.clone()));
                                self.settle(kind, id, &mut senders, FetchState::Resolved);
                            }
                            None => {
                                tracing::debug!(%kind, id, "Source does not know id");
                                self.settle(
                                    kind,
                                    id,
                                    &mut senders,
                                    FetchState::Failed("not found".into()),
                                );
                            }
                        }
                    }
                    if !resolved.is_empty() {
                        // Tombstones survive this merge: add never
                        // touches the flag
                        self.store.lock().unwrap().add(kind, resolved.clone(), false);
                        self.persist.add(kind, &resolved, false).await;
                    }
                }
                Err(e) => {
                    // Transport failed before any response was parsed;
                    // settle everything still outstanding and surface
                    // the batch error
                    tracing::warn!(%kind, error = %e, "Source batch call failed");
                    let outstanding: Vec<i64> = senders.keys().copied().collect();
                    for id in outstanding {
                        self.settle(kind, id, &mut senders, FetchState::Failed(e.to_string()));
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn settle(
        &self,
        kind: Kind,
        id: i64,
        senders: &mut HashMap<i64, watch::Sender<FetchState>>,
        state: FetchState,
    ) {
        if let Some(tx) = senders.remove(&id) {
            let _ = tx.send(state);
            self.in_flight.lock().unwrap().remove(&EntityKey::new(kind, id));
        }
    }

    /// Assemble the result in the caller's requested order.
    fn collect(
        &self,
        kind: Kind,
        ids: &[i64],
        miss_policy: MissPolicy,
    ) -> Vec<(i64, Option<CacheEntry>)> {
        let store = self.store.lock().unwrap();
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            let entry = store
                .entry(kind, id)
                .filter(|e| !e.is_deleted)
                .cloned();
            match (entry, miss_policy) {
                (Some(entry), _) => out.push((id, Some(entry))),
                (None, MissPolicy::Null) => out.push((id, None)),
                (None, MissPolicy::Omit) => {}
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aria_common::Error;
    use futures::future::BoxFuture;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Source double: serves from a fixed table, records every batch,
    /// optionally delays to widen the in-flight window.
    struct MockSource {
        data: Mutex<HashMap<(Kind, i64), Value>>,
        batches: Mutex<Vec<Vec<i64>>>,
        calls: AtomicUsize,
        delay: Duration,
        fail_transport: std::sync::atomic::AtomicBool,
    }

    impl MockSource {
        fn new() -> Self {
            Self {
                data: Mutex::new(HashMap::new()),
                batches: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail_transport: std::sync::atomic::AtomicBool::new(false),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn insert(&self, kind: Kind, id: i64, metadata: Value) {
            self.data.lock().unwrap().insert((kind, id), metadata);
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RemoteSource for MockSource {
        fn get_by_ids(
            &self,
            kind: Kind,
            ids: Vec<i64>,
        ) -> BoxFuture<'_, aria_common::Result<Vec<Option<Value>>>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.batches.lock().unwrap().push(ids.clone());
                if self.delay > Duration::ZERO {
                    tokio::time::sleep(self.delay).await;
                }
                if self.fail_transport.load(Ordering::SeqCst) {
                    return Err(Error::TransientNetwork("connection reset".into()));
                }
                let data = self.data.lock().unwrap();
                Ok(ids.iter().map(|id| data.get(&(kind, *id)).cloned()).collect())
            })
        }

        fn create_entity(&self, _: Kind, _: i64, payload: Value) -> BoxFuture<'_, aria_common::Result<Value>> {
            Box::pin(async move { Ok(payload) })
        }

        fn update_entity(&self, _: Kind, _: i64, payload: Value) -> BoxFuture<'_, aria_common::Result<Value>> {
            Box::pin(async move { Ok(payload) })
        }

        fn delete_entity(&self, kind: Kind, id: i64) -> BoxFuture<'_, aria_common::Result<Value>> {
            Box::pin(async move { Ok(json!({"kind": kind.as_str(), "id": id, "deleted": true})) })
        }
    }

    async fn coordinator_with(
        source: Arc<MockSource>,
    ) -> (Arc<RetrievalCoordinator>, Arc<Mutex<CacheStore>>) {
        let config = CacheConfig::default();
        let store = Arc::new(Mutex::new(CacheStore::new()));
        let persist = Arc::new(
            PersistentCache::open(None, config.entry_ttl(), true).await,
        );
        let coordinator = Arc::new(RetrievalCoordinator::new(
            store.clone(),
            persist,
            source,
            &config,
        ));
        (coordinator, store)
    }

    #[tokio::test]
    async fn fetches_missing_ids_and_caches_them() {
        let source = Arc::new(MockSource::new());
        source.insert(Kind::Track, 1, json!({"title": "A"}));
        let (coordinator, store) = coordinator_with(source.clone()).await;

        let result = coordinator
            .get_or_fetch(Kind::Track, &[1], FetchOptions::new(MissPolicy::Null))
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].1.as_ref().unwrap().metadata["title"], json!("A"));

        // Second read is served from cache
        coordinator
            .get_or_fetch(Kind::Track, &[1], FetchOptions::new(MissPolicy::Null))
            .await
            .unwrap();
        assert_eq!(source.call_count(), 1);
        assert_eq!(store.lock().unwrap().len(Kind::Track), 1);
    }

    #[tokio::test]
    async fn single_batched_call_for_the_missing_subset() {
        let source = Arc::new(MockSource::new());
        for id in [1, 2, 3] {
            source.insert(Kind::Track, id, json!({"title": format!("t{id}")}));
        }
        let (coordinator, _) = coordinator_with(source.clone()).await;

        // Prime id 2 so it is cached-fresh
        coordinator
            .get_or_fetch(Kind::Track, &[2], FetchOptions::new(MissPolicy::Null))
            .await
            .unwrap();

        let result = coordinator
            .get_or_fetch(Kind::Track, &[1, 2, 3], FetchOptions::new(MissPolicy::Null))
            .await
            .unwrap();
        assert_eq!(result.iter().filter(|(_, e)| e.is_some()).count(), 3);

        let batches = source.batches.lock().unwrap().clone();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1], vec![1, 3]);
    }

    #[tokio::test]
    async fn concurrent_requests_for_same_id_share_one_call() {
        let source = Arc::new(MockSource::new().with_delay(Duration::from_millis(50)));
        source.insert(Kind::Track, 7, json!({"title": "shared"}));
        let (coordinator, _) = coordinator_with(source.clone()).await;

        let a = {
            let c = coordinator.clone();
            tokio::spawn(async move {
                c.get_or_fetch(Kind::Track, &[7], FetchOptions::new(MissPolicy::Null)).await
            })
        };
        let b = {
            let c = coordinator.clone();
            tokio::spawn(async move {
                c.get_or_fetch(Kind::Track, &[7], FetchOptions::new(MissPolicy::Null)).await
            })
        };

        let ra = a.await.unwrap().unwrap();
        let rb = b.await.unwrap().unwrap();
        assert_eq!(ra[0].1.as_ref().unwrap().metadata["title"], json!("shared"));
        assert_eq!(rb[0].1.as_ref().unwrap().metadata["title"], json!("shared"));
        assert_eq!(source.call_count(), 1);
    }

    #[tokio::test]
    async fn miss_policy_controls_unresolvable_ids() {
        let source = Arc::new(MockSource::new());
        source.insert(Kind::Track, 1, json!({"title": "A"}));
        let (coordinator, _) = coordinator_with(source.clone()).await;

        let nulls = coordinator
            .get_or_fetch(Kind::Track, &[1, 99], FetchOptions::new(MissPolicy::Null))
            .await
            .unwrap();
        assert_eq!(nulls.len(), 2);
        assert!(nulls[0].1.is_some());
        assert_eq!(nulls[1], (99, None));

        let omitted = coordinator
            .get_or_fetch(Kind::Track, &[1, 99], FetchOptions::new(MissPolicy::Omit))
            .await
            .unwrap();
        assert_eq!(omitted.len(), 1);
        assert_eq!(omitted[0].0, 1);
    }

    #[tokio::test]
    async fn tombstone_survives_refetch_until_cleared() {
        let source = Arc::new(MockSource::new());
        source.insert(Kind::Track, 1, json!({"title": "fresh from source"}));
        let (coordinator, store) = coordinator_with(source.clone()).await;

        coordinator
            .get_or_fetch(Kind::Track, &[1], FetchOptions::new(MissPolicy::Null))
            .await
            .unwrap();
        store.lock().unwrap().mark_deleted(Kind::Track, 1);

        let result = coordinator
            .get_or_fetch(Kind::Track, &[1], FetchOptions::bypassing_cache(MissPolicy::Null))
            .await
            .unwrap();
        // Refetched metadata landed, but the id still reads as deleted
        assert_eq!(result[0], (1, None));
        assert!(store.lock().unwrap().is_tombstoned(Kind::Track, 1));

        store.lock().unwrap().clear_tombstone(Kind::Track, 1);
        let result = coordinator
            .get_or_fetch(Kind::Track, &[1], FetchOptions::new(MissPolicy::Null))
            .await
            .unwrap();
        assert_eq!(
            result[0].1.as_ref().unwrap().metadata["title"],
            json!("fresh from source")
        );
    }

    #[tokio::test]
    async fn transport_failure_is_batch_wide() {
        let source = Arc::new(MockSource::new());
        source.fail_transport.store(true, Ordering::SeqCst);
        let (coordinator, _) = coordinator_with(source.clone()).await;

        let result = coordinator
            .get_or_fetch(Kind::Track, &[1, 2], FetchOptions::new(MissPolicy::Null))
            .await;
        assert!(matches!(result, Err(Error::TransientNetwork(_))));

        // Registry was cleaned up; a later call works again
        source.fail_transport.store(false, Ordering::SeqCst);
        source.insert(Kind::Track, 1, json!({"title": "A"}));
        let result = coordinator
            .get_or_fetch(Kind::Track, &[1], FetchOptions::new(MissPolicy::Null))
            .await
            .unwrap();
        assert!(result[0].1.is_some());
    }

    #[tokio::test]
    async fn ordered_result_follows_requested_order() {
        let source = Arc::new(MockSource::new());
        for id in [5, 3, 8] {
            source.insert(Kind::User, id, json!({"handle": format!("u{id}")}));
        }
        let (coordinator, _) = coordinator_with(source.clone()).await;

        let result = coordinator
            .get_or_fetch(Kind::User, &[8, 5, 3], FetchOptions::new(MissPolicy::Null))
            .await
            .unwrap();
        let order: Vec<i64> = result.iter().map(|(id, _)| *id).collect();
        assert_eq!(order, vec![8, 5, 3]);
    }
}
