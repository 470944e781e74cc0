//! Reference resolution
//!
//! Post-fetch denormalization: attaches the owning user to tracks and
//! collections, and the contained track list to collections. Attached
//! values are copies; the cache never stores foreign keys inside an
//! entry. Resolution degrades gracefully: an unresolvable reference is
//! dropped (with a log line), never a failed read.

use crate::retrieve::{FetchOptions, MissPolicy, RetrievalCoordinator};
use aria_common::kind::Relation;
use aria_common::{CacheEntry, Kind, UidAllocator};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub struct ReferenceResolver {
    coordinator: Arc<RetrievalCoordinator>,
    uids: Arc<UidAllocator>,
}

impl ReferenceResolver {
    pub fn new(coordinator: Arc<RetrievalCoordinator>, uids: Arc<UidAllocator>) -> Self {
        Self { coordinator, uids }
    }

    /// Attach denormalized relations to every entry, per its kind's
    /// strategy. Owner users land under `user`; collection contents land
    /// under `tracks`, each occurrence with its own UID so the same
    /// track id can sit in several lists at once.
    pub async fn resolve(&self, entries: &mut [CacheEntry]) {
        let owners = self.resolve_owners(entries).await;

        for entry in entries.iter_mut() {
            let strategy = entry.kind.strategy();
            for relation in strategy.relations {
                match relation {
                    Relation::Owner => {
                        let owner_id = strategy
                            .owner_field
                            .and_then(|field| entry.metadata.get(field))
                            .and_then(Value::as_i64);
                        if let Some(owner_id) = owner_id {
                            if let Some(user) = owners.get(&owner_id) {
                                entry.metadata["user"] = user.metadata.clone();
                            } else {
                                tracing::debug!(
                                    kind = %entry.kind,
                                    id = entry.id,
                                    owner_id,
                                    "Owner unresolvable, leaving entry bare"
                                );
                            }
                        }
                    }
                    Relation::Contents => {
                        // A non-object metadata value has nowhere to
                        // hang the list; skip instead of panicking in
                        // the index assignment
                        if !entry.metadata.is_object() {
                            tracing::debug!(
                                kind = %entry.kind,
                                id = entry.id,
                                "Non-object metadata, skipping contents attach"
                            );
                            continue;
                        }
                        let tracks = self.resolve_contents(entry).await;
                        entry.metadata["tracks"] = Value::Array(tracks);
                    }
                }
            }
        }
    }

    /// One batched user fetch for every owner id the entries mention.
    async fn resolve_owners(&self, entries: &[CacheEntry]) -> HashMap<i64, CacheEntry> {
        let mut owner_ids: Vec<i64> = Vec::new();
        for entry in entries {
            let strategy = entry.kind.strategy();
            if let Some(field) = strategy.owner_field {
                if let Some(id) = entry.metadata.get(field).and_then(Value::as_i64) {
                    if !owner_ids.contains(&id) {
                        owner_ids.push(id);
                    }
                }
            }
        }
        if owner_ids.is_empty() {
            return HashMap::new();
        }
        match self
            .coordinator
            .get_or_fetch(Kind::User, &owner_ids, FetchOptions::new(MissPolicy::Omit))
            .await
        {
            Ok(resolved) => resolved
                .into_iter()
                .filter_map(|(id, entry)| entry.map(|e| (id, e)))
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Owner resolution degraded, leaving entries bare");
                HashMap::new()
            }
        }
    }

    /// Resolve a collection's contained tracks in list order. A
    /// contained id the source does not know is dropped from the list
    /// rather than failing the collection.
    async fn resolve_contents(&self, entry: &CacheEntry) -> Vec<Value> {
        let strategy = entry.kind.strategy();
        let Some(field) = strategy.contents_field else {
            return Vec::new();
        };
        let id_key = strategy.dedup_key(field).unwrap_or("track");
        let contained_ids: Vec<i64> = entry
            .metadata
            .get(field)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| match item {
                        Value::Object(obj) => obj.get(id_key).and_then(Value::as_i64),
                        other => other.as_i64(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        if contained_ids.is_empty() {
            return Vec::new();
        }

        let mut unique = contained_ids.clone();
        unique.sort_unstable();
        unique.dedup();
        let resolved: HashMap<i64, CacheEntry> = match self
            .coordinator
            .get_or_fetch(Kind::Track, &unique, FetchOptions::new(MissPolicy::Omit))
            .await
        {
            Ok(entries) => entries
                .into_iter()
                .filter_map(|(id, entry)| entry.map(|e| (id, e)))
                .collect(),
            Err(e) => {
                tracing::warn!(
                    collection = entry.id,
                    error = %e,
                    "Contents resolution degraded to empty"
                );
                return Vec::new();
            }
        };

        // Preserve list order and multiplicity; each occurrence gets its
        // own UID
        contained_ids
            .iter()
            .filter_map(|id| {
                let track = match resolved.get(id) {
                    Some(track) => track,
                    None => {
                        tracing::debug!(
                            collection = entry.id,
                            track = id,
                            "Dropping unresolvable contained track"
                        );
                        return None;
                    }
                };
                let mut metadata = track.metadata.clone();
                metadata["uid"] = json!(self.uids.allocate(Kind::Track, *id).as_str());
                Some(metadata)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::PersistentCache;
    use crate::source::RemoteSource;
    use crate::store::CacheStore;
    use aria_common::config::CacheConfig;
    use futures::future::BoxFuture;
    use serde_json::json;
    use std::sync::Mutex;

    struct TableSource {
        data: Mutex<HashMap<(Kind, i64), Value>>,
    }

    impl TableSource {
        fn new() -> Self {
            Self { data: Mutex::new(HashMap::new()) }
        }

        fn insert(&self, kind: Kind, id: i64, metadata: Value) {
            self.data.lock().unwrap().insert((kind, id), metadata);
        }
    }

    impl RemoteSource for TableSource {
        fn get_by_ids(
            &self,
            kind: Kind,
            ids: Vec<i64>,
        ) -> BoxFuture<'_, aria_common::Result<Vec<Option<Value>>>> {
            Box::pin(async move {
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

        fn delete_entity(&self, _: Kind, id: i64) -> BoxFuture<'_, aria_common::Result<Value>> {
            Box::pin(async move { Ok(json!({"id": id})) })
        }
    }

    async fn resolver_with(source: Arc<TableSource>) -> ReferenceResolver {
        let config = CacheConfig::default();
        let store = Arc::new(Mutex::new(CacheStore::new()));
        let persist = Arc::new(PersistentCache::open(None, config.entry_ttl(), true).await);
        let coordinator = Arc::new(RetrievalCoordinator::new(store, persist, source, &config));
        ReferenceResolver::new(coordinator, Arc::new(UidAllocator::new()))
    }

    #[tokio::test]
    async fn attaches_owner_to_track() {
        let source = Arc::new(TableSource::new());
        source.insert(Kind::User, 4, json!({"user_id": 4, "handle": "ray"}));
        let resolver = resolver_with(source).await;

        let mut entries = vec![CacheEntry::new(
            Kind::Track,
            1,
            json!({"track_id": 1, "title": "A", "owner_id": 4}),
        )];
        resolver.resolve(&mut entries).await;

        assert_eq!(entries[0].metadata["user"]["handle"], json!("ray"));
    }

    #[tokio::test]
    async fn collection_contents_resolved_in_order_with_uids() {
        let source = Arc::new(TableSource::new());
        source.insert(Kind::User, 4, json!({"user_id": 4, "handle": "ray"}));
        source.insert(Kind::Track, 1, json!({"track_id": 1, "title": "A"}));
        source.insert(Kind::Track, 2, json!({"track_id": 2, "title": "B"}));
        let resolver = resolver_with(source).await;

        let mut entries = vec![CacheEntry::new(
            Kind::Collection,
            9,
            json!({
                "playlist_id": 9,
                "playlist_owner_id": 4,
                "track_ids": [{"track": 2, "time": 10}, {"track": 1, "time": 11}]
            }),
        )];
        resolver.resolve(&mut entries).await;

        let tracks = entries[0].metadata["tracks"].as_array().unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0]["title"], json!("B"));
        assert_eq!(tracks[1]["title"], json!("A"));
        assert_eq!(entries[0].metadata["user"]["handle"], json!("ray"));
    }

    #[tokio::test]
    async fn unresolvable_contained_track_dropped_not_fatal() {
        let source = Arc::new(TableSource::new());
        source.insert(Kind::Track, 1, json!({"track_id": 1, "title": "A"}));
        let resolver = resolver_with(source).await;

        let mut entries = vec![CacheEntry::new(
            Kind::Collection,
            9,
            json!({
                "playlist_id": 9,
                "track_ids": [{"track": 1, "time": 10}, {"track": 404, "time": 11}]
            }),
        )];
        resolver.resolve(&mut entries).await;

        let tracks = entries[0].metadata["tracks"].as_array().unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0]["title"], json!("A"));
    }

    #[tokio::test]
    async fn same_track_in_two_collections_gets_distinct_uids() {
        let source = Arc::new(TableSource::new());
        source.insert(Kind::Track, 1, json!({"track_id": 1, "title": "A"}));
        let resolver = resolver_with(source).await;

        let mut entries = vec![
            CacheEntry::new(
                Kind::Collection,
                9,
                json!({"playlist_id": 9, "track_ids": [{"track": 1, "time": 1}]}),
            ),
            CacheEntry::new(
                Kind::Collection,
                10,
                json!({"playlist_id": 10, "track_ids": [{"track": 1, "time": 2}]}),
            ),
        ];
        resolver.resolve(&mut entries).await;

        let uid_a = entries[0].metadata["tracks"][0]["uid"].clone();
        let uid_b = entries[1].metadata["tracks"][0]["uid"].clone();
        assert_ne!(uid_a, uid_b);
    }

    #[tokio::test]
    async fn non_object_collection_metadata_left_untouched() {
        let source = Arc::new(TableSource::new());
        let resolver = resolver_with(source).await;

        let mut entries = vec![CacheEntry::new(Kind::Collection, 9, json!("bogus"))];
        resolver.resolve(&mut entries).await;
        assert_eq!(entries[0].metadata, json!("bogus"));
    }

    #[tokio::test]
    async fn users_pass_through_untouched() {
        let source = Arc::new(TableSource::new());
        let resolver = resolver_with(source).await;

        let before = json!({"user_id": 4, "handle": "ray"});
        let mut entries = vec![CacheEntry::new(Kind::User, 4, before.clone())];
        resolver.resolve(&mut entries).await;
        assert_eq!(entries[0].metadata, before);
    }
}
