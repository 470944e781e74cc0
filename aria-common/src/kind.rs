//! Entity kind discriminant and per-kind strategy tables

use serde::{Deserialize, Serialize};
use std::fmt;

/// Entity category discriminant.
///
/// Every cached entity belongs to exactly one kind; the two cache tiers
/// key their entries by `(Kind, id)` so an id can never map to two kinds
/// within the same store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    Track,
    Collection,
    User,
}

impl Kind {
    pub const ALL: [Kind; 3] = [Kind::Track, Kind::Collection, Kind::User];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Track => "Track",
            Kind::Collection => "Collection",
            Kind::User => "User",
        }
    }

    /// Parse the string form produced by [`Kind::as_str`].
    pub fn parse(s: &str) -> Option<Kind> {
        match s {
            "Track" => Some(Kind::Track),
            "Collection" => Some(Kind::Collection),
            "User" => Some(Kind::User),
            _ => None,
        }
    }

    /// Per-kind merge/relation strategy.
    pub fn strategy(&self) -> &'static KindStrategy {
        match self {
            Kind::Track => &TRACK_STRATEGY,
            Kind::Collection => &COLLECTION_STRATEGY,
            Kind::User => &USER_STRATEGY,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relation from one entity kind to another, resolved at read time and
/// attached as a denormalized copy (never stored as a foreign key).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// Owning user, read from `owner_field`, attached as `user`.
    Owner,
    /// Contained track list, read from `contents_field`, attached as `tracks`.
    Contents,
}

/// Static per-kind strategy: which metadata field carries the entity id,
/// how array fields de-duplicate on merge, and which relations the
/// resolver attaches.
pub struct KindStrategy {
    /// Metadata field holding the entity's own id.
    pub id_field: &'static str,
    /// Metadata field naming the owning user id, if any.
    pub owner_field: Option<&'static str>,
    /// Metadata field holding the contained-entry array, if any.
    pub contents_field: Option<&'static str>,
    /// `(array_field, dedup_key)` pairs for the merge customizer.
    pub list_merge_keys: &'static [(&'static str, &'static str)],
    /// Relations attached by the reference resolver.
    pub relations: &'static [Relation],
}

impl KindStrategy {
    /// Dedup key for an array-valued metadata field, if configured.
    pub fn dedup_key(&self, field: &str) -> Option<&'static str> {
        self.list_merge_keys
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, k)| *k)
    }
}

static TRACK_STRATEGY: KindStrategy = KindStrategy {
    id_field: "track_id",
    owner_field: Some("owner_id"),
    contents_field: None,
    list_merge_keys: &[],
    relations: &[Relation::Owner],
};

static COLLECTION_STRATEGY: KindStrategy = KindStrategy {
    id_field: "playlist_id",
    owner_field: Some("playlist_owner_id"),
    contents_field: Some("track_ids"),
    list_merge_keys: &[("track_ids", "track")],
    relations: &[Relation::Owner, Relation::Contents],
};

static USER_STRATEGY: KindStrategy = KindStrategy {
    id_field: "user_id",
    owner_field: None,
    contents_field: None,
    list_merge_keys: &[],
    relations: &[],
};
