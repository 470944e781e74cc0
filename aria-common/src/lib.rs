//! # Aria Common Library
//!
//! Shared code for the Aria entity cache:
//! - Entity model (Kind, CacheEntry, EntityKey)
//! - Merge customizer shared by both cache tiers
//! - UID allocation for per-occurrence references
//! - Error types
//! - Configuration loading

pub mod config;
pub mod entry;
pub mod error;
pub mod kind;
pub mod merge;
pub mod uid;

pub use entry::{CacheEntry, EntityKey, Freshness};
pub use error::{Error, Result};
pub use kind::Kind;
pub use uid::{Uid, UidAllocator};
