//! # Aria Cache
//!
//! Client-side entity cache with an optimistic-write/confirmation
//! protocol. Local copies of tracks, collections, and users are served
//! from two tiers (in-memory [`store::CacheStore`], sqlite-backed
//! [`persist::PersistentCache`]) and kept synchronized with an
//! authoritative remote source. Mutations apply instantly to the local
//! view while a matching remote write is confirmed, retried, or rolled
//! back in the background.
//!
//! Entry point is [`session::CacheSession`], constructed once per login
//! session; everything else hangs off it.

pub mod confirm;
pub mod persist;
pub mod resolve;
pub mod retrieve;
pub mod session;
pub mod source;
pub mod store;

pub use confirm::{ConfirmError, Confirmation, ConfirmationQueue};
pub use persist::PersistentCache;
pub use resolve::ReferenceResolver;
pub use retrieve::{FetchOptions, MissPolicy, RetrievalCoordinator};
pub use session::{CacheSession, Command, CommandError, CommandReply, Operation, PersistMode};
pub use source::{HttpSource, RemoteSource};
pub use store::{CacheStore, NewEntry};
