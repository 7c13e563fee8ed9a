//! Versioned response cache.
//!
//! This module provides the durable key→response store the strategy router
//! reads and writes:
//! - One namespace per cache version, garbage-collected on activation
//! - Only successful (2xx) responses are admitted
//! - Writes for the same request key are serialized
//! - Storage failures degrade to cache misses

mod key;
mod storage;
mod store;
mod types;

pub use key::RequestKey;
pub use storage::{CacheStorage, SqliteStorage};
pub(crate) use storage::{format_datetime, parse_datetime};
pub use store::{ActiveVersion, CacheHandle, CacheStore};
pub use types::{CacheEntry, CacheError, CacheVersion};
