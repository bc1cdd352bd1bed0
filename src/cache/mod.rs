//! Versioned cache buckets for offline support.
//!
//! This module provides the host-managed key-value store the agent caches into:
//! - Named buckets, one per deployed agent version
//! - Entries keyed by request identity (method + URL), GET only
//! - Atomic single-entry puts and all-or-nothing batch puts

mod storage;
mod traits;

#[cfg(test)]
pub use storage::MemoryStorage;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CachedEntry, CachedResponse, Request, Response, ResponseType};
