//! In-memory storage backend for wattgate.
//!
//! Implements every `wattgate-core` storage trait on process-local maps. Used
//! for single-instance deployments without Postgres and throughout the test
//! suites.
//!
//! # Example
//!
//! ```ignore
//! use wattgate_db_memory::InMemoryStorage;
//! use wattgate_core::SyncMarkerStorage;
//!
//! let storage = InMemoryStorage::new();
//! storage.set_marker("calendar.near_term", chrono::Utc::now()).await?;
//! ```

mod storage;

pub use storage::InMemoryStorage;
pub use wattgate_core::{StorageError, StorageResult};

/// Creates a new shared in-memory storage.
pub fn create_storage() -> std::sync::Arc<InMemoryStorage> {
    std::sync::Arc::new(InMemoryStorage::new())
}
