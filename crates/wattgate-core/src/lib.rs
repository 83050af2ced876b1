//! # wattgate-core
//!
//! Domain types and storage abstractions shared by the wattgate crates.
//!
//! This crate defines the durable records the gateway keeps (the shared
//! machine credential, calendar day classifications and sync markers) and the
//! traits that storage backends implement for them. It does not contain any
//! implementations - those live in `wattgate-db-memory` and
//! `wattgate-db-postgres`.
//!
//! ## Example
//!
//! ```ignore
//! use wattgate_core::{CalendarStorage, StorageError};
//!
//! async fn red_days(storage: &dyn CalendarStorage) -> Result<usize, StorageError> {
//!     let days = storage.list_days(None, None).await?;
//!     Ok(days.iter().filter(|d| d.category.is_red()).count())
//! }
//! ```

mod error;
mod traits;
mod types;

pub use error::{ErrorCategory, StorageError};
pub use traits::{CalendarStorage, CredentialStorage, SyncMarkerStorage};
pub use types::{
    CalendarDay, Credential, DayCategory, NewCredential, SHARED_HOLDER, SyncMarker,
    UnknownCategory,
};

/// Type alias for a storage result.
pub type StorageResult<T> = Result<T, StorageError>;

/// Shareable credential storage.
pub type DynCredentialStorage = std::sync::Arc<dyn CredentialStorage>;

/// Shareable calendar storage.
pub type DynCalendarStorage = std::sync::Arc<dyn CalendarStorage>;

/// Shareable sync marker storage.
pub type DynSyncMarkerStorage = std::sync::Arc<dyn SyncMarkerStorage>;
