//! Storage traits implemented by the memory and Postgres backends.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::StorageResult;
use crate::types::{CalendarDay, Credential, NewCredential, SyncMarker};

/// Storage for the shared upstream credential.
///
/// At most one row exists per scope. The backend's uniqueness constraint is the
/// arbiter when several callers try to create the row at once.
#[async_trait]
pub trait CredentialStorage: Send + Sync {
    /// Returns the shared credential for `scope`, valid or not.
    async fn find_credential(&self, scope: &str) -> StorageResult<Option<Credential>>;

    /// Inserts the shared credential for a scope that has none yet.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::AlreadyExists` if another writer created the row
    /// first. Callers are expected to re-read and use the winner's token.
    async fn insert_credential(&self, credential: &NewCredential) -> StorageResult<Credential>;

    /// Replaces every field of the existing row, but only if its expiry still
    /// equals `expected_expires_at`.
    ///
    /// Returns `None` when the row changed underneath (another writer replaced
    /// it first) or no longer exists.
    async fn replace_credential(
        &self,
        expected_expires_at: DateTime<Utc>,
        credential: &NewCredential,
    ) -> StorageResult<Option<Credential>>;
}

/// Storage for calendar day classifications.
#[async_trait]
pub trait CalendarStorage: Send + Sync {
    /// Inserts or overwrites the given days as one atomic batch.
    ///
    /// Category, upstream timestamp and local update timestamp are replaced on
    /// conflict. Returns the number of rows written.
    async fn upsert_days(&self, days: &[CalendarDay]) -> StorageResult<u64>;

    /// Returns the classification of one date.
    async fn get_day(&self, date: NaiveDate) -> StorageResult<Option<CalendarDay>>;

    /// Lists days in `[start, end]` (both inclusive, either bound optional),
    /// ordered by date.
    async fn list_days(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> StorageResult<Vec<CalendarDay>>;
}

/// Storage for per-source "last successful cycle" markers.
#[async_trait]
pub trait SyncMarkerStorage: Send + Sync {
    async fn get_marker(&self, source: &str) -> StorageResult<Option<SyncMarker>>;

    /// Creates or moves the marker for `source`.
    async fn set_marker(&self, source: &str, at: DateTime<Utc>) -> StorageResult<()>;

    /// Removes the marker. Removing a missing marker is not an error.
    async fn clear_marker(&self, source: &str) -> StorageResult<()>;
}
