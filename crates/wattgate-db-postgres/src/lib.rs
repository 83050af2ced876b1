//! PostgreSQL storage backend for wattgate.
//!
//! Provides durable storage for:
//!
//! - the shared upstream credential (`shared_credential`)
//! - grid operator day classifications (`calendar_day`)
//! - per-source sync markers (`sync_marker`)
//!
//! # Example
//!
//! ```ignore
//! use wattgate_db_postgres::{PostgresConfig, PostgresStorage};
//!
//! let storage = PostgresStorage::connect(&PostgresConfig::new("postgres://localhost/wattgate")).await?;
//! let today = storage.calendar().get(chrono::Utc::now().date_naive()).await?;
//! ```

pub mod calendar;
pub mod config;
pub mod credential;
pub mod error;
pub mod migrations;
pub mod pool;
pub mod sync_marker;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx_postgres::PgPool;
use tracing::info;
use wattgate_core::{
    CalendarDay, CalendarStorage, Credential, CredentialStorage, NewCredential, StorageResult,
    SyncMarker, SyncMarkerStorage,
};

pub use calendar::CalendarStore;
pub use config::PostgresConfig;
pub use credential::CredentialStore;
pub use error::{PostgresError, Result};
pub use pool::{create_pool, mask_password};
pub use sync_marker::SyncMarkerStore;

/// Postgres-backed implementation of every wattgate storage trait.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: Arc<PgPool>,
}

impl PostgresStorage {
    /// Creates the pool and, when configured, applies migrations.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let pool = create_pool(config).await?;
        if config.run_migrations {
            migrations::run(&pool).await?;
        } else {
            info!("Skipping database migrations (run_migrations = false)");
        }
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn credentials(&self) -> CredentialStore<'_> {
        CredentialStore::new(&self.pool)
    }

    pub fn calendar(&self) -> CalendarStore<'_> {
        CalendarStore::new(&self.pool)
    }

    pub fn markers(&self) -> SyncMarkerStore<'_> {
        SyncMarkerStore::new(&self.pool)
    }
}

#[async_trait]
impl CredentialStorage for PostgresStorage {
    async fn find_credential(&self, scope: &str) -> StorageResult<Option<Credential>> {
        self.credentials().find(scope).await
    }

    async fn insert_credential(&self, credential: &NewCredential) -> StorageResult<Credential> {
        self.credentials().insert(credential).await
    }

    async fn replace_credential(
        &self,
        expected_expires_at: DateTime<Utc>,
        credential: &NewCredential,
    ) -> StorageResult<Option<Credential>> {
        self.credentials()
            .replace(expected_expires_at, credential)
            .await
    }
}

#[async_trait]
impl CalendarStorage for PostgresStorage {
    async fn upsert_days(&self, days: &[CalendarDay]) -> StorageResult<u64> {
        self.calendar().upsert(days).await
    }

    async fn get_day(&self, date: NaiveDate) -> StorageResult<Option<CalendarDay>> {
        self.calendar().get(date).await
    }

    async fn list_days(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> StorageResult<Vec<CalendarDay>> {
        self.calendar().list(start, end).await
    }
}

#[async_trait]
impl SyncMarkerStorage for PostgresStorage {
    async fn get_marker(&self, source: &str) -> StorageResult<Option<SyncMarker>> {
        self.markers().get(source).await
    }

    async fn set_marker(&self, source: &str, at: DateTime<Utc>) -> StorageResult<()> {
        self.markers().set(source, at).await
    }

    async fn clear_marker(&self, source: &str) -> StorageResult<()> {
        self.markers().clear(source).await
    }
}
