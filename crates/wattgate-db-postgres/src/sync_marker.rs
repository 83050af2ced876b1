//! Sync marker rows.

use chrono::{DateTime, Utc};
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_postgres::PgPool;
use tracing::instrument;
use wattgate_core::{StorageResult, SyncMarker};

use crate::error::from_sqlx;

pub struct SyncMarkerStore<'a> {
    pool: &'a PgPool,
}

impl<'a> SyncMarkerStore<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self))]
    pub async fn get(&self, source: &str) -> StorageResult<Option<SyncMarker>> {
        let row: Option<(String, DateTime<Utc>)> =
            query_as("SELECT source, last_success_at FROM sync_marker WHERE source = $1")
                .bind(source)
                .fetch_optional(self.pool)
                .await
                .map_err(from_sqlx)?;

        Ok(row.map(|(source, last_success_at)| SyncMarker {
            source,
            last_success_at,
        }))
    }

    #[instrument(skip(self))]
    pub async fn set(&self, source: &str, at: DateTime<Utc>) -> StorageResult<()> {
        query(
            r#"
            INSERT INTO sync_marker (source, last_success_at)
            VALUES ($1, $2)
            ON CONFLICT (source) DO UPDATE SET last_success_at = EXCLUDED.last_success_at
            "#,
        )
        .bind(source)
        .bind(at)
        .execute(self.pool)
        .await
        .map_err(from_sqlx)?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn clear(&self, source: &str) -> StorageResult<()> {
        query("DELETE FROM sync_marker WHERE source = $1")
            .bind(source)
            .execute(self.pool)
            .await
            .map_err(from_sqlx)?;
        Ok(())
    }
}
