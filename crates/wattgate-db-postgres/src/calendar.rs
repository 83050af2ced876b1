//! Calendar day rows.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_postgres::PgPool;
use tracing::{debug, instrument};
use wattgate_core::{CalendarDay, DayCategory, StorageResult};

use crate::error::{PostgresError, from_sqlx};

type CalendarRow = (NaiveDate, String, Option<DateTime<Utc>>, DateTime<Utc>);

fn from_row(row: CalendarRow) -> StorageResult<CalendarDay> {
    let (date, category, upstream_updated_at, updated_at) = row;
    let category: DayCategory = category
        .parse()
        .map_err(|e| PostgresError::invalid_row(format!("calendar_day {date}: {e}")))?;
    Ok(CalendarDay {
        date,
        category,
        upstream_updated_at,
        updated_at,
    })
}

/// Calendar queries bound to a borrowed pool.
pub struct CalendarStore<'a> {
    pool: &'a PgPool,
}

impl<'a> CalendarStore<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Upserts the batch inside one transaction.
    #[instrument(skip(self, days), fields(count = days.len()))]
    pub async fn upsert(&self, days: &[CalendarDay]) -> StorageResult<u64> {
        let mut tx = self.pool.begin().await.map_err(from_sqlx)?;
        let mut written = 0u64;

        for day in days {
            let result = query(
                r#"
                INSERT INTO calendar_day (day, category, upstream_updated_at, updated_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (day) DO UPDATE SET
                    category = EXCLUDED.category,
                    upstream_updated_at = EXCLUDED.upstream_updated_at,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(day.date)
            .bind(day.category.as_str())
            .bind(day.upstream_updated_at)
            .bind(day.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(from_sqlx)?;
            written += result.rows_affected();
        }

        tx.commit().await.map_err(from_sqlx)?;
        debug!(written, "Calendar batch committed");
        Ok(written)
    }

    #[instrument(skip(self))]
    pub async fn get(&self, date: NaiveDate) -> StorageResult<Option<CalendarDay>> {
        let row: Option<CalendarRow> = query_as(
            "SELECT day, category, upstream_updated_at, updated_at FROM calendar_day WHERE day = $1",
        )
        .bind(date)
        .fetch_optional(self.pool)
        .await
        .map_err(from_sqlx)?;

        row.map(from_row).transpose()
    }

    #[instrument(skip(self))]
    pub async fn list(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> StorageResult<Vec<CalendarDay>> {
        let rows: Vec<CalendarRow> = query_as(
            r#"
            SELECT day, category, upstream_updated_at, updated_at
            FROM calendar_day
            WHERE ($1::date IS NULL OR day >= $1)
              AND ($2::date IS NULL OR day <= $2)
            ORDER BY day
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(self.pool)
        .await
        .map_err(from_sqlx)?;

        rows.into_iter().map(from_row).collect()
    }
}
