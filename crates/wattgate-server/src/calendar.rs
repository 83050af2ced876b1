//! Read-only access to synchronized calendar days.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use wattgate_core::{CalendarDay, DynCalendarStorage, StorageResult};

/// Calendar lookups in the feed's local timezone.
#[derive(Clone)]
pub struct CalendarView {
    storage: DynCalendarStorage,
    timezone: Tz,
}

impl CalendarView {
    pub fn new(storage: DynCalendarStorage, timezone: Tz) -> Self {
        Self { storage, timezone }
    }

    pub async fn get_day(&self, date: NaiveDate) -> StorageResult<Option<CalendarDay>> {
        self.storage.get_day(date).await
    }

    /// Days in `[start, end]`, ordered by date.
    pub async fn list_days(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> StorageResult<Vec<CalendarDay>> {
        self.storage.list_days(start, end).await
    }

    /// Local date at `now`.
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.timezone).date_naive()
    }

    /// Classification of the current local day, if already synchronized.
    pub async fn today(&self) -> StorageResult<Option<CalendarDay>> {
        self.get_day(self.local_date(Utc::now())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Europe::Paris;
    use std::sync::Arc;
    use wattgate_core::{CalendarStorage, DayCategory};
    use wattgate_db_memory::InMemoryStorage;

    #[test]
    fn test_local_date_crosses_midnight_before_utc() {
        let view = CalendarView::new(Arc::new(InMemoryStorage::new()), Paris);
        // 23:30 UTC is already the next day in Paris
        let now = Utc.with_ymd_and_hms(2024, 1, 14, 23, 30, 0).unwrap();
        assert_eq!(view.local_date(now), NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
    }

    #[tokio::test]
    async fn test_today_reads_local_date() {
        let storage = Arc::new(InMemoryStorage::new());
        let view = CalendarView::new(storage.clone(), Paris);
        let today = view.local_date(Utc::now());

        assert!(view.today().await.unwrap().is_none());

        storage
            .upsert_days(&[CalendarDay {
                date: today,
                category: DayCategory::Blue,
                upstream_updated_at: None,
                updated_at: Utc::now(),
            }])
            .await
            .unwrap();
        assert_eq!(view.today().await.unwrap().unwrap().category, DayCategory::Blue);
        assert_eq!(view.list_days(Some(today), Some(today)).await.unwrap().len(), 1);
    }
}
