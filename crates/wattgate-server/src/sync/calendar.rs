//! Calendar synchronization jobs.
//!
//! - [`NearTermJob`]: yesterday through today, extended to tomorrow once the
//!   local cut-over hour has passed (the next day is not published earlier).
//! - [`BackfillJob`]: the historical range, fetched oldest first in bounded
//!   chunks. Each chunk is committed on its own and recorded in a checkpoint
//!   marker so a failed run resumes where it stopped.
//!
//! Each upstream entry is keyed by the local date of its interval's *end*
//! boundary.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Days, FixedOffset, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use tracing::{debug, info, warn};
use wattgate_core::{CalendarDay, DayCategory, DynCalendarStorage, DynSyncMarkerStorage};

use super::{SyncError, SyncJob};
use crate::config::{CalendarConfig, SyncConfig};
use crate::upstream::{CalendarEntry, CalendarSource};

pub const NEAR_TERM_SOURCE: &str = "calendar.near_term";
pub const BACKFILL_SOURCE: &str = "calendar.backfill";
/// End boundary of the last committed backfill chunk.
pub const BACKFILL_CHECKPOINT: &str = "calendar.backfill.checkpoint";

/// Days per backfill year, so that leap years are covered.
const DAYS_PER_YEAR: u64 = 366;

#[derive(Debug, Clone)]
pub struct CalendarSyncSettings {
    pub timezone: Tz,
    pub cutover_hour: u32,
    pub near_term_interval: Duration,
    pub near_term_min_interval: chrono::Duration,
    pub backfill_interval: Duration,
    pub backfill_min_interval: chrono::Duration,
    pub backfill_years: u32,
    pub backfill_chunk_days: u32,
}

impl CalendarSyncSettings {
    pub fn from_config(calendar: &CalendarConfig, sync: &SyncConfig) -> Result<Self, String> {
        let timezone = calendar
            .timezone
            .parse::<Tz>()
            .map_err(|e| format!("calendar.timezone: {e}"))?;
        Ok(Self {
            timezone,
            cutover_hour: calendar.cutover_hour,
            near_term_interval: Duration::from_secs(sync.near_term_interval_secs),
            near_term_min_interval: seconds(
                "sync.near_term_min_interval_secs",
                sync.near_term_min_interval_secs,
            )?,
            backfill_interval: Duration::from_secs(sync.backfill_interval_secs),
            backfill_min_interval: seconds(
                "sync.backfill_min_interval_secs",
                sync.backfill_min_interval_secs,
            )?,
            backfill_years: sync.backfill_years,
            backfill_chunk_days: sync.backfill_chunk_days.max(1),
        })
    }
}

fn seconds(name: &str, secs: u64) -> Result<chrono::Duration, String> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(|| format!("{name}: {secs} seconds is out of range"))
}

// ============================================================================
// Parsing
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum EntryError {
    #[error("bad end_date '{value}': {source}")]
    EndDate {
        value: String,
        source: chrono::ParseError,
    },

    #[error(transparent)]
    Category(#[from] wattgate_core::UnknownCategory),
}

/// Converts one upstream entry into a calendar row written at `now`.
pub fn parse_entry(entry: &CalendarEntry, now: DateTime<Utc>) -> Result<CalendarDay, EntryError> {
    let end = DateTime::<FixedOffset>::parse_from_rfc3339(&entry.end_date).map_err(|source| {
        EntryError::EndDate {
            value: entry.end_date.clone(),
            source,
        }
    })?;
    let category: DayCategory = entry.value.parse()?;

    let upstream_updated_at = match entry.updated_date.as_deref() {
        None => None,
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(at) => Some(at.with_timezone(&Utc)),
            Err(e) => {
                debug!(updated_date = raw, error = %e, "ignoring unparsable updated_date");
                None
            }
        },
    };

    Ok(CalendarDay {
        date: end.date_naive(),
        category,
        upstream_updated_at,
        updated_at: now,
    })
}

/// Parses a batch, skipping malformed entries. Later entries win on a
/// duplicate date.
pub fn parse_entries(entries: &[CalendarEntry], now: DateTime<Utc>) -> Vec<CalendarDay> {
    let mut by_date = BTreeMap::new();
    for entry in entries {
        match parse_entry(entry, now) {
            Ok(day) => {
                by_date.insert(day.date, day);
            }
            Err(e) => warn!(error = %e, "skipping calendar entry"),
        }
    }
    by_date.into_values().collect()
}

// ============================================================================
// Windows
// ============================================================================

fn local_at(tz: Tz, date: NaiveDate, time: NaiveTime) -> Result<DateTime<Tz>, SyncError> {
    tz.from_local_datetime(&date.and_time(time))
        .earliest()
        .ok_or_else(|| SyncError::Window(format!("{date} {time} does not exist in {tz}")))
}

fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN)
}

/// Near-term fetch window for `now`: yesterday 00:00 through today 23:59:59
/// local time, or through tomorrow 23:59:59 once `cutover_hour` has passed.
pub fn near_term_window(
    now: DateTime<Utc>,
    tz: Tz,
    cutover_hour: u32,
) -> Result<(DateTime<Tz>, DateTime<Tz>), SyncError> {
    let local = now.with_timezone(&tz);
    let today = local.date_naive();
    let window_err = || SyncError::Window(format!("date arithmetic overflow near {today}"));

    let yesterday = today.checked_sub_days(Days::new(1)).ok_or_else(window_err)?;
    let last_day = if local.hour() >= cutover_hour {
        today.checked_add_days(Days::new(1)).ok_or_else(window_err)?
    } else {
        today
    };

    Ok((
        local_at(tz, yesterday, NaiveTime::MIN)?,
        local_at(tz, last_day, end_of_day())?,
    ))
}

/// Backfill chunks as `[start, end)` date pairs, oldest first, ending at
/// `today`. Starts at `resume_from` when it lies inside the range.
pub fn backfill_chunks(
    today: NaiveDate,
    years: u32,
    chunk_days: u32,
    resume_from: Option<NaiveDate>,
) -> Vec<(NaiveDate, NaiveDate)> {
    let span = Days::new(u64::from(years) * DAYS_PER_YEAR);
    let Some(origin) = today.checked_sub_days(span) else {
        return Vec::new();
    };

    let mut start = resume_from.map_or(origin, |d| d.max(origin));
    let mut chunks = Vec::new();
    while start < today {
        let end = start
            .checked_add_days(Days::new(u64::from(chunk_days.max(1))))
            .map_or(today, |d| d.min(today));
        chunks.push((start, end));
        start = end;
    }
    chunks
}

async fn sync_range(
    source: &dyn CalendarSource,
    storage: &DynCalendarStorage,
    start: DateTime<Tz>,
    end: DateTime<Tz>,
    now: DateTime<Utc>,
) -> Result<u64, SyncError> {
    let entries = source.fetch_range(start, end).await?;
    let days = parse_entries(&entries, now);
    if days.is_empty() {
        debug!(received = entries.len(), "no usable calendar entries in range");
        return Ok(0);
    }
    Ok(storage.upsert_days(&days).await?)
}

// ============================================================================
// Jobs
// ============================================================================

pub struct NearTermJob {
    source: Arc<dyn CalendarSource>,
    storage: DynCalendarStorage,
    settings: CalendarSyncSettings,
}

impl NearTermJob {
    pub fn new(
        source: Arc<dyn CalendarSource>,
        storage: DynCalendarStorage,
        settings: CalendarSyncSettings,
    ) -> Self {
        Self {
            source,
            storage,
            settings,
        }
    }
}

#[async_trait]
impl SyncJob for NearTermJob {
    fn name(&self) -> &str {
        NEAR_TERM_SOURCE
    }

    fn min_interval(&self) -> chrono::Duration {
        self.settings.near_term_min_interval
    }

    fn interval(&self) -> Duration {
        self.settings.near_term_interval
    }

    async fn run_cycle(&self, now: DateTime<Utc>) -> Result<u64, SyncError> {
        let (start, end) =
            near_term_window(now, self.settings.timezone, self.settings.cutover_hour)?;
        sync_range(self.source.as_ref(), &self.storage, start, end, now).await
    }
}

pub struct BackfillJob {
    source: Arc<dyn CalendarSource>,
    storage: DynCalendarStorage,
    markers: DynSyncMarkerStorage,
    settings: CalendarSyncSettings,
}

impl BackfillJob {
    pub fn new(
        source: Arc<dyn CalendarSource>,
        storage: DynCalendarStorage,
        markers: DynSyncMarkerStorage,
        settings: CalendarSyncSettings,
    ) -> Self {
        Self {
            source,
            storage,
            markers,
            settings,
        }
    }

    async fn resume_point(&self) -> Result<Option<NaiveDate>, SyncError> {
        let checkpoint = self.markers.get_marker(BACKFILL_CHECKPOINT).await?;
        Ok(checkpoint.map(|m| {
            m.last_success_at
                .with_timezone(&self.settings.timezone)
                .date_naive()
        }))
    }
}

#[async_trait]
impl SyncJob for BackfillJob {
    fn name(&self) -> &str {
        BACKFILL_SOURCE
    }

    fn min_interval(&self) -> chrono::Duration {
        self.settings.backfill_min_interval
    }

    fn interval(&self) -> Duration {
        self.settings.backfill_interval
    }

    async fn run_cycle(&self, now: DateTime<Utc>) -> Result<u64, SyncError> {
        let tz = self.settings.timezone;
        let today = now.with_timezone(&tz).date_naive();
        let resume_from = self.resume_point().await?;
        let chunks = backfill_chunks(
            today,
            self.settings.backfill_years,
            self.settings.backfill_chunk_days,
            resume_from,
        );
        if let Some(from) = resume_from {
            info!(%from, remaining = chunks.len(), "resuming calendar backfill");
        }

        let total = chunks.len();
        let mut written = 0u64;
        for (index, (start_date, end_date)) in chunks.into_iter().enumerate() {
            let start = local_at(tz, start_date, NaiveTime::MIN)?;
            let end = local_at(tz, end_date, NaiveTime::MIN)?;

            let count = sync_range(self.source.as_ref(), &self.storage, start, end, now)
                .await
                .inspect_err(|e| {
                    warn!(chunk = index + 1, total, %start_date, %end_date, error = %e, "backfill chunk failed");
                })?;
            self.markers
                .set_marker(BACKFILL_CHECKPOINT, end.with_timezone(&Utc))
                .await?;

            debug!(chunk = index + 1, total, %start_date, %end_date, count, "backfill chunk committed");
            written += count;
        }

        self.markers.clear_marker(BACKFILL_CHECKPOINT).await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::Paris;

    fn entry(start: &str, end: &str, value: &str) -> CalendarEntry {
        CalendarEntry {
            start_date: start.into(),
            end_date: end.into(),
            value: value.into(),
            updated_date: Some("2024-01-14T10:20:00+01:00".into()),
        }
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_entry_is_keyed_by_end_boundary() {
        let now = Utc::now();
        let day = parse_entry(
            &entry("2024-01-14T00:00:00+01:00", "2024-01-15T00:00:00+01:00", "RED"),
            now,
        )
        .unwrap();
        assert_eq!(day.date, date("2024-01-15"));
        assert_eq!(day.category, DayCategory::Red);
        assert_eq!(day.updated_at, now);
        assert_eq!(
            day.upstream_updated_at.unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 14, 9, 20, 0).unwrap()
        );
    }

    #[test]
    fn test_settings_reject_unrepresentable_intervals() {
        let calendar = CalendarConfig::default();
        let sync = SyncConfig {
            near_term_min_interval_secs: u64::MAX,
            ..Default::default()
        };
        let err = CalendarSyncSettings::from_config(&calendar, &sync).unwrap_err();
        assert!(err.contains("near_term_min_interval_secs"));

        let settings = CalendarSyncSettings::from_config(&calendar, &SyncConfig::default()).unwrap();
        assert!(settings.backfill_min_interval > chrono::Duration::zero());
    }

    #[test]
    fn test_bad_entries_are_skipped() {
        let entries = vec![
            entry("2024-01-14T00:00:00+01:00", "2024-01-15T00:00:00+01:00", "BLUE"),
            entry("2024-01-15T00:00:00+01:00", "not-a-date", "BLUE"),
            entry("2024-01-15T00:00:00+01:00", "2024-01-16T00:00:00+01:00", "PURPLE"),
            entry("2024-01-14T00:00:00+01:00", "2024-01-15T00:00:00+01:00", "WHITE"),
        ];
        let days = parse_entries(&entries, Utc::now());
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].category, DayCategory::White);
    }

    #[test]
    fn test_near_term_window_before_and_after_cutover() {
        // 06:00 in Paris
        let early = Utc.with_ymd_and_hms(2024, 1, 15, 5, 0, 0).unwrap();
        let (start, end) = near_term_window(early, Paris, 7).unwrap();
        assert_eq!(start.to_rfc3339(), "2024-01-14T00:00:00+01:00");
        assert_eq!(end.to_rfc3339(), "2024-01-15T23:59:59+01:00");

        // 07:30 in Paris
        let late = Utc.with_ymd_and_hms(2024, 1, 15, 6, 30, 0).unwrap();
        let (_, end) = near_term_window(late, Paris, 7).unwrap();
        assert_eq!(end.to_rfc3339(), "2024-01-16T23:59:59+01:00");
    }

    #[test]
    fn test_backfill_chunks_are_chronological_and_bounded() {
        let today = date("2024-06-01");
        let chunks = backfill_chunks(today, 1, 100, None);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].0, today - Days::new(366));
        assert_eq!(chunks.last().unwrap().1, today);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
        assert!(chunks.iter().all(|(s, e)| (*e - *s).num_days() <= 100));

        let resumed = backfill_chunks(today, 1, 100, Some(chunks[2].0));
        assert_eq!(resumed, chunks[2..].to_vec());

        assert!(backfill_chunks(today, 1, 100, Some(today)).is_empty());
        assert_eq!(backfill_chunks(today, 1, 100, Some(date("1990-01-01"))), chunks);
    }
}
