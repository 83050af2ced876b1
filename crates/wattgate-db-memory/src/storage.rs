use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use wattgate_core::{
    CalendarDay, CalendarStorage, Credential, CredentialStorage, NewCredential, StorageError,
    StorageResult, SyncMarker, SyncMarkerStorage,
};

/// Process-local storage for credentials, calendar days and sync markers.
///
/// - Credentials live in a `DashMap` keyed by scope; the entry API gives the
///   same "first insert wins" guarantee a unique index gives in Postgres.
/// - Calendar days live behind one lock so a batch upsert is all-or-nothing
///   and listing is naturally ordered.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    credentials: DashMap<String, Credential>,
    calendar: RwLock<BTreeMap<NaiveDate, CalendarDay>>,
    markers: DashMap<String, SyncMarker>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored calendar days.
    pub async fn calendar_len(&self) -> usize {
        self.calendar.read().await.len()
    }
}

#[async_trait]
impl CredentialStorage for InMemoryStorage {
    async fn find_credential(&self, scope: &str) -> StorageResult<Option<Credential>> {
        Ok(self.credentials.get(scope).map(|c| c.value().clone()))
    }

    async fn insert_credential(&self, credential: &NewCredential) -> StorageResult<Credential> {
        match self.credentials.entry(credential.scope.clone()) {
            Entry::Occupied(_) => Err(StorageError::already_exists(
                "credential",
                credential.scope.clone(),
            )),
            Entry::Vacant(slot) => {
                let stored = credential.clone().into_credential(Utc::now());
                slot.insert(stored.clone());
                Ok(stored)
            }
        }
    }

    async fn replace_credential(
        &self,
        expected_expires_at: DateTime<Utc>,
        credential: &NewCredential,
    ) -> StorageResult<Option<Credential>> {
        let Some(mut current) = self.credentials.get_mut(&credential.scope) else {
            return Ok(None);
        };
        if current.expires_at != expected_expires_at {
            return Ok(None);
        }

        let created_at = current.created_at;
        let mut replacement = credential.clone().into_credential(Utc::now());
        replacement.created_at = created_at;
        *current = replacement.clone();
        Ok(Some(replacement))
    }
}

#[async_trait]
impl CalendarStorage for InMemoryStorage {
    async fn upsert_days(&self, days: &[CalendarDay]) -> StorageResult<u64> {
        let mut calendar = self.calendar.write().await;
        for day in days {
            calendar.insert(day.date, day.clone());
        }
        Ok(days.len() as u64)
    }

    async fn get_day(&self, date: NaiveDate) -> StorageResult<Option<CalendarDay>> {
        Ok(self.calendar.read().await.get(&date).cloned())
    }

    async fn list_days(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> StorageResult<Vec<CalendarDay>> {
        let calendar = self.calendar.read().await;
        Ok(calendar
            .values()
            .filter(|d| start.is_none_or(|s| d.date >= s))
            .filter(|d| end.is_none_or(|e| d.date <= e))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SyncMarkerStorage for InMemoryStorage {
    async fn get_marker(&self, source: &str) -> StorageResult<Option<SyncMarker>> {
        Ok(self.markers.get(source).map(|m| m.value().clone()))
    }

    async fn set_marker(&self, source: &str, at: DateTime<Utc>) -> StorageResult<()> {
        self.markers.insert(
            source.to_string(),
            SyncMarker {
                source: source.to_string(),
                last_success_at: at,
            },
        );
        Ok(())
    }

    async fn clear_marker(&self, source: &str) -> StorageResult<()> {
        self.markers.remove(source);
        Ok(())
    }
}
