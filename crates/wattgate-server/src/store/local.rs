//! Process-local implementation of the ephemeral store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::backend::StoreError;
use super::pattern::compile_glob;

#[derive(Clone, Debug)]
enum LocalValue {
    Counter(i64),
    Bytes(Arc<Vec<u8>>),
}

#[derive(Clone, Debug)]
struct LocalEntry {
    value: LocalValue,
    expires_at: Option<Instant>,
}

impl LocalEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// DashMap-backed store. Single-key operations are atomic under the shard lock.
#[derive(Debug, Default)]
pub struct LocalStore {
    entries: DashMap<String, LocalEntry>,
}

/// Converts a wall-clock deadline into a monotonic one.
fn instant_at(deadline: DateTime<Utc>) -> Instant {
    let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Instant::now() + remaining
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_expiring_at(&self, key: &str, deadline: DateTime<Utc>) -> Result<i64, StoreError> {
        let expires_at = Some(instant_at(deadline));
        let mut slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| LocalEntry {
                value: LocalValue::Counter(0),
                expires_at,
            });
        let entry = slot.value_mut();
        if entry.is_expired() {
            entry.value = LocalValue::Counter(0);
        }
        entry.expires_at = expires_at;

        match &mut entry.value {
            LocalValue::Counter(n) => {
                *n += 1;
                Ok(*n)
            }
            LocalValue::Bytes(_) => Err(StoreError::wrong_type(key)),
        }
    }

    pub fn get_counter(&self, key: &str) -> Result<Option<i64>, StoreError> {
        match self.live(key) {
            None => Ok(None),
            Some(LocalValue::Counter(n)) => Ok(Some(n)),
            Some(LocalValue::Bytes(_)) => Err(StoreError::wrong_type(key)),
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.live(key) {
            None => Ok(None),
            Some(LocalValue::Bytes(data)) => Ok(Some(data.as_ref().clone())),
            Some(LocalValue::Counter(n)) => Ok(Some(n.to_string().into_bytes())),
        }
    }

    pub fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            LocalEntry {
                value: LocalValue::Bytes(Arc::new(value.to_vec())),
                expires_at: Some(Instant::now() + ttl),
            },
        );
    }

    /// Keys matching `pattern` that have not expired.
    pub fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let re = compile_glob(pattern).map_err(|e| StoreError::pattern(pattern, e))?;
        Ok(self
            .entries
            .iter()
            .filter(|e| !e.value().is_expired() && re.is_match(e.key()))
            .map(|e| e.key().clone())
            .collect())
    }

    pub fn delete_matching(&self, pattern: &str) -> Result<u64, StoreError> {
        let re = compile_glob(pattern).map_err(|e| StoreError::pattern(pattern, e))?;
        let mut deleted = 0u64;
        self.entries.retain(|key, entry| {
            if entry.is_expired() {
                return false;
            }
            if re.is_match(key) {
                deleted += 1;
                return false;
            }
            true
        });
        Ok(deleted)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the live value, dropping the entry if it has expired.
    fn live(&self, key: &str) -> Option<LocalValue> {
        let entry = self.entries.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired());
            return None;
        }
        Some(entry.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn tomorrow() -> DateTime<Utc> {
        Utc::now() + ChronoDuration::days(1)
    }

    #[test]
    fn test_incr_counts() {
        let store = LocalStore::new();
        assert_eq!(store.incr_expiring_at("k", tomorrow()).unwrap(), 1);
        assert_eq!(store.incr_expiring_at("k", tomorrow()).unwrap(), 2);
        assert_eq!(store.get_counter("k").unwrap(), Some(2));
        assert_eq!(store.get_counter("missing").unwrap(), None);
    }

    #[test]
    fn test_counter_restarts_after_deadline() {
        let store = LocalStore::new();
        let past = Utc::now() - ChronoDuration::seconds(1);
        store.incr_expiring_at("k", past).unwrap();
        assert_eq!(store.get_counter("k").unwrap(), None);
        assert_eq!(store.incr_expiring_at("k", tomorrow()).unwrap(), 1);
    }

    #[test]
    fn test_bytes_expire() {
        let store = LocalStore::new();
        store.set_ex("v", b"payload", Duration::from_millis(0));
        assert_eq!(store.get("v").unwrap(), None);
        assert!(store.is_empty());

        store.set_ex("v", b"payload", Duration::from_secs(60));
        assert_eq!(store.get("v").unwrap(), Some(b"payload".to_vec()));
    }

    #[test]
    fn test_incr_on_bytes_is_wrong_type() {
        let store = LocalStore::new();
        store.set_ex("v", b"payload", Duration::from_secs(60));
        assert!(store.incr_expiring_at("v", tomorrow()).is_err());
    }

    #[test]
    fn test_scan_and_delete_by_pattern() {
        let store = LocalStore::new();
        let ttl = Duration::from_secs(60);
        store.set_ex("pdl-1:contract", b"a", ttl);
        store.set_ex("pdl-1:consumption_daily:end:2024-01-31", b"b", ttl);
        store.set_ex("pdl-2:contract", b"c", ttl);

        let mut keys = store.scan("pdl-1:*").unwrap();
        keys.sort();
        assert_eq!(
            keys,
            vec!["pdl-1:consumption_daily:end:2024-01-31", "pdl-1:contract"]
        );

        assert_eq!(store.delete_matching("pdl-1:*").unwrap(), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.delete_matching("pdl-1:*").unwrap(), 0);
    }
}
