//! Encrypted response cache for upstream results.
//!
//! Values are serialized to JSON and sealed with AES-256-GCM under a key
//! derived from the subject's own secret. An entry written under one secret
//! is unreadable under any other: it is reported as a miss, never as an error
//! and never as plaintext.
//!
//! Entries share the ephemeral store with quota counters, so every key and
//! pattern passed in here is stored under the `cache:` namespace.

use std::time::Duration;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::metrics;
use crate::store::{EphemeralStore, StoreError, escape_glob};

/// Nonce size for AES-256-GCM (96 bits)
const NONCE_SIZE: usize = 12;

/// Leading byte of every sealed entry.
const FORMAT_VERSION: u8 = 1;

const NAMESPACE: &str = "cache";

fn namespaced(key: &str) -> String {
    format!("{NAMESPACE}:{key}")
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("cached value could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Builds a deterministic cache key: `subject:operation:k1:v1:k2:v2`, with
/// parameters sorted by name.
pub fn make_key(subject_id: &str, operation: &str, params: &[(&str, &str)]) -> String {
    let mut sorted = params.to_vec();
    sorted.sort();

    let mut key = format!("{subject_id}:{operation}");
    for (name, value) in sorted {
        key.push(':');
        key.push_str(name);
        key.push(':');
        key.push_str(value);
    }
    key
}

fn cipher_for(secret: &str) -> Aes256Gcm {
    let digest = Sha256::digest(secret.as_bytes());
    Aes256Gcm::new(&digest)
}

fn seal(plaintext: &[u8], secret: &str) -> Result<Vec<u8>, CacheError> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher_for(secret)
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| CacheError::Encryption(e.to_string()))?;

    let mut sealed = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
    sealed.push(FORMAT_VERSION);
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Returns `None` for anything that does not authenticate under `secret`.
fn open(sealed: &[u8], secret: &str) -> Option<Vec<u8>> {
    let (&version, rest) = sealed.split_first()?;
    if version != FORMAT_VERSION || rest.len() < NONCE_SIZE {
        return None;
    }
    let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);
    cipher_for(secret)
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .ok()
}

/// TTL-only response cache on top of the ephemeral store.
#[derive(Clone, Debug)]
pub struct ResponseCache {
    store: EphemeralStore,
    default_ttl: Duration,
}

impl ResponseCache {
    pub fn new(store: EphemeralStore, default_ttl: Duration) -> Self {
        Self { store, default_ttl }
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        key: &str,
        subject_secret: &str,
    ) -> Result<Option<T>, CacheError> {
        let Some(sealed) = self.store.get(&namespaced(key)).await? else {
            metrics::record_cache_miss();
            return Ok(None);
        };

        let Some(plaintext) = open(&sealed, subject_secret) else {
            debug!(key, "cache entry not readable with current secret");
            metrics::record_cache_miss();
            return Ok(None);
        };

        match serde_json::from_slice(&plaintext) {
            Ok(value) => {
                metrics::record_cache_hit();
                Ok(Some(value))
            }
            Err(e) => {
                debug!(key, error = %e, "cache entry has an unexpected shape");
                metrics::record_cache_miss();
                Ok(None)
            }
        }
    }

    /// Stores `value` until `ttl` (or the default TTL) elapses.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        subject_secret: &str,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let plaintext = serde_json::to_vec(value)?;
        let sealed = seal(&plaintext, subject_secret)?;
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.store.set_ex(&namespaced(key), &sealed, ttl).await?;
        debug!(key, ttl_secs = ttl.as_secs(), "cache set");
        Ok(())
    }

    /// Deletes every entry whose key matches the glob `pattern`. The pattern
    /// only ever sees cache entries.
    pub async fn delete_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let deleted = self.store.delete_matching(&namespaced(pattern)).await?;
        metrics::record_cache_purged(deleted);
        debug!(pattern, deleted, "cache entries deleted");
        Ok(deleted)
    }

    /// Drops every entry of one subject, e.g. after its secret was rotated.
    pub async fn purge_subject(&self, subject_id: &str) -> Result<u64, CacheError> {
        self.delete_pattern(&format!("{}:*", escape_glob(subject_id)))
            .await
    }

    /// Drops every entry of one operation across all subjects.
    pub async fn purge_operation(&self, operation: &str) -> Result<u64, CacheError> {
        let operation = escape_glob(operation);
        let bare = self.delete_pattern(&format!("*:{operation}")).await?;
        let with_params = self.delete_pattern(&format!("*:{operation}:*")).await?;
        Ok(bare + with_params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn cache() -> ResponseCache {
        ResponseCache::new(EphemeralStore::new_local(), Duration::from_secs(60))
    }

    #[test]
    fn test_make_key_sorts_parameters() {
        let key = make_key(
            "00000000000000",
            "consumption_daily",
            &[("start", "2024-01-01"), ("end", "2024-01-31")],
        );
        assert_eq!(
            key,
            "00000000000000:consumption_daily:end:2024-01-31:start:2024-01-01"
        );
    }

    #[test]
    fn test_make_key_without_parameters() {
        assert_eq!(make_key("00000000000000", "contract", &[]), "00000000000000:contract");
    }

    #[test]
    fn test_sealed_bytes_do_not_contain_plaintext() {
        let sealed = seal(b"{\"kwh\":42}", "secret").unwrap();
        assert_eq!(sealed[0], FORMAT_VERSION);
        assert!(!sealed.windows(6).any(|w| w == b"\"kwh\":"));
        assert_eq!(open(&sealed, "secret").unwrap(), b"{\"kwh\":42}");
        assert!(open(&sealed, "other").is_none());
        assert!(open(&[], "secret").is_none());
        assert!(open(&[FORMAT_VERSION, 1, 2], "secret").is_none());
    }

    #[tokio::test]
    async fn test_round_trip_with_matching_secret() {
        let cache = cache();
        let value = json!({"interval_reading": [{"date": "2024-01-01", "value": "1234"}]});

        cache.set("pdl:daily", &value, "s3cret", None).await.unwrap();
        let back: Option<Value> = cache.get("pdl:daily", "s3cret").await.unwrap();
        assert_eq!(back, Some(value));
    }

    #[tokio::test]
    async fn test_other_secret_is_a_miss() {
        let cache = cache();
        cache
            .set("pdl:daily", &json!({"value": 1}), "old-secret", None)
            .await
            .unwrap();

        let back: Option<Value> = cache.get("pdl:daily", "new-secret").await.unwrap();
        assert!(back.is_none());
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = cache();
        cache
            .set("pdl:daily", &json!(1), "s", Some(Duration::ZERO))
            .await
            .unwrap();
        let back: Option<Value> = cache.get("pdl:daily", "s").await.unwrap();
        assert!(back.is_none());
    }

    #[tokio::test]
    async fn test_purges_leave_quota_counters_alone() {
        use crate::config::StoreFailurePolicy;
        use crate::quota::{CacheTier, QuotaLimits, QuotaTracker};

        let store = EphemeralStore::new_local();
        let cache = ResponseCache::new(store.clone(), Duration::from_secs(60));
        let quota = QuotaTracker::new(
            store,
            QuotaLimits {
                standard_uncached: 10,
                standard_cached: 10,
                privileged_uncached: None,
                privileged_cached: None,
            },
            StoreFailurePolicy::Open,
        );

        // A user id that collides with an operation name and a subject id.
        for user in ["contract", "pdl1"] {
            quota
                .check_and_increment(user, "/contract", CacheTier::Uncached, false)
                .await
                .unwrap();
        }
        cache
            .set(&make_key("pdl1", "contract", &[]), &json!(1), "s", None)
            .await
            .unwrap();

        assert_eq!(cache.purge_operation("contract").await.unwrap(), 1);
        assert_eq!(cache.purge_subject("pdl1").await.unwrap(), 0);
        assert_eq!(cache.delete_pattern("*").await.unwrap(), 0);

        let usage = quota.usage_today().await.unwrap();
        assert_eq!(usage.by_user.len(), 2);
        assert_eq!(usage.totals.uncached, 2);
    }

    #[tokio::test]
    async fn test_purge_subject_and_operation() {
        let cache = cache();
        for key in [
            make_key("pdl1", "contract", &[]),
            make_key("pdl1", "consumption_daily", &[("start", "a"), ("end", "b")]),
            make_key("pdl2", "contract", &[]),
            make_key("pdl2", "consumption_daily", &[("start", "a"), ("end", "b")]),
        ] {
            cache.set(&key, &json!(true), "s", None).await.unwrap();
        }

        assert_eq!(cache.purge_subject("pdl1").await.unwrap(), 2);
        assert_eq!(cache.purge_operation("consumption_daily").await.unwrap(), 1);

        let remaining: Option<Value> = cache.get("pdl2:contract", "s").await.unwrap();
        assert_eq!(remaining, Some(json!(true)));
    }
}
