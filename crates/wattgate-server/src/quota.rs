//! Daily per-user, per-endpoint request quotas.
//!
//! Counters live in the ephemeral store under
//! `quota:{user_id}:{endpoint_template}:{tier}:{YYYY-MM-DD}` and expire at the
//! next UTC midnight. Endpoints are counted by route template (never by the
//! concrete path), and each request is counted on its cache tier only.
//! Counters only grow within their day: rejected attempts are counted too,
//! and the reported count is clamped to the limit. User ids containing `:`
//! are refused so that keys always parse back to their owner.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{QuotaConfig, StoreFailurePolicy};
use crate::metrics;
use crate::store::{EphemeralStore, StoreError, escape_glob};

const KEY_PREFIX: &str = "quota";

/// Request classification with its own daily ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    /// Caller accepts a cached response.
    Cached,
    /// Caller forces an upstream call.
    Uncached,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::Uncached => "uncached",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "cached" => Some(Self::Cached),
            "uncached" => Some(Self::Uncached),
            _ => None,
        }
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Daily ceilings. `None` means unlimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaLimits {
    pub standard_uncached: u64,
    pub standard_cached: u64,
    pub privileged_uncached: Option<u64>,
    pub privileged_cached: Option<u64>,
}

impl QuotaLimits {
    pub fn ceiling(&self, tier: CacheTier, privileged: bool) -> Option<u64> {
        match (privileged, tier) {
            (false, CacheTier::Uncached) => Some(self.standard_uncached),
            (false, CacheTier::Cached) => Some(self.standard_cached),
            (true, CacheTier::Uncached) => self.privileged_uncached,
            (true, CacheTier::Cached) => self.privileged_cached,
        }
    }
}

impl From<&QuotaConfig> for QuotaLimits {
    fn from(cfg: &QuotaConfig) -> Self {
        Self {
            standard_uncached: cfg.standard_uncached,
            standard_cached: cfg.standard_cached,
            privileged_uncached: cfg.privileged_uncached,
            privileged_cached: cfg.privileged_cached,
        }
    }
}

/// A request rejected by its daily ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaExceeded {
    pub tier: CacheTier,
    pub current: u64,
    pub limit: u64,
}

impl QuotaExceeded {
    /// `true` when the caller was already on the cached tier, so there is no
    /// cheaper option left today.
    pub fn exceeded_with_cache(&self) -> bool {
        self.tier == CacheTier::Cached
    }

    pub fn hint(&self) -> &'static str {
        if self.exceeded_with_cache() {
            "Try again tomorrow."
        } else {
            "Use cache to increase limit."
        }
    }
}

impl fmt::Display for QuotaExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Daily rate limit exceeded ({}/{}). {}",
            self.current,
            self.limit,
            self.hint()
        )
    }
}

impl std::error::Error for QuotaExceeded {}

/// Outcome of one `check_and_increment` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    /// Count after this request (clamped to the limit when rejected).
    pub current: u64,
    pub limit: Option<u64>,
    pub tier: CacheTier,
    /// The store could not be reached and the request was let through.
    pub degraded: bool,
}

impl QuotaDecision {
    pub fn exceeded(&self) -> Option<QuotaExceeded> {
        match (self.allowed, self.limit) {
            (false, Some(limit)) => Some(QuotaExceeded {
                tier: self.tier,
                current: self.current,
                limit,
            }),
            _ => None,
        }
    }

    pub fn into_result(self) -> Result<Self, QuotaExceeded> {
        match self.exceeded() {
            Some(exceeded) => Err(exceeded),
            None => Ok(self),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("user id '{0}' must not contain ':'")]
    InvalidUserId(String),

    /// The store could not be reached and the tracker is configured to fail
    /// closed.
    #[error("quota store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    #[error("quota store error: {0}")]
    Store(#[from] StoreError),
}

/// Cached/uncached counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierCounts {
    pub cached: u64,
    pub uncached: u64,
}

impl TierCounts {
    pub fn total(&self) -> u64 {
        self.cached + self.uncached
    }

    fn add(&mut self, tier: CacheTier, count: u64) {
        match tier {
            CacheTier::Cached => self.cached += count,
            CacheTier::Uncached => self.uncached += count,
        }
    }
}

/// One user's usage for a day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserUsage {
    pub user_id: String,
    pub date: NaiveDate,
    pub totals: TierCounts,
    pub by_endpoint: BTreeMap<String, TierCounts>,
    pub cached_limit: Option<u64>,
    pub uncached_limit: Option<u64>,
}

/// All users' usage for a day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GlobalUsage {
    pub date: NaiveDate,
    pub totals: TierCounts,
    pub by_endpoint: BTreeMap<String, TierCounts>,
    pub by_user: BTreeMap<String, TierCounts>,
}

struct CounterKey<'a> {
    user_id: &'a str,
    endpoint: &'a str,
    tier: CacheTier,
}

fn counter_key(user_id: &str, endpoint: &str, tier: CacheTier, date: NaiveDate) -> String {
    format!(
        "{KEY_PREFIX}:{user_id}:{endpoint}:{}:{}",
        tier.as_str(),
        date.format("%Y-%m-%d")
    )
}

fn parse_counter_key(key: &str) -> Option<CounterKey<'_>> {
    let rest = key.strip_prefix(KEY_PREFIX)?.strip_prefix(':')?;
    let mut tail = rest.rsplitn(3, ':');
    let _date = tail.next()?;
    let tier = CacheTier::parse(tail.next()?)?;
    let (user_id, endpoint) = tail.next()?.split_once(':')?;
    Some(CounterKey {
        user_id,
        endpoint,
        tier,
    })
}

/// First instant of the next UTC day.
fn next_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .checked_add_days(Days::new(1))
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
        .unwrap_or(now)
}

/// Tracks daily quotas in the ephemeral store.
#[derive(Clone, Debug)]
pub struct QuotaTracker {
    store: EphemeralStore,
    limits: QuotaLimits,
    on_store_error: StoreFailurePolicy,
}

impl QuotaTracker {
    pub fn new(store: EphemeralStore, limits: QuotaLimits, on_store_error: StoreFailurePolicy) -> Self {
        Self {
            store,
            limits,
            on_store_error,
        }
    }

    pub fn from_config(store: EphemeralStore, cfg: &QuotaConfig) -> Self {
        Self::new(store, QuotaLimits::from(cfg), cfg.on_store_error)
    }

    pub fn limits(&self) -> &QuotaLimits {
        &self.limits
    }

    /// Counts one request and decides whether it may proceed.
    pub async fn check_and_increment(
        &self,
        user_id: &str,
        endpoint_template: &str,
        tier: CacheTier,
        privileged: bool,
    ) -> Result<QuotaDecision, QuotaError> {
        self.check_and_increment_at(user_id, endpoint_template, tier, privileged, Utc::now())
            .await
    }

    /// Same as [`check_and_increment`](Self::check_and_increment) with an explicit clock.
    pub async fn check_and_increment_at(
        &self,
        user_id: &str,
        endpoint_template: &str,
        tier: CacheTier,
        privileged: bool,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, QuotaError> {
        if user_id.contains(':') {
            return Err(QuotaError::InvalidUserId(user_id.to_string()));
        }
        let limit = self.limits.ceiling(tier, privileged);
        let key = counter_key(user_id, endpoint_template, tier, now.date_naive());

        let count = match self.store.incr_expiring_at(&key, next_midnight(now)).await {
            Ok(count) => count.max(0) as u64,
            Err(e) if e.is_unavailable() => {
                return self.on_store_failure(user_id, tier, limit, e);
            }
            Err(e) => return Err(QuotaError::Store(e)),
        };

        if let Some(limit) = limit
            && count > limit
        {
            debug!(user_id, endpoint = endpoint_template, tier = %tier, limit, "Quota exceeded");
            metrics::record_quota_decision(tier.as_str(), false);
            return Ok(QuotaDecision {
                allowed: false,
                current: limit,
                limit: Some(limit),
                tier,
                degraded: false,
            });
        }

        metrics::record_quota_decision(tier.as_str(), true);
        Ok(QuotaDecision {
            allowed: true,
            current: count,
            limit,
            tier,
            degraded: false,
        })
    }

    fn on_store_failure(
        &self,
        user_id: &str,
        tier: CacheTier,
        limit: Option<u64>,
        err: StoreError,
    ) -> Result<QuotaDecision, QuotaError> {
        match self.on_store_error {
            StoreFailurePolicy::Open => {
                warn!(user_id, tier = %tier, error = %err, "Quota store unreachable, allowing request");
                metrics::record_quota_store_error("open");
                Ok(QuotaDecision {
                    allowed: true,
                    current: 0,
                    limit,
                    tier,
                    degraded: true,
                })
            }
            StoreFailurePolicy::Closed => {
                warn!(user_id, tier = %tier, error = %err, "Quota store unreachable, rejecting request");
                metrics::record_quota_store_error("closed");
                Err(QuotaError::StoreUnavailable(err))
            }
        }
    }

    /// Today's usage for one user, summed per tier and per endpoint.
    pub async fn usage_for_user(&self, user_id: &str, privileged: bool) -> Result<UserUsage, QuotaError> {
        let date = Utc::now().date_naive();
        let pattern = format!(
            "{KEY_PREFIX}:{}:*:{}",
            escape_glob(user_id),
            date.format("%Y-%m-%d")
        );

        let mut totals = TierCounts::default();
        let mut by_endpoint: BTreeMap<String, TierCounts> = BTreeMap::new();
        for (key, count) in self.read_counters(&pattern).await? {
            let Some(parsed) = parse_counter_key(&key) else {
                continue;
            };
            if parsed.user_id != user_id {
                continue;
            }
            totals.add(parsed.tier, count);
            by_endpoint
                .entry(parsed.endpoint.to_string())
                .or_default()
                .add(parsed.tier, count);
        }

        Ok(UserUsage {
            user_id: user_id.to_string(),
            date,
            totals,
            by_endpoint,
            cached_limit: self.limits.ceiling(CacheTier::Cached, privileged),
            uncached_limit: self.limits.ceiling(CacheTier::Uncached, privileged),
        })
    }

    /// Today's usage across all users.
    pub async fn usage_today(&self) -> Result<GlobalUsage, QuotaError> {
        let date = Utc::now().date_naive();
        let pattern = format!("{KEY_PREFIX}:*:{}", date.format("%Y-%m-%d"));

        let mut usage = GlobalUsage {
            date,
            totals: TierCounts::default(),
            by_endpoint: BTreeMap::new(),
            by_user: BTreeMap::new(),
        };
        for (key, count) in self.read_counters(&pattern).await? {
            let Some(parsed) = parse_counter_key(&key) else {
                continue;
            };
            usage.totals.add(parsed.tier, count);
            usage
                .by_endpoint
                .entry(parsed.endpoint.to_string())
                .or_default()
                .add(parsed.tier, count);
            usage
                .by_user
                .entry(parsed.user_id.to_string())
                .or_default()
                .add(parsed.tier, count);
        }
        Ok(usage)
    }

    /// Deletes all of today's counters for `user_id`. Returns the number removed.
    pub async fn reset_user(&self, user_id: &str) -> Result<u64, QuotaError> {
        let pattern = format!(
            "{KEY_PREFIX}:{}:*:{}",
            escape_glob(user_id),
            Utc::now().date_naive().format("%Y-%m-%d")
        );
        let removed = self.store.delete_matching(&pattern).await?;
        debug!(user_id, removed, "Quota counters reset");
        Ok(removed)
    }

    async fn read_counters(&self, pattern: &str) -> Result<Vec<(String, u64)>, QuotaError> {
        let keys = self.store.scan(pattern).await?;
        let mut counters = Vec::with_capacity(keys.len());
        for key in keys {
            // Keys can expire between SCAN and GET.
            if let Some(count) = self.store.get_counter(&key).await? {
                counters.push((key, count.max(0) as u64));
            }
        }
        Ok(counters)
    }
}
