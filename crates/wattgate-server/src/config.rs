use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use wattgate_db_postgres::PostgresConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Ephemeral store for quota counters and the response cache
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Metering data provider
    #[serde(default)]
    pub metering: MeteringConfig,
    /// Grid operator calendar feed
    #[serde(default)]
    pub calendar: CalendarConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        if self.metrics.enabled && self.metrics.listen.parse::<SocketAddr>().is_err() {
            return Err("metrics.listen must be a socket address like 0.0.0.0:9464".into());
        }
        if let Some(pg) = &self.storage.postgres
            && pg.pool_size == 0
        {
            return Err("storage.postgres.pool_size must be > 0".into());
        }
        if self.redis.enabled && self.redis.timeout_ms == 0 {
            return Err("redis.timeout_ms must be > 0".into());
        }
        // Quota validations
        if self.quota.standard_uncached > self.quota.standard_cached {
            return Err("quota.standard_uncached must be <= quota.standard_cached".into());
        }
        if let (Some(uncached), Some(cached)) =
            (self.quota.privileged_uncached, self.quota.privileged_cached)
            && uncached > cached
        {
            return Err("quota.privileged_uncached must be <= quota.privileged_cached".into());
        }
        if self.cache.default_ttl_secs == 0 {
            return Err("cache.default_ttl_secs must be > 0".into());
        }
        if self.cache.scan_batch_size == 0 {
            return Err("cache.scan_batch_size must be > 0".into());
        }
        // Upstream validations
        if self.metering.requests_per_second == 0 {
            return Err("metering.requests_per_second must be > 0".into());
        }
        if self.metering.timeout_ms == 0 || self.calendar.timeout_ms == 0 {
            return Err("upstream timeouts must be > 0".into());
        }
        if self.calendar.cutover_hour > 23 {
            return Err("calendar.cutover_hour must be between 0 and 23".into());
        }
        if self.calendar.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(format!(
                "calendar.timezone '{}' is not a known IANA zone",
                self.calendar.timezone
            ));
        }
        // Sync validations
        if self.sync.backfill_chunk_days == 0 {
            return Err("sync.backfill_chunk_days must be > 0".into());
        }
        if self.sync.near_term_interval_secs == 0 || self.sync.backfill_interval_secs == 0 {
            return Err("sync intervals must be > 0".into());
        }
        for (name, secs) in [
            ("calendar.token_refresh_margin_secs", self.calendar.token_refresh_margin_secs),
            ("sync.near_term_interval_secs", self.sync.near_term_interval_secs),
            ("sync.near_term_min_interval_secs", self.sync.near_term_min_interval_secs),
            ("sync.backfill_interval_secs", self.sync.backfill_interval_secs),
            ("sync.backfill_min_interval_secs", self.sync.backfill_min_interval_secs),
        ] {
            if secs > MAX_PERIOD_SECS {
                return Err(format!("{name} must be <= {MAX_PERIOD_SECS} (one year)"));
            }
        }
        if self.sync.backfill_years > MAX_BACKFILL_YEARS {
            return Err(format!("sync.backfill_years must be <= {MAX_BACKFILL_YEARS}"));
        }
        Ok(())
    }
}

/// Longest accepted interval, margin or minimum spacing.
pub const MAX_PERIOD_SECS: u64 = 366 * 24 * 60 * 60;

const MAX_BACKFILL_YEARS: u32 = 50;

// ============================================================================
// Logging and metrics
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Expose a Prometheus scrape endpoint
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}
fn default_metrics_listen() -> String {
    "0.0.0.0:9464".into()
}
impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

// ============================================================================
// Storage
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// PostgreSQL storage options. When absent, records are kept in memory.
    #[serde(default)]
    pub postgres: Option<PostgresStorageConfig>,
}

/// PostgreSQL storage configuration
///
/// Either set `url` to a full connection string, or set `host`, `port`, `user`,
/// `password` and `database` individually. `url` takes precedence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresStorageConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_postgres_host")]
    pub host: String,
    #[serde(default = "default_postgres_port")]
    pub port: u16,
    #[serde(default = "default_postgres_user")]
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_postgres_database")]
    pub database: String,
    #[serde(default = "default_postgres_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_postgres_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

fn default_postgres_host() -> String {
    "localhost".into()
}
fn default_postgres_port() -> u16 {
    5432
}
fn default_postgres_user() -> String {
    "postgres".into()
}
fn default_postgres_database() -> String {
    "wattgate".into()
}
fn default_postgres_pool_size() -> u32 {
    10
}
fn default_postgres_connect_timeout() -> u64 {
    5000
}
fn default_true() -> bool {
    true
}

impl Default for PostgresStorageConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_postgres_host(),
            port: default_postgres_port(),
            user: default_postgres_user(),
            password: None,
            database: default_postgres_database(),
            pool_size: default_postgres_pool_size(),
            connect_timeout_ms: default_postgres_connect_timeout(),
            idle_timeout_ms: None,
            run_migrations: true,
        }
    }
}

impl PostgresStorageConfig {
    /// Returns `url` if set, otherwise builds one from the separate options.
    pub fn connection_url(&self) -> String {
        if let Some(ref url) = self.url {
            return url.clone();
        }

        let password_part = self
            .password
            .as_ref()
            .map(|p| format!(":{p}"))
            .unwrap_or_default();

        format!(
            "postgres://{}{}@{}:{}/{}",
            self.user, password_part, self.host, self.port, self.database
        )
    }

    pub fn to_backend_config(&self) -> PostgresConfig {
        PostgresConfig {
            url: self.connection_url(),
            pool_size: self.pool_size,
            min_connections: None,
            connect_timeout_ms: self.connect_timeout_ms,
            idle_timeout_ms: self.idle_timeout_ms,
            max_lifetime_secs: None,
            run_migrations: self.run_migrations,
        }
    }
}

/// Redis configuration. Without Redis, counters and cache entries live in
/// process memory and are not shared between instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,
    /// Connection timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_redis_pool_size() -> usize {
    10
}
fn default_redis_timeout_ms() -> u64 {
    5000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

// ============================================================================
// Quota and cache
// ============================================================================

/// What the quota tracker does when the ephemeral store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreFailurePolicy {
    /// Allow the request and log the failure.
    #[default]
    Open,
    /// Reject the request.
    Closed,
}

/// Daily ceilings per tier. `None` on a privileged ceiling means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_standard_uncached")]
    pub standard_uncached: u64,
    #[serde(default = "default_standard_cached")]
    pub standard_cached: u64,
    #[serde(default)]
    pub privileged_uncached: Option<u64>,
    #[serde(default)]
    pub privileged_cached: Option<u64>,
    #[serde(default)]
    pub on_store_error: StoreFailurePolicy,
}

fn default_standard_uncached() -> u64 {
    50
}
fn default_standard_cached() -> u64 {
    1000
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            standard_uncached: default_standard_uncached(),
            standard_cached: default_standard_cached(),
            privileged_uncached: None,
            privileged_cached: None,
            on_store_error: StoreFailurePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL applied when the caller does not pass one
    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: u64,

    /// COUNT hint for incremental key iteration
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: usize,
}

fn default_cache_ttl_secs() -> u64 {
    86_400
}
fn default_scan_batch_size() -> usize {
    100
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_cache_ttl_secs(),
            scan_batch_size: default_scan_batch_size(),
        }
    }
}

// ============================================================================
// Upstreams
// ============================================================================

#[derive(Clone, Serialize, Deserialize)]
pub struct MeteringConfig {
    #[serde(default = "default_metering_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Identifier of the shared credential row
    #[serde(default = "default_metering_scope")]
    pub scope: String,
    /// Client-side throttle, independent of per-user quotas
    #[serde(default = "default_metering_rps")]
    pub requests_per_second: u32,
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_metering_base_url() -> String {
    "https://gw.ext.prod.api.enedis.fr".into()
}
fn default_metering_scope() -> String {
    "metering".into()
}
fn default_metering_rps() -> u32 {
    5
}
fn default_upstream_timeout_ms() -> u64 {
    30_000
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            base_url: default_metering_base_url(),
            client_id: String::new(),
            client_secret: String::new(),
            scope: default_metering_scope(),
            requests_per_second: default_metering_rps(),
            timeout_ms: default_upstream_timeout_ms(),
        }
    }
}

impl std::fmt::Debug for MeteringConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeteringConfig")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("scope", &self.scope)
            .field("requests_per_second", &self.requests_per_second)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct CalendarConfig {
    #[serde(default = "default_calendar_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Zone the upstream expects date ranges in
    #[serde(default = "default_calendar_timezone")]
    pub timezone: String,
    /// Local hour from which tomorrow's classification is requested
    #[serde(default = "default_cutover_hour")]
    pub cutover_hour: u32,
    /// Refresh the cached token this many seconds before it expires
    #[serde(default = "default_token_refresh_margin_secs")]
    pub token_refresh_margin_secs: u64,
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_calendar_base_url() -> String {
    "https://digital.iservices.rte-france.com".into()
}
fn default_calendar_timezone() -> String {
    "Europe/Paris".into()
}
fn default_cutover_hour() -> u32 {
    7
}
fn default_token_refresh_margin_secs() -> u64 {
    300
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            base_url: default_calendar_base_url(),
            client_id: String::new(),
            client_secret: String::new(),
            timezone: default_calendar_timezone(),
            cutover_hour: default_cutover_hour(),
            token_refresh_margin_secs: default_token_refresh_margin_secs(),
            timeout_ms: default_upstream_timeout_ms(),
        }
    }
}

impl std::fmt::Debug for CalendarConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalendarConfig")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("timezone", &self.timezone)
            .field("cutover_hour", &self.cutover_hour)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

// ============================================================================
// Sync
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sleep between near-term cycles
    #[serde(default = "default_near_term_interval_secs")]
    pub near_term_interval_secs: u64,
    /// Skip a near-term cycle if the last success is younger than this
    #[serde(default = "default_near_term_min_interval_secs")]
    pub near_term_min_interval_secs: u64,
    #[serde(default = "default_backfill_interval_secs")]
    pub backfill_interval_secs: u64,
    #[serde(default = "default_backfill_min_interval_secs")]
    pub backfill_min_interval_secs: u64,
    #[serde(default = "default_backfill_years")]
    pub backfill_years: u32,
    #[serde(default = "default_backfill_chunk_days")]
    pub backfill_chunk_days: u32,
}

fn default_near_term_interval_secs() -> u64 {
    3600
}
fn default_near_term_min_interval_secs() -> u64 {
    1800
}
fn default_backfill_interval_secs() -> u64 {
    86_400
}
fn default_backfill_min_interval_secs() -> u64 {
    7 * 86_400
}
fn default_backfill_years() -> u32 {
    10
}
fn default_backfill_chunk_days() -> u32 {
    366
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            near_term_interval_secs: default_near_term_interval_secs(),
            near_term_min_interval_secs: default_near_term_min_interval_secs(),
            backfill_interval_secs: default_backfill_interval_secs(),
            backfill_min_interval_secs: default_backfill_min_interval_secs(),
            backfill_years: default_backfill_years(),
            backfill_chunk_days: default_backfill_chunk_days(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Loads `path` (or `wattgate.toml`), applies `WATTGATE__SECTION__KEY`
    /// overrides and validates the result.
    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or("wattgate.toml"));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., WATTGATE__QUOTA__STANDARD_UNCACHED=20
        builder = builder.add_source(
            Environment::with_prefix("WATTGATE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
