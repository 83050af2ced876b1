pub mod calendar;
pub mod config;
pub mod gateway;
pub mod metrics;
pub mod observability;
pub mod quota;
pub mod response_cache;
pub mod store;
pub mod sync;
pub mod token_broker;
pub mod upstream;

use std::sync::Arc;
use std::time::Duration;

use wattgate_core::{DynCalendarStorage, DynCredentialStorage, DynSyncMarkerStorage};
use wattgate_db_postgres::{PostgresError, PostgresStorage, mask_password};

pub use calendar::CalendarView;
pub use config::{AppConfig, PostgresStorageConfig, RedisConfig, StoreFailurePolicy};
pub use gateway::{Caller, GatewayError, GatewayResponse, MeteringGateway};
pub use observability::init_tracing;
pub use quota::{CacheTier, QuotaDecision, QuotaError, QuotaExceeded, QuotaTracker};
pub use response_cache::{CacheError, ResponseCache};
pub use store::{EphemeralStore, StoreError};
pub use sync::{CycleOutcome, SchedulerHandle, SyncError, SyncJob, SyncScheduler};
pub use token_broker::{CredentialIssuer, TokenBroker, TokenError};

/// Create the ephemeral store based on configuration.
///
/// ## Store Modes
///
/// - **Redis disabled**: Returns a local-only store (DashMap)
/// - **Redis enabled**: Attempts to connect to Redis, falls back to local on failure
///
/// A local store keeps quota counters per instance, so limits are enforced
/// per process rather than globally after a fallback.
pub async fn create_ephemeral_store(config: &RedisConfig, scan_batch: usize) -> EphemeralStore {
    if !config.enabled {
        tracing::info!("Redis disabled, using local ephemeral store");
        return EphemeralStore::new_local();
    }

    tracing::info!(url = %mask_password(&config.url), "Connecting to Redis");

    let timeout = Duration::from_millis(config.timeout_ms);
    let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size);
    pool_config.timeouts.wait = Some(timeout);
    pool_config.timeouts.create = Some(timeout);
    pool_config.timeouts.recycle = Some(timeout);

    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    redis_config.pool = Some(pool_config);

    let pool = match redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to create Redis pool. Falling back to local store."
            );
            return EphemeralStore::new_local();
        }
    };

    match pool.get().await {
        Ok(_) => {
            tracing::info!("Connected to Redis");
            EphemeralStore::new_redis(pool, scan_batch)
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to connect to Redis. Falling back to local store."
            );
            EphemeralStore::new_local()
        }
    }
}

/// Durable storage handles, all backed by the same backend.
#[derive(Clone)]
pub struct Storage {
    pub credentials: DynCredentialStorage,
    pub calendar: DynCalendarStorage,
    pub markers: DynSyncMarkerStorage,
    pub backend: &'static str,
}

impl Storage {
    pub fn in_memory() -> Self {
        let storage = wattgate_db_memory::create_storage();
        Self {
            credentials: storage.clone(),
            calendar: storage.clone(),
            markers: storage,
            backend: "memory",
        }
    }

    pub fn postgres(storage: PostgresStorage) -> Self {
        let storage = Arc::new(storage);
        Self {
            credentials: storage.clone(),
            calendar: storage.clone(),
            markers: storage,
            backend: "postgres",
        }
    }
}

/// Connects the configured durable storage. Without a `[storage.postgres]`
/// section, records are kept in memory.
pub async fn create_storage(config: &AppConfig) -> Result<Storage, PostgresError> {
    let Some(pg) = &config.storage.postgres else {
        tracing::warn!("No PostgreSQL storage configured, records are kept in memory");
        return Ok(Storage::in_memory());
    };

    let backend_config = pg.to_backend_config();
    tracing::info!(url = %mask_password(&backend_config.url), "Connecting to PostgreSQL");
    let storage = PostgresStorage::connect(&backend_config).await?;
    Ok(Storage::postgres(storage))
}
