use std::{env, net::SocketAddr, sync::Arc};

use wattgate_server::config::loader::load_config;
use wattgate_server::sync::{BackfillJob, CalendarSyncSettings, NearTermJob, SyncScheduler};
use wattgate_server::upstream::{CalendarClient, CalendarSource, MeteringClient};
use wattgate_server::{
    AppConfig, MeteringGateway, QuotaTracker, ResponseCache, TokenBroker, create_ephemeral_store,
    create_storage,
};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// How the configuration path was determined.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    /// From --config CLI argument
    CliArgument,
    /// From WATTGATE_CONFIG environment variable
    EnvironmentVariable,
    /// Default path (wattgate.toml)
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CliArgument => write!(f, "CLI argument (--config)"),
            Self::EnvironmentVariable => write!(f, "environment variable (WATTGATE_CONFIG)"),
            Self::Default => write!(f, "default"),
        }
    }
}

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv()
        && !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
    {
        eprintln!("Warning: Failed to load .env file: {e}");
    }

    wattgate_server::observability::init_tracing();

    let (config_path, source) = resolve_config_path();
    let cfg = match load_config(Some(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };

    tracing::info!(
        path = %config_path,
        source = %source,
        "Configuration loaded"
    );
    wattgate_server::observability::apply_logging_level(&cfg.logging.level);

    if let Err(e) = run(cfg).await {
        eprintln!("Startup failed: {e:#}");
        std::process::exit(2);
    }
}

async fn run(cfg: AppConfig) -> anyhow::Result<()> {
    if cfg.metrics.enabled {
        let listen: SocketAddr = cfg.metrics.listen.parse()?;
        wattgate_server::metrics::init_metrics(listen);
    }

    let storage = create_storage(&cfg).await?;
    let store = create_ephemeral_store(&cfg.redis, cfg.cache.scan_batch_size).await;
    tracing::info!(
        storage = storage.backend,
        ephemeral_store = store.mode(),
        "Stores ready"
    );

    let metering = Arc::new(MeteringClient::new(&cfg.metering)?);
    let broker = Arc::new(TokenBroker::new(storage.credentials.clone(), metering.clone()));
    let gateway = MeteringGateway::new(
        QuotaTracker::from_config(store.clone(), &cfg.quota),
        broker,
        ResponseCache::new(store, cfg.cache.default_ttl()),
        metering,
    );
    tracing::info!(
        scope = %cfg.metering.scope,
        uncached_limit = gateway.quota().limits().standard_uncached,
        cached_limit = gateway.quota().limits().standard_cached,
        "Metering gateway ready"
    );

    let scheduler = if cfg.sync.enabled {
        let settings = CalendarSyncSettings::from_config(&cfg.calendar, &cfg.sync)
            .map_err(anyhow::Error::msg)?;
        let source: Arc<dyn CalendarSource> = Arc::new(CalendarClient::new(&cfg.calendar)?);

        let near_term = NearTermJob::new(source.clone(), storage.calendar.clone(), settings.clone());
        let backfill = BackfillJob::new(
            source,
            storage.calendar.clone(),
            storage.markers.clone(),
            settings,
        );
        let handle = SyncScheduler::new(storage.markers.clone())
            .with_job(Arc::new(near_term))
            .with_job(Arc::new(backfill))
            .start();
        tracing::info!("Calendar sync started");
        Some(handle)
    } else {
        tracing::info!("Calendar sync disabled");
        None
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    if let Some(handle) = scheduler {
        handle.shutdown().await;
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolve the configuration file path.
///
/// Priority order:
/// 1. CLI argument: --config <path>
/// 2. Environment variable: WATTGATE_CONFIG
/// 3. Default: wattgate.toml
fn resolve_config_path() -> (String, ConfigSource) {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config"
            && let Some(path) = args.next()
        {
            return (path, ConfigSource::CliArgument);
        }
    }

    if let Ok(path) = env::var("WATTGATE_CONFIG")
        && !path.is_empty()
    {
        return (path, ConfigSource::EnvironmentVariable);
    }

    ("wattgate.toml".to_string(), ConfigSource::Default)
}
