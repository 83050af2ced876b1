//! Log setup. The subscriber starts at `info` so config loading is visible,
//! then switches to `logging.level` once the config is read.

use std::sync::OnceLock;

use tracing_subscriber::filter::Directive;
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

static FILTER: OnceLock<FilterHandle> = OnceLock::new();

/// HTTP and SQL internals stay at `warn` unless `RUST_LOG` says otherwise.
const QUIET_DEPENDENCIES: &[&str] = &["hyper=warn", "reqwest=warn", "sqlx=warn", "h2=warn"];

fn filter_for(level: &str) -> EnvFilter {
    QUIET_DEPENDENCIES
        .iter()
        .filter_map(|d| d.parse::<Directive>().ok())
        .fold(EnvFilter::new(level), EnvFilter::add_directive)
}

fn rust_log_set() -> bool {
    std::env::var_os("RUST_LOG").is_some()
}

pub fn init_tracing() {
    let filter = if rust_log_set() {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| filter_for("info"))
    } else {
        filter_for("info")
    };

    let (filter_layer, handle) = reload::Layer::new(filter);
    let _ = FILTER.set(handle);

    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_target(true))
        .try_init();
}

/// Switches to the configured level. Returns `false` when `RUST_LOG` pins
/// the filter or tracing was never initialised.
pub fn apply_logging_level(level: &str) -> bool {
    if rust_log_set() {
        return false;
    }
    let Some(handle) = FILTER.get() else {
        return false;
    };
    handle.modify(|f| *f = filter_for(level)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_keeps_dependencies_quiet() {
        let rendered = filter_for("debug").to_string();
        assert!(rendered.contains("debug"));
        assert!(rendered.contains("reqwest=warn"));
    }
}
