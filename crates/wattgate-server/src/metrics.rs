//! Prometheus metrics for the gateway.
//!
//! Quota decisions, response cache hits, shared-token issuance, upstream calls
//! and sync cycles are counted here. Recording is a no-op until a recorder is
//! installed, so library code and tests can call these freely.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Metric names as constants for consistency.
pub mod names {
    pub const QUOTA_DECISIONS_TOTAL: &str = "quota_decisions_total";
    pub const QUOTA_STORE_ERRORS_TOTAL: &str = "quota_store_errors_total";

    pub const CACHE_HITS_TOTAL: &str = "response_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "response_cache_misses_total";
    pub const CACHE_PURGED_TOTAL: &str = "response_cache_purged_total";

    pub const TOKEN_ISSUED_TOTAL: &str = "shared_token_issued_total";
    pub const TOKEN_CONFLICTS_TOTAL: &str = "shared_token_conflicts_total";

    pub const UPSTREAM_REQUESTS_TOTAL: &str = "upstream_requests_total";
    pub const UPSTREAM_REQUEST_DURATION_SECONDS: &str = "upstream_request_duration_seconds";

    pub const SYNC_CYCLES_TOTAL: &str = "sync_cycles_total";
    pub const SYNC_DAYS_WRITTEN_TOTAL: &str = "sync_days_written_total";
}

/// Install the Prometheus recorder with its own scrape listener.
///
/// Returns `false` if a recorder was already installed or installation failed.
pub fn init_metrics(listen: SocketAddr) -> bool {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    match PrometheusBuilder::new().with_http_listener(listen).install() {
        Ok(()) => {
            tracing::info!(%listen, "Prometheus metrics exporter listening");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

pub fn record_quota_decision(tier: &'static str, allowed: bool) {
    let outcome = if allowed { "allowed" } else { "exceeded" };
    counter!(names::QUOTA_DECISIONS_TOTAL, "tier" => tier, "outcome" => outcome).increment(1);
}

pub fn record_quota_store_error(policy: &'static str) {
    counter!(names::QUOTA_STORE_ERRORS_TOTAL, "policy" => policy).increment(1);
}

pub fn record_cache_hit() {
    counter!(names::CACHE_HITS_TOTAL).increment(1);
}

pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

pub fn record_cache_purged(count: u64) {
    counter!(names::CACHE_PURGED_TOTAL).increment(count);
}

pub fn record_token_issued(scope: &str) {
    counter!(names::TOKEN_ISSUED_TOTAL, "scope" => scope.to_string()).increment(1);
}

pub fn record_token_conflict(scope: &str) {
    counter!(names::TOKEN_CONFLICTS_TOTAL, "scope" => scope.to_string()).increment(1);
}

pub fn record_upstream_request(upstream: &'static str, status: u16, duration: Duration) {
    counter!(
        names::UPSTREAM_REQUESTS_TOTAL,
        "upstream" => upstream,
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(names::UPSTREAM_REQUEST_DURATION_SECONDS, "upstream" => upstream)
        .record(duration.as_secs_f64());
}

pub fn record_sync_cycle(source: &str, outcome: &'static str) {
    counter!(names::SYNC_CYCLES_TOTAL, "source" => source.to_string(), "outcome" => outcome)
        .increment(1);
}

pub fn record_sync_days_written(source: &str, count: u64) {
    counter!(names::SYNC_DAYS_WRITTEN_TOTAL, "source" => source.to_string()).increment(count);
}
