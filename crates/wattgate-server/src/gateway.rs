//! Request pipeline for metering resources.
//!
//! quota -> shared token -> cache lookup -> upstream -> cache store
//!
//! The cache is an optimization: read or write failures are logged and the
//! request carries on against the upstream.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::quota::{CacheTier, QuotaDecision, QuotaError, QuotaExceeded, QuotaTracker};
use crate::response_cache::{CacheError, ResponseCache, make_key};
use crate::token_broker::{TokenBroker, TokenError};
use crate::upstream::{MeteringClient, MeteringRequest, UpstreamError};

/// The end user a request is made for.
#[derive(Clone)]
pub struct Caller {
    pub user_id: String,
    pub privileged: bool,
    /// Per-user secret that encrypts this user's cached responses.
    pub subject_secret: String,
}

impl Caller {
    pub fn new(user_id: impl Into<String>, subject_secret: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            privileged: false,
            subject_secret: subject_secret.into(),
        }
    }

    #[must_use]
    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }
}

impl std::fmt::Debug for Caller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Caller")
            .field("user_id", &self.user_id)
            .field("privileged", &self.privileged)
            .field("subject_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    QuotaExceeded(#[from] QuotaExceeded),

    /// The quota store failed and the tracker fails closed.
    #[error("quota check unavailable: {0}")]
    QuotaUnavailable(#[source] QuotaError),

    #[error("Access denied: no valid upstream credential")]
    AccessDenied(#[source] TokenError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl GatewayError {
    /// Stable error code for API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::QuotaExceeded(_) => "RATE_LIMIT_EXCEEDED",
            Self::QuotaUnavailable(_) => "QUOTA_UNAVAILABLE",
            Self::AccessDenied(_) => "ACCESS_DENIED",
            Self::Upstream(_) => "UPSTREAM_ERROR",
        }
    }
}

/// A successful fetch.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub data: Value,
    pub from_cache: bool,
    pub quota: QuotaDecision,
}

pub struct MeteringGateway {
    quota: QuotaTracker,
    broker: Arc<TokenBroker>,
    cache: ResponseCache,
    client: Arc<MeteringClient>,
}

impl MeteringGateway {
    pub fn new(
        quota: QuotaTracker,
        broker: Arc<TokenBroker>,
        cache: ResponseCache,
        client: Arc<MeteringClient>,
    ) -> Self {
        Self {
            quota,
            broker,
            cache,
            client,
        }
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    #[instrument(skip_all, fields(user_id = %caller.user_id, resource = %request.resource, use_cache = request.use_cache))]
    pub async fn fetch(
        &self,
        caller: &Caller,
        request: &MeteringRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        request.validate().map_err(GatewayError::InvalidRequest)?;

        let tier = if request.use_cache {
            CacheTier::Cached
        } else {
            CacheTier::Uncached
        };
        let decision = self
            .quota
            .check_and_increment(
                &caller.user_id,
                request.resource.route_template(),
                tier,
                caller.privileged,
            )
            .await
            .map_err(|e| match e {
                QuotaError::InvalidUserId(_) => GatewayError::InvalidRequest(e.to_string()),
                e => GatewayError::QuotaUnavailable(e),
            })?
            .into_result()?;

        let token = self.broker.get_valid_token().await.map_err(|e| {
            warn!(error = %e, "no shared credential, denying request");
            GatewayError::AccessDenied(e)
        })?;

        let cache_key = request.use_cache.then(|| {
            let params = request.range_params();
            let params: Vec<(&str, &str)> = params.iter().map(|(k, v)| (*k, v.as_str())).collect();
            make_key(&request.usage_point_id, request.resource.operation(), &params)
        });

        if let Some(key) = &cache_key {
            match self.cache.get::<Value>(key, &caller.subject_secret).await {
                Ok(Some(data)) => {
                    debug!(key = %key, "served from cache");
                    return Ok(GatewayResponse {
                        data,
                        from_cache: true,
                        quota: decision,
                    });
                }
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "cache read failed"),
            }
        }

        let data = self.client.fetch(request, &token).await?;

        if let Some(key) = &cache_key
            && let Err(e) = self.cache.set(key, &data, &caller.subject_secret, None).await
        {
            warn!(key = %key, error = %e, "cache write failed");
        }

        Ok(GatewayResponse {
            data,
            from_cache: false,
            quota: decision,
        })
    }

    /// Drops every cached response for one usage point.
    pub async fn purge_usage_point(&self, usage_point_id: &str) -> Result<u64, CacheError> {
        self.cache.purge_subject(usage_point_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_and_guidance() {
        let err = GatewayError::from(QuotaExceeded {
            tier: CacheTier::Uncached,
            current: 10,
            limit: 10,
        });
        assert_eq!(err.code(), "RATE_LIMIT_EXCEEDED");
        assert_eq!(
            err.to_string(),
            "Daily rate limit exceeded (10/10). Use cache to increase limit."
        );

        let err = GatewayError::AccessDenied(TokenError::ConflictUnresolved("metering".into()));
        assert_eq!(err.code(), "ACCESS_DENIED");
    }

    #[test]
    fn test_caller_debug_hides_secret() {
        let caller = Caller::new("u1", "super-secret").privileged(true);
        let printed = format!("{caller:?}");
        assert!(printed.contains("u1"));
        assert!(!printed.contains("super-secret"));
    }
}
