//! HTTP clients for the two third-party APIs.
//!
//! - [`metering`]: the metering data provider (OAuth2 token endpoint plus
//!   bearer-authenticated resources), throttled client-side.
//! - [`calendar`]: the grid operator's day classification feed, with its own
//!   in-process token cache.
//!
//! Every request carries a client-side timeout. Failures are reported as
//! [`UpstreamError`] and are never retried here.

pub mod calendar;
pub mod metering;
pub mod throttle;

use std::time::Instant;

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::metrics;

pub use calendar::{CalendarClient, CalendarEntry, CalendarSource};
pub use metering::{MeteringClient, MeteringRequest, MeteringResource};
pub use throttle::Throttle;

/// Errors returned by the upstream clients.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// Connection, TLS or timeout failure.
    #[error("upstream request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// The upstream answered with a non-success status.
    #[error("upstream returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body did not have the expected shape.
    #[error("unexpected upstream response: {0}")]
    Decode(String),

    #[error("upstream client misconfigured: {0}")]
    Config(String),
}

impl UpstreamError {
    #[must_use]
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// HTTP status of the failed call, if the upstream answered at all.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Network(e) if e.is_timeout())
    }

    /// `true` for 401/403 answers.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self.status(), Some(401 | 403))
    }
}

/// OAuth2 token endpoint answer shared by both upstreams.
#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".into()
}

/// Longest token lifetime accepted from an issuer.
const MAX_TOKEN_LIFETIME_SECS: i64 = 366 * 24 * 60 * 60;

impl TokenResponse {
    /// Token lifetime, `default_secs` when the issuer omits it. Negative
    /// values count as already expired; values beyond a year are rejected.
    pub fn lifetime(&self, default_secs: i64) -> Result<chrono::Duration, UpstreamError> {
        let secs = self.expires_in.unwrap_or(default_secs).max(0);
        if secs > MAX_TOKEN_LIFETIME_SECS {
            return Err(UpstreamError::decode(format!(
                "token expires_in {secs} exceeds {MAX_TOKEN_LIFETIME_SECS} seconds"
            )));
        }
        chrono::Duration::try_seconds(secs)
            .ok_or_else(|| UpstreamError::decode(format!("token expires_in {secs} out of range")))
    }
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

pub(crate) fn http_client(timeout_ms: u64) -> Result<reqwest::Client, UpstreamError> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_millis(timeout_ms))
        .build()
        .map_err(|e| UpstreamError::Config(e.to_string()))
}

/// Sends `request`, records the call and decodes a JSON success body.
pub(crate) async fn send_json<T: DeserializeOwned>(
    upstream: &'static str,
    request: reqwest::RequestBuilder,
) -> Result<T, UpstreamError> {
    let started = Instant::now();
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            metrics::record_upstream_request(upstream, 0, started.elapsed());
            return Err(e.into());
        }
    };

    let status = response.status();
    metrics::record_upstream_request(upstream, status.as_u16(), started.elapsed());

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(upstream, status = status.as_u16(), "upstream call failed");
        return Err(UpstreamError::Status {
            status: status.as_u16(),
            body,
        });
    }

    response
        .json::<T>()
        .await
        .map_err(|e| UpstreamError::decode(e.to_string()))
}
