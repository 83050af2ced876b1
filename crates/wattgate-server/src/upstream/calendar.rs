//! Grid operator calendar feed client.
//!
//! The feed publishes one entry per day, labelled by an interval in local
//! time with an explicit offset. The client-credentials token is cached in
//! process and refreshed a fixed margin before it expires.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::{TokenResponse, UpstreamError, http_client, send_json};
use crate::config::CalendarConfig;

const UPSTREAM: &str = "calendar";

const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Range bounds format expected by the feed, e.g. `2024-01-15T00:00:00+01:00`.
pub const RANGE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

/// One published day, as sent by the feed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CalendarEntry {
    pub start_date: String,
    pub end_date: String,
    pub value: String,
    #[serde(default)]
    pub updated_date: Option<String>,
}

#[derive(Deserialize)]
struct CalendarResponse {
    tempo_like_calendars: CalendarValues,
}

#[derive(Deserialize)]
struct CalendarValues {
    #[serde(default)]
    values: Vec<CalendarEntry>,
}

/// Source of calendar entries for a local-time range (bounds inclusive).
#[async_trait]
pub trait CalendarSource: Send + Sync {
    async fn fetch_range(
        &self,
        start: DateTime<Tz>,
        end: DateTime<Tz>,
    ) -> Result<Vec<CalendarEntry>, UpstreamError>;
}

/// Formats a range bound the way the feed expects it.
pub fn format_bound<Z>(at: &DateTime<Z>) -> String
where
    Z: TimeZone,
    Z::Offset: std::fmt::Display,
{
    at.format(RANGE_FORMAT).to_string()
}

struct CachedToken {
    access_token: String,
    refresh_after: DateTime<Utc>,
}

pub struct CalendarClient {
    http: reqwest::Client,
    token_url: String,
    calendar_url: String,
    client_id: String,
    client_secret: String,
    refresh_margin: Duration,
    token: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for CalendarClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalendarClient")
            .field("token_url", &self.token_url)
            .field("calendar_url", &self.calendar_url)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl CalendarClient {
    pub fn new(cfg: &CalendarConfig) -> Result<Self, UpstreamError> {
        let base = cfg.base_url.trim_end_matches('/');
        Ok(Self {
            http: http_client(cfg.timeout_ms)?,
            token_url: format!("{base}/token/oauth/"),
            calendar_url: format!(
                "{base}/open_api/tempo_like_supply_contract/v1/tempo_like_calendars"
            ),
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
            refresh_margin: i64::try_from(cfg.token_refresh_margin_secs)
                .ok()
                .and_then(Duration::try_seconds)
                .ok_or_else(|| {
                    UpstreamError::Config(format!(
                        "token_refresh_margin_secs {} out of range",
                        cfg.token_refresh_margin_secs
                    ))
                })?,
            token: Mutex::new(None),
        })
    }

    /// Returns the cached token, requesting a new one once the refresh
    /// margin is reached. Concurrent callers wait for a single request.
    pub async fn access_token(&self) -> Result<String, UpstreamError> {
        let mut cached = self.token.lock().await;
        let now = Utc::now();
        if let Some(token) = cached.as_ref()
            && now < token.refresh_after
        {
            return Ok(token.access_token.clone());
        }

        let request = self
            .http
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")]);
        let response: TokenResponse = send_json(UPSTREAM, request).await?;

        let lifetime = response.lifetime(DEFAULT_EXPIRES_IN_SECS)?;
        let refresh_after = now
            .checked_add_signed(lifetime)
            .and_then(|t| t.checked_sub_signed(self.refresh_margin))
            .ok_or_else(|| UpstreamError::decode("token lifetime out of range"))?;
        debug!(%refresh_after, "calendar token refreshed");

        let access_token = response.access_token;
        *cached = Some(CachedToken {
            access_token: access_token.clone(),
            refresh_after,
        });
        Ok(access_token)
    }

    /// Forgets the cached token so the next call requests a new one.
    pub async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }
}

#[async_trait]
impl CalendarSource for CalendarClient {
    #[instrument(skip_all, fields(start = %format_bound(&start), end = %format_bound(&end)))]
    async fn fetch_range(
        &self,
        start: DateTime<Tz>,
        end: DateTime<Tz>,
    ) -> Result<Vec<CalendarEntry>, UpstreamError> {
        let token = self.access_token().await?;
        let query = [
            ("start_date", format_bound(&start)),
            ("end_date", format_bound(&end)),
        ];
        let request = self
            .http
            .get(&self.calendar_url)
            .bearer_auth(token)
            .header(ACCEPT, "application/json")
            .query(&query);

        match send_json::<CalendarResponse>(UPSTREAM, request).await {
            Ok(body) => Ok(body.tempo_like_calendars.values),
            Err(e) => {
                if e.is_unauthorized() {
                    self.invalidate_token().await;
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::Paris;

    #[test]
    fn test_bounds_carry_local_offset() {
        let winter = Paris.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        assert_eq!(format_bound(&winter), "2024-01-15T00:00:00+01:00");

        let summer = Paris.with_ymd_and_hms(2024, 7, 1, 23, 59, 59).unwrap();
        assert_eq!(format_bound(&summer), "2024-07-01T23:59:59+02:00");
    }

    #[test]
    fn test_response_shape() {
        let body = r#"{
            "tempo_like_calendars": {
                "start_date": "2024-01-14T00:00:00+01:00",
                "end_date": "2024-01-16T00:00:00+01:00",
                "values": [
                    {
                        "start_date": "2024-01-14T00:00:00+01:00",
                        "end_date": "2024-01-15T00:00:00+01:00",
                        "value": "WHITE",
                        "updated_date": "2024-01-14T10:20:00+01:00"
                    }
                ]
            }
        }"#;
        let parsed: CalendarResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.tempo_like_calendars.values.len(), 1);
        assert_eq!(parsed.tempo_like_calendars.values[0].value, "WHITE");
    }
}
