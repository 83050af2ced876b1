//! Metering data provider client.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use reqwest::header::ACCEPT;
use serde_json::Value;
use tracing::{debug, instrument};
use wattgate_core::NewCredential;

use super::{TokenResponse, Throttle, UpstreamError, http_client, send_json};
use crate::config::MeteringConfig;
use crate::token_broker::CredentialIssuer;

const UPSTREAM: &str = "metering";

/// Default token lifetime when the issuer omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Resources exposed by the metering provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeteringResource {
    UsagePoints,
    DailyConsumption,
    ConsumptionLoadCurve,
    DailyMaxPower,
    DailyProduction,
    ProductionLoadCurve,
    Contract,
    Address,
    Identity,
    ContactData,
}

impl MeteringResource {
    pub const ALL: [MeteringResource; 10] = [
        Self::UsagePoints,
        Self::DailyConsumption,
        Self::ConsumptionLoadCurve,
        Self::DailyMaxPower,
        Self::DailyProduction,
        Self::ProductionLoadCurve,
        Self::Contract,
        Self::Address,
        Self::Identity,
        Self::ContactData,
    ];

    /// Path below the provider's base URL.
    pub fn path(&self) -> &'static str {
        match self {
            Self::UsagePoints => "/customers_upc/v5/usage_points",
            Self::DailyConsumption => "/metering_data_dc/v5/daily_consumption",
            Self::ConsumptionLoadCurve => "/metering_data_clc/v5/consumption_load_curve",
            Self::DailyMaxPower => "/metering_data_dcmp/v5/daily_consumption_max_power",
            Self::DailyProduction => "/metering_data_dp/v5/daily_production",
            Self::ProductionLoadCurve => "/metering_data_plc/v5/production_load_curve",
            Self::Contract => "/customers_upc/v5/usage_points/contracts",
            Self::Address => "/customers_upa/v5/usage_points/addresses",
            Self::Identity => "/customers_i/v5/identity",
            Self::ContactData => "/customers_cd/v5/contact_data",
        }
    }

    /// Gateway route template, used as the quota endpoint.
    pub fn route_template(&self) -> &'static str {
        match self {
            Self::UsagePoints => "/metering/usage_points",
            Self::DailyConsumption => "/metering/consumption/daily/{usage_point_id}",
            Self::ConsumptionLoadCurve => "/metering/consumption/detail/{usage_point_id}",
            Self::DailyMaxPower => "/metering/power/{usage_point_id}",
            Self::DailyProduction => "/metering/production/daily/{usage_point_id}",
            Self::ProductionLoadCurve => "/metering/production/detail/{usage_point_id}",
            Self::Contract => "/metering/contract/{usage_point_id}",
            Self::Address => "/metering/address/{usage_point_id}",
            Self::Identity => "/metering/customer/{usage_point_id}",
            Self::ContactData => "/metering/contact/{usage_point_id}",
        }
    }

    /// Operation name used in response cache keys.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::UsagePoints => "usage_points",
            Self::DailyConsumption => "consumption_daily",
            Self::ConsumptionLoadCurve => "consumption_detail",
            Self::DailyMaxPower => "power",
            Self::DailyProduction => "production_daily",
            Self::ProductionLoadCurve => "production_detail",
            Self::Contract => "contract",
            Self::Address => "address",
            Self::Identity => "customer",
            Self::ContactData => "contact",
        }
    }

    /// Whether the resource is queried over a `start`/`end` date range.
    pub fn takes_date_range(&self) -> bool {
        matches!(
            self,
            Self::DailyConsumption
                | Self::ConsumptionLoadCurve
                | Self::DailyMaxPower
                | Self::DailyProduction
                | Self::ProductionLoadCurve
        )
    }

    pub fn from_operation(operation: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.operation() == operation)
    }
}

impl std::fmt::Display for MeteringResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.operation())
    }
}

/// One resource fetch on behalf of a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeteringRequest {
    pub resource: MeteringResource,
    pub usage_point_id: String,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    /// Accept a cached answer (and count on the cached tier).
    pub use_cache: bool,
}

impl MeteringRequest {
    pub fn new(resource: MeteringResource, usage_point_id: impl Into<String>) -> Self {
        Self {
            resource,
            usage_point_id: usage_point_id.into(),
            start: None,
            end: None,
            use_cache: false,
        }
    }

    #[must_use]
    pub fn with_range(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    #[must_use]
    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.usage_point_id.is_empty() {
            return Err("usage_point_id must not be empty".into());
        }
        if self.usage_point_id.contains(':') {
            return Err("usage_point_id must not contain ':'".into());
        }
        match (self.resource.takes_date_range(), self.start, self.end) {
            (true, Some(start), Some(end)) if start > end => {
                Err(format!("start {start} is after end {end}"))
            }
            (true, Some(_), Some(_)) | (false, None, None) => Ok(()),
            (true, _, _) => Err(format!("{} requires start and end", self.resource)),
            (false, _, _) => Err(format!("{} takes no date range", self.resource)),
        }
    }

    /// Date parameters as sent upstream and used in cache keys.
    pub fn range_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::with_capacity(2);
        if let Some(start) = self.start {
            params.push(("start", start.format("%Y-%m-%d").to_string()));
        }
        if let Some(end) = self.end {
            params.push(("end", end.format("%Y-%m-%d").to_string()));
        }
        params
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::with_capacity(3);
        if self.resource != MeteringResource::UsagePoints {
            query.push(("usage_point_id", self.usage_point_id.clone()));
        }
        query.extend(self.range_params());
        query
    }
}

/// Client for the metering provider.
///
/// Every request, token requests included, waits on the shared throttle.
#[derive(Debug)]
pub struct MeteringClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
    throttle: Throttle,
}

impl MeteringClient {
    pub fn new(cfg: &MeteringConfig) -> Result<Self, UpstreamError> {
        Ok(Self {
            http: http_client(cfg.timeout_ms)?,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
            scope: cfg.scope.clone(),
            throttle: Throttle::per_second(cfg.requests_per_second),
        })
    }

    fn token_url(&self) -> String {
        format!("{}/oauth2/v3/token", self.base_url)
    }

    /// Machine-to-machine token (client id and secret as basic auth).
    #[instrument(skip(self))]
    pub async fn client_credentials_token(&self) -> Result<TokenResponse, UpstreamError> {
        self.throttle.acquire().await;
        let request = self
            .http
            .post(self.token_url())
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")]);
        send_json(UPSTREAM, request).await
    }

    /// Exchanges an authorization code returned by the consent flow.
    #[instrument(skip(self, code))]
    pub async fn exchange_authorization_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, UpstreamError> {
        self.throttle.acquire().await;
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("redirect_uri", redirect_uri),
        ];
        let request = self.http.post(self.token_url()).form(&params);
        send_json(UPSTREAM, request).await
    }

    #[instrument(skip_all)]
    pub async fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<TokenResponse, UpstreamError> {
        self.throttle.acquire().await;
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let request = self.http.post(self.token_url()).form(&params);
        send_json(UPSTREAM, request).await
    }

    /// Fetches one resource with a bearer token and returns the raw JSON body.
    #[instrument(skip(self, access_token), fields(resource = %request.resource))]
    pub async fn fetch(
        &self,
        request: &MeteringRequest,
        access_token: &str,
    ) -> Result<Value, UpstreamError> {
        self.throttle.acquire().await;
        let url = format!("{}{}", self.base_url, request.resource.path());
        debug!(url = %url, "metering request");
        let builder = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .header(ACCEPT, "application/json")
            .query(&request.query());
        send_json(UPSTREAM, builder).await
    }
}

#[async_trait]
impl CredentialIssuer for MeteringClient {
    fn scope(&self) -> &str {
        &self.scope
    }

    async fn issue(&self) -> Result<NewCredential, UpstreamError> {
        let issued_at = Utc::now();
        let token = self.client_credentials_token().await?;
        let lifetime = token.lifetime(DEFAULT_EXPIRES_IN_SECS)?;
        Ok(NewCredential::issued(
            self.scope.clone(),
            token.access_token,
            token.token_type,
            token.scope,
            lifetime.num_seconds(),
            issued_at,
        ))
    }
}
