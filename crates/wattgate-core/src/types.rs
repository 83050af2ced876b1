//! Durable records kept by the gateway.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Holder value of the shared machine credential.
///
/// Credentials are keyed by `(scope, holder)`; the gateway only ever stores the
/// shared row, never per-user rows.
pub const SHARED_HOLDER: &str = "__shared__";

// ============================================================================
// Credential
// ============================================================================

/// A persisted bearer credential for one upstream scope.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub scope: String,
    pub holder: String,
    pub access_token: String,
    pub token_type: String,
    /// Scope string returned by the issuer, if any.
    pub granted_scope: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    /// Returns `true` while `now` is strictly before the expiry.
    ///
    /// No grace margin is applied: the upstream-declared lifetime is used as is.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("scope", &self.scope)
            .field("holder", &self.holder)
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("granted_scope", &self.granted_scope)
            .field("expires_at", &self.expires_at)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// A freshly issued credential that has not been persisted yet.
#[derive(Clone, PartialEq, Eq)]
pub struct NewCredential {
    pub scope: String,
    pub access_token: String,
    pub token_type: String,
    pub granted_scope: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl NewCredential {
    /// Builds a credential that expires `expires_in_secs` after `issued_at`.
    /// Lifetimes past the end of representable time saturate there.
    #[must_use]
    pub fn issued(
        scope: impl Into<String>,
        access_token: impl Into<String>,
        token_type: impl Into<String>,
        granted_scope: Option<String>,
        expires_in_secs: i64,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            scope: scope.into(),
            access_token: access_token.into(),
            token_type: token_type.into(),
            granted_scope,
            expires_at: Duration::try_seconds(expires_in_secs.max(0))
                .and_then(|lifetime| issued_at.checked_add_signed(lifetime))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Materialises the stored row, stamping both timestamps with `now`.
    #[must_use]
    pub fn into_credential(self, now: DateTime<Utc>) -> Credential {
        Credential {
            scope: self.scope,
            holder: SHARED_HOLDER.to_string(),
            access_token: self.access_token,
            token_type: self.token_type,
            granted_scope: self.granted_scope,
            expires_at: self.expires_at,
            created_at: now,
            updated_at: now,
        }
    }
}

impl fmt::Debug for NewCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewCredential")
            .field("scope", &self.scope)
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// ============================================================================
// Calendar
// ============================================================================

/// Daily tariff classification published by the grid operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DayCategory {
    Blue,
    White,
    Red,
}

impl DayCategory {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blue => "BLUE",
            Self::White => "WHITE",
            Self::Red => "RED",
        }
    }

    #[must_use]
    pub fn is_red(&self) -> bool {
        matches!(self, Self::Red)
    }
}

impl fmt::Display for DayCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a category label is not one of the published values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown day category: {0}")]
pub struct UnknownCategory(pub String);

impl FromStr for DayCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BLUE" => Ok(Self::Blue),
            "WHITE" => Ok(Self::White),
            "RED" => Ok(Self::Red),
            _ => Err(UnknownCategory(s.to_string())),
        }
    }
}

/// One classified calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarDay {
    /// Canonical date, derived from the end boundary of the upstream interval.
    pub date: NaiveDate,
    pub category: DayCategory,
    /// Last-update timestamp declared by the upstream for this entry.
    pub upstream_updated_at: Option<DateTime<Utc>>,
    /// When this row was last written locally.
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Sync markers
// ============================================================================

/// Last successful cycle of one sync source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMarker {
    pub source: String,
    pub last_success_at: DateTime<Utc>,
}

impl SyncMarker {
    /// Returns `true` when the marker is younger than `min_interval`.
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>, min_interval: Duration) -> bool {
        now - self.last_success_at < min_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_credential_expiry_has_no_margin() {
        let cred = NewCredential::issued("metering", "tok", "Bearer", None, 3600, at(10, 0, 0))
            .into_credential(at(10, 0, 0));

        assert!(cred.is_valid_at(at(10, 59, 59)));
        assert!(!cred.is_valid_at(at(11, 0, 0)));
        assert_eq!(cred.holder, SHARED_HOLDER);
    }

    #[test]
    fn test_negative_lifetime_is_clamped() {
        let cred = NewCredential::issued("metering", "tok", "Bearer", None, -5, at(10, 0, 0));
        assert_eq!(cred.expires_at, at(10, 0, 0));
    }

    #[test]
    fn test_huge_lifetime_saturates() {
        let cred = NewCredential::issued("metering", "tok", "Bearer", None, i64::MAX, at(10, 0, 0));
        assert_eq!(cred.expires_at, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_credential_debug_redacts_token() {
        let cred = NewCredential::issued("metering", "super-secret", "Bearer", None, 60, at(0, 0, 0));
        let printed = format!("{cred:?}");
        assert!(!printed.contains("super-secret"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_day_category_parsing() {
        assert_eq!("BLUE".parse::<DayCategory>().unwrap(), DayCategory::Blue);
        assert_eq!("white".parse::<DayCategory>().unwrap(), DayCategory::White);
        assert_eq!(" RED ".parse::<DayCategory>().unwrap(), DayCategory::Red);
        assert!("PURPLE".parse::<DayCategory>().is_err());
    }

    #[test]
    fn test_day_category_serde_uses_published_labels() {
        let json = serde_json::to_string(&DayCategory::White).unwrap();
        assert_eq!(json, "\"WHITE\"");
        let back: DayCategory = serde_json::from_str("\"RED\"").unwrap();
        assert_eq!(back, DayCategory::Red);
    }

    #[test]
    fn test_marker_freshness() {
        let marker = SyncMarker {
            source: "calendar.near_term".into(),
            last_success_at: at(10, 0, 0),
        };
        assert!(marker.is_fresh(at(10, 30, 0), Duration::hours(1)));
        assert!(!marker.is_fresh(at(11, 0, 0), Duration::hours(1)));
    }
}
