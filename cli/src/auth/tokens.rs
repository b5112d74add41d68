//! Token and account types shared by both identity providers.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// How long before `expires_at` an access token is already treated as expired.
pub const EXPIRY_SKEW_MINUTES: i64 = 5;

/// Scopes granted implicitly by OpenID Connect providers.
///
/// Providers frequently leave these out of the `scope` field of a token
/// response, so they never count against scope coverage.
const RESERVED_SCOPES: &[&str] = &["openid", "profile", "offline_access", "email"];

/// Supported identity providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Organizational (Microsoft-style) account.
    Org,
    /// Consumer (Google-style) account.
    Consumer,
}

impl Provider {
    /// All providers, in display order.
    pub const ALL: [Self; 2] = [Self::Org, Self::Consumer];

    /// Human readable provider name for messages.
    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Org => "Microsoft",
            Self::Consumer => "Google",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Org => write!(f, "org"),
            Self::Consumer => write!(f, "consumer"),
        }
    }
}

impl TryFrom<&str> for Provider {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "org" | "microsoft" => Ok(Self::Org),
            "consumer" | "google" => Ok(Self::Consumer),
            _ => Err(format!("Unknown provider: {s}")),
        }
    }
}

/// An account known to a provider's local cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Provider-internal handle that disambiguates cached accounts.
    pub home_account_id: String,
    /// Stable user-facing identifier (email or UPN).
    pub username: String,
    /// Display name, when the provider shares one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Directory tenant (organizational accounts only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl Account {
    /// Placeholder identity for a credential whose profile could not be fetched.
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            home_account_id: "unknown".to_string(),
            username: "unknown".to_string(),
            name: None,
            tenant_id: None,
        }
    }
}

impl std::fmt::Display for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} <{}>", self.username),
            None => write!(f, "{}", self.username),
        }
    }
}

/// A usable credential for one provider account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Provider that issued the tokens.
    pub provider: Provider,
    /// Short-lived access token.
    pub access_token: String,
    /// Long-lived refresh token (if issued).
    pub refresh_token: Option<String>,
    /// When the access token expires.
    pub expires_at: DateTime<Utc>,
    /// The account the tokens belong to.
    pub account: Account,
    /// Granted scopes.
    pub scopes: Vec<String>,
}

impl Credential {
    /// Check if the token can be refreshed.
    #[must_use]
    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }
}

/// Compute an absolute expiry from a token lifetime.
#[must_use]
pub fn expires_at_from(
    issued_at: DateTime<Utc>,
    expires_in: Option<std::time::Duration>,
) -> DateTime<Utc> {
    // Providers that omit expires_in are treated as issuing one-hour tokens.
    let lifetime = expires_in
        .and_then(|d| Duration::from_std(d).ok())
        .unwrap_or_else(|| Duration::hours(1));
    issued_at + lifetime
}

/// Whether a token expiring at `expires_at` must be refreshed at `now`.
#[must_use]
pub fn is_expired_at(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    expires_at <= now + Duration::minutes(EXPIRY_SKEW_MINUTES)
}

/// Split a space-delimited scope string.
#[must_use]
pub fn parse_scopes(scope: &str) -> Vec<String> {
    scope.split_whitespace().map(str::to_string).collect()
}

/// Check whether `granted` covers every non-reserved scope in `requested`.
///
/// Comparison is case-insensitive.
#[must_use]
pub fn scopes_cover(granted: &[String], requested: &[String]) -> bool {
    requested
        .iter()
        .filter(|s| !RESERVED_SCOPES.contains(&s.to_lowercase().as_str()))
        .all(|r| granted.iter().any(|g| g.eq_ignore_ascii_case(r)))
}
