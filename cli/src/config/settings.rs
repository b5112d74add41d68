//! Application configuration settings.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// Main configuration for curator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CuratorConfig {
    /// Sign-in settings.
    pub auth: AuthConfig,
    /// Provider API client settings.
    pub api: ApiConfig,
    /// Credential store settings.
    pub storage: StorageConfig,
}

/// Sign-in flow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// How long an interactive sign-in may wait for the browser redirect.
    pub login_timeout_secs: u64,
    /// Delay between answering the redirect and closing the listener.
    pub grace_period_ms: u64,
    /// Wait before retrying a busy redirect port.
    pub bind_retry_delay_ms: u64,
    /// Organizational (Microsoft) identity settings.
    pub org: OrgProviderConfig,
    /// Consumer (Google) identity settings.
    pub consumer: ConsumerProviderConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            login_timeout_secs: 300,
            grace_period_ms: 3000,
            bind_retry_delay_ms: 1000,
            org: OrgProviderConfig::default(),
            consumer: ConsumerProviderConfig::default(),
        }
    }
}

impl AuthConfig {
    #[must_use]
    pub const fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    #[must_use]
    pub const fn bind_retry_delay(&self) -> Duration {
        Duration::from_millis(self.bind_retry_delay_ms)
    }
}

/// Organizational identity provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrgProviderConfig {
    /// Application (client) ID registered with the identity platform.
    pub client_id: String,
    /// Authority the authorize and token endpoints are derived from.
    #[serde(with = "url_serde")]
    pub authority: Url,
    /// Scopes requested on sign-in.
    pub scopes: Vec<String>,
    /// Loopback port the redirect URI points at.
    pub redirect_port: u16,
    /// Loopback path the redirect URI points at.
    pub redirect_path: String,
}

impl Default for OrgProviderConfig {
    fn default() -> Self {
        Self {
            client_id: "d4769f4f-14be-444b-9934-f859662bc020".to_string(),
            authority: Url::parse("https://login.microsoftonline.com/organizations")
                .expect("valid default URL"),
            scopes: ["openid", "profile", "offline_access", "User.Read", "Files.ReadWrite"]
                .map(String::from)
                .to_vec(),
            redirect_port: 3000,
            redirect_path: "/".to_string(),
        }
    }
}

/// Consumer identity provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerProviderConfig {
    /// OAuth client ID of the installed app.
    pub client_id: String,
    /// Installed-app client secret, when the provider issues one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Authorization endpoint.
    #[serde(with = "url_serde")]
    pub auth_url: Url,
    /// Token endpoint.
    #[serde(with = "url_serde")]
    pub token_url: Url,
    /// OpenID Connect userinfo endpoint.
    #[serde(with = "url_serde")]
    pub userinfo_url: Url,
    /// Scopes requested on sign-in.
    pub scopes: Vec<String>,
    /// Loopback port the redirect URI points at.
    pub redirect_port: u16,
    /// Loopback path the redirect URI points at.
    pub redirect_path: String,
}

impl Default for ConsumerProviderConfig {
    fn default() -> Self {
        Self {
            client_id: "XXXXXXXXXXXXX.apps.googleusercontent.com".to_string(),
            client_secret: None,
            auth_url: Url::parse("https://accounts.google.com/o/oauth2/v2/auth")
                .expect("valid default URL"),
            token_url: Url::parse("https://oauth2.googleapis.com/token")
                .expect("valid default URL"),
            userinfo_url: Url::parse("https://openidconnect.googleapis.com/v1/userinfo")
                .expect("valid default URL"),
            scopes: [
                "openid",
                "email",
                "profile",
                "https://www.googleapis.com/auth/drive.readonly",
            ]
            .map(String::from)
            .to_vec(),
            redirect_port: 3001,
            redirect_path: "/".to_string(),
        }
    }
}

/// Provider API client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Microsoft Graph base URL.
    #[serde(with = "url_serde")]
    pub graph_url: Url,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Maximum number of retries for transient failures.
    pub max_retries: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            graph_url: Url::parse("https://graph.microsoft.com/v1.0/").expect("valid default URL"),
            timeout_secs: 30,
            max_retries: 3,
        }
    }
}

/// Credential store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Store file location; the platform data directory when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Custom serde module for URL serialization.
mod url_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use url::Url;

    pub fn serialize<S>(url: &Url, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(url.as_str())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Url, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Url::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Environment variables that can override configuration.
pub mod env {
    pub const ORG_CLIENT_ID: &str = "CURATOR_ORG_CLIENT_ID";
    pub const CONSUMER_CLIENT_ID: &str = "CURATOR_CONSUMER_CLIENT_ID";
    pub const CONSUMER_CLIENT_SECRET: &str = "CURATOR_CONSUMER_CLIENT_SECRET";
    pub const STORE_PATH: &str = "CURATOR_STORE_PATH";
    pub const LOG_LEVEL: &str = "CURATOR_LOG";
}

impl CuratorConfig {
    /// Apply environment variable overrides to the configuration.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides looked up through `lookup`. Empty values are ignored.
    #[must_use]
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(id) = var(env::ORG_CLIENT_ID) {
            self.auth.org.client_id = id;
        }
        if let Some(id) = var(env::CONSUMER_CLIENT_ID) {
            self.auth.consumer.client_id = id;
        }
        if let Some(secret) = var(env::CONSUMER_CLIENT_SECRET) {
            self.auth.consumer.client_secret = Some(secret);
        }
        if let Some(path) = var(env::STORE_PATH) {
            self.storage.path = Some(PathBuf::from(path));
        }

        self
    }
}
