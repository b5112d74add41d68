//! Error types and result aliases for curator.
//!
//! This module provides the error taxonomy of the account-connection
//! subsystem:
//! - Interactive sign-in failures (code exchange, port binding, timeouts)
//! - Silent acquisition failures, carrying a reason so callers can tell an
//!   expired session from an account that was never connected
//! - Persistence failures, which are logged and never fatal

use thiserror::Error;

use crate::auth::Provider;

/// Why a silent token acquisition did not produce a token.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SilentAuthFailure {
    /// Nothing is cached for this provider.
    #[error("no cached credential")]
    NoCredential,

    /// A credential is cached but has no refresh token to renew it with.
    #[error("cached credential has no refresh token")]
    NoRefreshToken,

    /// The provider refused the refresh token (revoked, expired, consent needed).
    #[error("refresh rejected by provider: {code}: {description}")]
    Rejected {
        /// OAuth error code, e.g. `invalid_grant`.
        code: String,
        /// Provider supplied description.
        description: String,
    },

    /// The refresh request never got a provider answer.
    #[error("refresh request failed: {0}")]
    Network(String),
}

impl SilentAuthFailure {
    /// Returns `true` when the user had a session that lapsed, as opposed to
    /// never having connected the account.
    #[must_use]
    pub const fn is_session_expired(&self) -> bool {
        matches!(self, Self::NoRefreshToken | Self::Rejected { .. })
    }
}

/// Main error type for curator operations.
///
/// Use [`requires_reauth`](Self::requires_reauth) and
/// [`is_retriable`](Self::is_retriable) to pick a handling strategy.
#[derive(Error, Debug)]
pub enum CuratorError {
    /// The authorization code could not be exchanged for tokens.
    #[error("{provider} sign-in failed: {description} ({code})")]
    AuthExchange {
        /// Provider the exchange was made against.
        provider: Provider,
        /// OAuth error code, or a local classification.
        code: String,
        /// Provider supplied description.
        description: String,
    },

    /// No usable token could be obtained without user interaction.
    #[error("Not signed in: {0}. Run 'curator auth login' to connect the account.")]
    SilentAuth(#[from] SilentAuthFailure),

    /// The loopback redirect listener could not bind its port.
    #[error("Could not listen for the sign-in redirect on port {port}: {source}. Close any other sign-in attempt and try again.")]
    PortBind {
        /// The port that was requested.
        port: u16,
        /// The final bind error.
        #[source]
        source: std::io::Error,
    },

    /// The user never completed the browser flow.
    #[error("{provider} sign-in timed out after {secs} seconds. Run 'curator auth login' to try again.")]
    LoginTimeout {
        /// Provider the sign-in was started for.
        provider: Provider,
        /// The configured timeout.
        secs: u64,
    },

    /// The provider redirected back with an error (e.g. the user cancelled).
    #[error("Authorization was denied: {description}")]
    AuthorizationDenied {
        /// OAuth error code, e.g. `access_denied`.
        error: String,
        /// Provider supplied description.
        description: String,
    },

    /// An interactive sign-in ended without an account.
    #[error("Sign-in failed: {0}")]
    SignInFailed(String),

    /// A redirect arrived whose `state` matches no pending sign-in.
    #[error("Sign-in response did not match any pending request (state mismatch). Start the sign-in again.")]
    StateMismatch,

    /// The credential store could not be read or written.
    #[error("Credential cache I/O failed: {0}")]
    CacheIo(String),

    /// The system browser could not be launched.
    #[error("Could not open the browser: {0}")]
    Browser(String),

    /// API returned a non-success status code.
    #[error("API request failed ({status}): {message}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Error message from the API.
        message: String,
    },

    /// API returned 401 Unauthorized.
    #[error("The provider API rejected the access token (401). Run 'curator auth login' to re-authenticate.")]
    Unauthorized,

    /// Request timed out.
    #[error("Request timed out. The server may be slow or unreachable. Try again later.")]
    Timeout,

    /// Provider endpoint unreachable.
    #[error("Service is unavailable. Check your network connection or try again later.")]
    Unavailable,

    /// Network error during HTTP request.
    #[error("Network error: {0}. Check your internet connection.")]
    Network(String),

    /// General configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failed to read configuration file.
    #[error("Failed to read configuration file: {0}. Check file permissions and format.")]
    ConfigRead(String),

    /// Failed to write configuration file.
    #[error("Failed to write configuration file: {0}. Check directory permissions.")]
    ConfigWrite(String),

    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON or TOML serialization/deserialization failed.
    #[error("Data serialization error: {0}. This may indicate corrupted data.")]
    Serialization(String),

    /// URL parsing failed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl CuratorError {
    /// Checks if this error can be resolved by signing in again.
    #[must_use]
    pub const fn requires_reauth(&self) -> bool {
        matches!(
            self,
            Self::SilentAuth(_)
                | Self::Unauthorized
                | Self::AuthorizationDenied { .. }
                | Self::StateMismatch
                | Self::LoginTimeout { .. }
        )
    }

    /// Checks if this error is transient and the operation might succeed on retry.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout | Self::Unavailable | Self::PortBind { .. }
        )
    }

    /// Process exit status: 2 when signing in again would help, 75
    /// (`EX_TEMPFAIL`) when a retry might, 1 otherwise.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        if self.requires_reauth() {
            2
        } else if self.is_retriable() {
            75
        } else {
            1
        }
    }
}

/// Result type alias using [`CuratorError`].
pub type Result<T> = std::result::Result<T, CuratorError>;

impl From<serde_json::Error> for CuratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON error: {err}"))
    }
}

impl From<toml::de::Error> for CuratorError {
    fn from(err: toml::de::Error) -> Self {
        Self::ConfigRead(format!("TOML parse error: {err}"))
    }
}

impl From<toml::ser::Error> for CuratorError {
    fn from(err: toml::ser::Error) -> Self {
        Self::ConfigWrite(format!("TOML serialize error: {err}"))
    }
}

impl From<reqwest::Error> for CuratorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Unavailable
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<reqwest_middleware::Error> for CuratorError {
    fn from(err: reqwest_middleware::Error) -> Self {
        match err {
            reqwest_middleware::Error::Reqwest(e) => e.into(),
            reqwest_middleware::Error::Middleware(e) => Self::Network(e.to_string()),
        }
    }
}
