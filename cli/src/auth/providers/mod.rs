//! OAuth provider implementations.
//!
//! Both providers speak the standard authorization-code flow with PKCE; the
//! pieces they share live here.

pub mod consumer;
pub mod org;

use std::borrow::Cow;

use oauth2::basic::{
    BasicErrorResponse, BasicRevocationErrorResponse, BasicTokenIntrospectionResponse,
    BasicTokenType,
};
use oauth2::{
    AuthType, AuthUrl, AuthorizationRequest, Client, ClientId, ClientSecret, CsrfToken,
    ExtraTokenFields, PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RequestTokenError, Scope,
    StandardRevocableToken, StandardTokenResponse, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::auth::tokens::{expires_at_from, parse_scopes, Provider};
use crate::error::{CuratorError, Result, SilentAuthFailure};

pub use consumer::{ConsumerAuthClient, ConsumerKeys, ConsumerProfile};
pub use org::OrgAuthClient;

/// Extra token response fields: the OIDC `id_token`, when issued.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdTokenFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

impl ExtraTokenFields for IdTokenFields {}

/// Token endpoint response carrying an optional `id_token`.
pub type IdTokenResponse = StandardTokenResponse<IdTokenFields, BasicTokenType>;

/// OAuth2 client type shared by both providers.
pub type OAuthClient = Client<
    BasicErrorResponse,
    IdTokenResponse,
    BasicTokenType,
    BasicTokenIntrospectionResponse,
    StandardRevocableToken,
    BasicRevocationErrorResponse,
>;

/// Endpoint and client settings needed to talk to one provider.
#[derive(Debug, Clone)]
pub struct OAuthProviderConfig {
    /// OAuth client ID.
    pub client_id: ClientId,
    /// Client secret, for providers that issue one to installed apps.
    pub client_secret: Option<ClientSecret>,
    /// Authorization URL.
    pub auth_url: AuthUrl,
    /// Token URL.
    pub token_url: TokenUrl,
    /// Scopes requested on login.
    pub scopes: Vec<String>,
}

/// Build an OAuth2 client from provider configuration.
#[must_use]
pub fn build_client(config: &OAuthProviderConfig) -> OAuthClient {
    let client = OAuthClient::new(
        config.client_id.clone(),
        config.client_secret.clone(),
        config.auth_url.clone(),
        Some(config.token_url.clone()),
    );
    if config.client_secret.is_some() {
        client.set_auth_type(AuthType::RequestBody)
    } else {
        client
    }
}

/// Account chooser behavior requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    /// Always show the account picker.
    SelectAccount,
    /// Show the account picker and force the consent screen.
    SelectAccountConsent,
}

impl PromptMode {
    /// Value for the `prompt` query parameter.
    #[must_use]
    pub const fn as_param(self) -> &'static str {
        match self {
            Self::SelectAccount => "select_account",
            Self::SelectAccountConsent => "select_account consent",
        }
    }
}

/// Per-attempt secrets bound into an authorization URL.
///
/// The coordinator generates one per login and keeps it until the redirect
/// comes back; the URL built from it is fully determined by its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    /// CSRF `state` value echoed back by the provider.
    pub state: String,
    /// PKCE code verifier (the challenge is derived from it).
    pub pkce_verifier: String,
}

impl AuthRequest {
    /// Generates fresh random state and PKCE verifier.
    #[must_use]
    pub fn new_random() -> Self {
        let (_, verifier) = PkceCodeChallenge::new_random_sha256();
        Self {
            state: CsrfToken::new_random().secret().clone(),
            pkce_verifier: verifier.secret().clone(),
        }
    }

    fn challenge(&self) -> PkceCodeChallenge {
        PkceCodeChallenge::from_code_verifier_sha256(&PkceCodeVerifier::new(
            self.pkce_verifier.clone(),
        ))
    }
}

/// Assemble an authorization request shared by both providers.
fn authorization_request<'a>(
    client: &'a OAuthClient,
    scopes: &[String],
    redirect_uri: &str,
    prompt: PromptMode,
    request: &AuthRequest,
) -> Result<AuthorizationRequest<'a>> {
    let redirect = RedirectUrl::new(redirect_uri.to_string())?;
    let state = CsrfToken::new(request.state.clone());

    Ok(client
        .authorize_url(move || state)
        .set_redirect_uri(Cow::Owned(redirect))
        .add_scopes(scopes.iter().cloned().map(Scope::new))
        .set_pkce_challenge(request.challenge())
        .add_extra_param("prompt", prompt.as_param()))
}

/// Finish an authorization request into its URL.
fn authorization_url(auth: AuthorizationRequest<'_>) -> Url {
    let (url, _) = auth.url();
    url
}

/// Tokens parsed out of a token endpoint response.
#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub scopes: Vec<String>,
    pub id_token: Option<String>,
}

impl IssuedTokens {
    /// Converts a token response; a missing `scope` means the requested ones.
    fn from_response(response: &IdTokenResponse, requested: &[String]) -> Self {
        let scopes = response.scopes().map_or_else(
            || requested.to_vec(),
            |granted| {
                // Some providers send the whole list as one space-delimited entry.
                granted.iter().flat_map(|s| parse_scopes(s)).collect()
            },
        );

        Self {
            access_token: response.access_token().secret().clone(),
            refresh_token: response.refresh_token().map(|t| t.secret().clone()),
            expires_at: expires_at_from(chrono::Utc::now(), response.expires_in()),
            scopes,
            id_token: response.extra_fields().id_token.clone(),
        }
    }
}

/// Split a token request error into an OAuth error code and a description.
fn describe_token_error<RE>(err: &RequestTokenError<RE, BasicErrorResponse>) -> (String, String)
where
    RE: std::error::Error + 'static,
{
    match err {
        RequestTokenError::ServerResponse(resp) => (
            resp.error().to_string(),
            resp.error_description()
                .cloned()
                .unwrap_or_else(|| resp.error().to_string()),
        ),
        RequestTokenError::Request(e) => ("request_failed".to_string(), e.to_string()),
        RequestTokenError::Parse(e, _) => ("invalid_response".to_string(), e.to_string()),
        RequestTokenError::Other(msg) => ("other".to_string(), msg.clone()),
    }
}

/// Map a failed code exchange to [`CuratorError::AuthExchange`].
fn exchange_error<RE>(
    provider: Provider,
    err: &RequestTokenError<RE, BasicErrorResponse>,
) -> CuratorError
where
    RE: std::error::Error + 'static,
{
    let (code, description) = describe_token_error(err);
    tracing::warn!(%provider, %code, %description, "Authorization code exchange failed");
    CuratorError::AuthExchange {
        provider,
        code,
        description,
    }
}

/// Map a failed refresh to the silent failure reason.
fn refresh_failure<RE>(
    provider: Provider,
    err: &RequestTokenError<RE, BasicErrorResponse>,
) -> SilentAuthFailure
where
    RE: std::error::Error + 'static,
{
    let (code, description) = describe_token_error(err);
    tracing::info!(%provider, %code, %description, "Silent token refresh failed");
    match err {
        RequestTokenError::ServerResponse(_) => SilentAuthFailure::Rejected { code, description },
        _ => SilentAuthFailure::Network(description),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OAuthProviderConfig {
        OAuthProviderConfig {
            client_id: ClientId::new("client-123".to_string()),
            client_secret: None,
            auth_url: AuthUrl::new("https://login.example.com/authorize".to_string()).unwrap(),
            token_url: TokenUrl::new("https://login.example.com/token".to_string()).unwrap(),
            scopes: vec!["User.Read".to_string()],
        }
    }

    #[test]
    fn prompt_modes_map_to_query_values() {
        assert_eq!(PromptMode::SelectAccount.as_param(), "select_account");
        assert_eq!(
            PromptMode::SelectAccountConsent.as_param(),
            "select_account consent"
        );
    }

    #[test]
    fn random_requests_differ() {
        let a = AuthRequest::new_random();
        let b = AuthRequest::new_random();
        assert_ne!(a.state, b.state);
        assert_ne!(a.pkce_verifier, b.pkce_verifier);
    }

    #[test]
    fn authorization_url_is_deterministic_for_a_request() {
        let client = build_client(&config());
        let request = AuthRequest::new_random();
        let scopes = vec!["User.Read".to_string(), "offline_access".to_string()];

        let build = || {
            authorization_url(
                authorization_request(
                    &client,
                    &scopes,
                    "http://localhost:3000",
                    PromptMode::SelectAccount,
                    &request,
                )
                .unwrap(),
            )
        };
        let first = build();
        assert_eq!(first, build());

        let query = test_support::query_map(&first);
        assert_eq!(query["client_id"], "client-123");
        assert_eq!(query["response_type"], "code");
        assert_eq!(query["scope"], "User.Read offline_access");
        assert_eq!(query["redirect_uri"], "http://localhost:3000");
        assert_eq!(query["prompt"], "select_account");
        assert_eq!(query["state"], request.state);
        assert_eq!(query["code_challenge_method"], "S256");
        assert_eq!(&query["code_challenge"], request.challenge().as_str());
    }

    #[test]
    fn invalid_redirect_uri_is_rejected() {
        let client = build_client(&config());
        let result = authorization_request(
            &client,
            &[],
            "not a url",
            PromptMode::SelectAccount,
            &AuthRequest::new_random(),
        );
        assert!(matches!(result, Err(CuratorError::InvalidUrl(_))));
    }
}
