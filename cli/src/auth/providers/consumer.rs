//! Consumer (Google) OAuth provider client.
//!
//! Unlike the organizational provider there is no opaque cache: the access
//! token, refresh token, expiry and profile are four plain keys in the
//! [`CredentialStore`], optionally namespaced per application user.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, PkceCodeVerifier, RefreshToken, TokenUrl,
};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{
    authorization_request, authorization_url, build_client, exchange_error, refresh_failure,
    AuthRequest, IssuedTokens, OAuthClient, OAuthProviderConfig, PromptMode,
};
use crate::auth::credentials::CredentialStore;
use crate::auth::tokens::{is_expired_at, Account, Credential, Provider};
use crate::config::ConsumerProviderConfig;
use crate::error::{CuratorError, Result, SilentAuthFailure};

/// Profile fields returned by the userinfo endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerProfile {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

impl ConsumerProfile {
    /// The account this profile describes.
    #[must_use]
    pub fn to_account(&self) -> Account {
        let username = self
            .email
            .clone()
            .or_else(|| self.sub.clone())
            .unwrap_or_else(|| "unknown".to_string());
        Account {
            home_account_id: self.sub.clone().unwrap_or_else(|| username.clone()),
            username,
            name: self.name.clone(),
            tenant_id: None,
        }
    }
}

/// Store keys for the consumer credential of one application user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerKeys {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: String,
    pub profile: String,
}

impl ConsumerKeys {
    /// Keys for `user_id`, or the shared keys when no user is active.
    #[must_use]
    pub fn for_user(user_id: Option<&str>) -> Self {
        let key = |name: &str| match user_id {
            Some(user) => format!("users.{user}.{name}"),
            None => name.to_string(),
        };
        Self {
            access_token: key("consumer_access_token"),
            refresh_token: key("consumer_refresh_token"),
            expires_at: key("consumer_expires_at"),
            profile: key("consumer_profile"),
        }
    }

    #[must_use]
    pub fn all(&self) -> [&str; 4] {
        [
            &self.access_token,
            &self.refresh_token,
            &self.expires_at,
            &self.profile,
        ]
    }
}

impl Default for ConsumerKeys {
    fn default() -> Self {
        Self::for_user(None)
    }
}

/// Build the consumer OAuth configuration.
///
/// # Errors
///
/// Returns an error if the configured URLs cannot be parsed.
pub fn get_config(config: &ConsumerProviderConfig) -> Result<OAuthProviderConfig> {
    Ok(OAuthProviderConfig {
        client_id: ClientId::new(config.client_id.clone()),
        client_secret: config.client_secret.clone().map(ClientSecret::new),
        auth_url: AuthUrl::new(config.auth_url.to_string())
            .map_err(|e| CuratorError::Config(format!("Invalid auth URL: {e}")))?,
        token_url: TokenUrl::new(config.token_url.to_string())
            .map_err(|e| CuratorError::Config(format!("Invalid token URL: {e}")))?,
        scopes: config.scopes.clone(),
    })
}

/// Client for the consumer identity provider.
pub struct ConsumerAuthClient {
    client: OAuthClient,
    scopes: Vec<String>,
    userinfo_url: Url,
    http: reqwest::Client,
    store: Arc<CredentialStore>,
    keys: RwLock<ConsumerKeys>,
}

impl ConsumerAuthClient {
    /// Creates a client persisting its tokens in `store`.
    pub fn new(config: &ConsumerProviderConfig, store: Arc<CredentialStore>) -> Result<Self> {
        let provider = get_config(config)?;
        let http = reqwest::Client::builder()
            .user_agent(format!("curator/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client: build_client(&provider),
            scopes: provider.scopes,
            userinfo_url: config.userinfo_url.clone(),
            http,
            store,
            keys: RwLock::new(ConsumerKeys::default()),
        })
    }

    /// Scopes requested on login.
    #[must_use]
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// Switches storage to the keys of `user_id` (or the shared keys).
    pub fn set_active_user(&self, user_id: Option<&str>) {
        let keys = ConsumerKeys::for_user(user_id);
        *self.keys.write().unwrap_or_else(PoisonError::into_inner) = keys;
    }

    /// Keys of the currently active user.
    #[must_use]
    pub fn active_keys(&self) -> ConsumerKeys {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Builds the authorization endpoint URL. No network I/O.
    ///
    /// Requests offline access so that a refresh token is issued.
    pub fn build_authorization_url(
        &self,
        scopes: &[String],
        redirect_uri: &str,
        prompt: PromptMode,
        request: &AuthRequest,
    ) -> Result<Url> {
        let auth = authorization_request(&self.client, scopes, redirect_uri, prompt, request)?
            .add_extra_param("access_type", "offline");
        Ok(authorization_url(auth))
    }

    /// Redeems an authorization code, fetches the profile and stores everything
    /// under the keys of the user active when the call was made.
    pub async fn exchange_code_for_tokens(
        &self,
        code: &str,
        scopes: &[String],
        redirect_uri: &str,
        pkce_verifier: &str,
    ) -> Result<Credential> {
        let keys = self.active_keys();
        self.exchange_code_into(&keys, code, scopes, redirect_uri, pkce_verifier)
            .await
    }

    /// Like [`exchange_code_for_tokens`](Self::exchange_code_for_tokens), but
    /// stores into `keys` regardless of the active user.
    pub async fn exchange_code_into(
        &self,
        keys: &ConsumerKeys,
        code: &str,
        scopes: &[String],
        redirect_uri: &str,
        pkce_verifier: &str,
    ) -> Result<Credential> {
        let redirect = oauth2::RedirectUrl::new(redirect_uri.to_string())?;
        let response = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_redirect_uri(std::borrow::Cow::Owned(redirect))
            .set_pkce_verifier(PkceCodeVerifier::new(pkce_verifier.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| exchange_error(Provider::Consumer, &e))?;

        let tokens = IssuedTokens::from_response(&response, scopes);
        let profile = match self.fetch_profile(&tokens.access_token).await {
            Ok(profile) => Some(profile),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Could not fetch consumer profile; storing tokens without it"
                );
                None
            },
        };

        self.store.set(&keys.access_token, &tokens.access_token);
        match &tokens.refresh_token {
            Some(refresh) => self.store.set(&keys.refresh_token, refresh),
            None => {
                tracing::warn!(
                    "Consumer provider issued no refresh token; silent refresh will not be possible"
                );
                self.store.delete(&keys.refresh_token);
            },
        }
        self.store.set(&keys.expires_at, &tokens.expires_at);
        match &profile {
            Some(p) => self.store.set(&keys.profile, p),
            None => self.store.delete(&keys.profile),
        }

        let account = profile.as_ref().map_or_else(Account::unknown, ConsumerProfile::to_account);
        tracing::info!(account = %account.username, "Consumer account signed in");

        Ok(Credential {
            provider: Provider::Consumer,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: tokens.expires_at,
            account,
            scopes: tokens.scopes,
        })
    }

    /// Returns a valid access token, refreshing it if it is expired or near expiry.
    pub async fn acquire_token_silently(&self) -> std::result::Result<String, SilentAuthFailure> {
        let keys = self.active_keys();
        let access_token = self.store.get::<String>(&keys.access_token);
        let expires_at = self.store.get::<DateTime<Utc>>(&keys.expires_at);
        let refresh_token = self.store.get::<String>(&keys.refresh_token);

        if let (Some(token), Some(expires_at)) = (&access_token, expires_at) {
            if !is_expired_at(expires_at, Utc::now()) {
                return Ok(token.clone());
            }
        }

        let Some(refresh_token) = refresh_token else {
            return Err(if access_token.is_some() {
                SilentAuthFailure::NoRefreshToken
            } else {
                SilentAuthFailure::NoCredential
            });
        };

        tracing::debug!("Refreshing consumer access token");
        let response = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token))
            .request_async(async_http_client)
            .await
            .map_err(|e| refresh_failure(Provider::Consumer, &e))?;

        let tokens = IssuedTokens::from_response(&response, &self.scopes);
        self.store.set(&keys.access_token, &tokens.access_token);
        self.store.set(&keys.expires_at, &tokens.expires_at);
        if let Some(rotated) = &tokens.refresh_token {
            self.store.set(&keys.refresh_token, rotated);
        }

        Ok(tokens.access_token)
    }

    /// The stored profile, if any.
    pub fn cached_profile(&self) -> Option<ConsumerProfile> {
        self.store.get(&self.active_keys().profile)
    }

    /// Expiry of the stored access token, if any.
    pub fn cached_expiry(&self) -> Option<DateTime<Utc>> {
        self.store.get(&self.active_keys().expires_at)
    }

    /// Whether a refresh token is stored.
    pub fn has_refresh_token(&self) -> bool {
        self.store.has(&self.active_keys().refresh_token)
    }

    /// Enumerates stored accounts (zero or one).
    pub fn list_cached_accounts(&self) -> Vec<Account> {
        let keys = self.active_keys();
        if !self.store.has(&keys.refresh_token) && !self.store.has(&keys.access_token) {
            return Vec::new();
        }
        vec![self
            .cached_profile()
            .map_or_else(Account::unknown, |p| p.to_account())]
    }

    /// Removes the stored credential. The consumer side holds a single
    /// account, so `account` is only used for logging.
    ///
    /// # Errors
    ///
    /// Returns [`CuratorError::CacheIo`] if a key could not be removed from disk.
    pub fn remove_account(&self, account: &Account) -> Result<()> {
        let keys = self.active_keys();
        let mut result = Ok(());
        for key in keys.all() {
            if let Err(e) = self.store.try_delete(key) {
                result = Err(e);
            }
        }
        tracing::info!(account = %account.username, "Removed consumer account from store");
        result
    }

    /// Fetches the signed-in user's profile from the userinfo endpoint.
    pub async fn fetch_profile(&self, access_token: &str) -> Result<ConsumerProfile> {
        let response = self
            .http
            .get(self.userinfo_url.clone())
            .bearer_auth(access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(CuratorError::ApiError { status, message });
        }

        response
            .json()
            .await
            .map_err(|e| CuratorError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::providers::test_support::query_map;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const REDIRECT: &str = "http://localhost:3001";

    fn consumer_config(server: &str) -> ConsumerProviderConfig {
        ConsumerProviderConfig {
            auth_url: Url::parse(&format!("{server}/o/oauth2/v2/auth")).unwrap(),
            token_url: Url::parse(&format!("{server}/token")).unwrap(),
            userinfo_url: Url::parse(&format!("{server}/userinfo")).unwrap(),
            client_secret: Some("installed-app-secret".to_string()),
            ..ConsumerProviderConfig::default()
        }
    }

    fn client_at(server: &MockServer, dir: &TempDir) -> (ConsumerAuthClient, Arc<CredentialStore>) {
        let store = Arc::new(CredentialStore::open(dir.path().join("store.json")));
        let client =
            ConsumerAuthClient::new(&consumer_config(&server.uri()), Arc::clone(&store)).unwrap();
        (client, store)
    }

    async fn mount_userinfo(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .and(header("authorization", "Bearer ya29.first"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sub": "1077",
                "email": "grace@gmail.com",
                "name": "Grace Hopper",
            })))
            .mount(server)
            .await;
    }

    async fn mount_code_exchange(server: &MockServer, expires_in: i64) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("client_secret=installed-app-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "ya29.first",
                "refresh_token": "1//refresh",
                "token_type": "Bearer",
                "expires_in": expires_in,
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn keys_are_namespaced_per_user() {
        let shared = ConsumerKeys::default();
        assert_eq!(shared.access_token, "consumer_access_token");

        let scoped = ConsumerKeys::for_user(Some("u42"));
        assert_eq!(scoped.refresh_token, "users.u42.consumer_refresh_token");
        assert_eq!(scoped.profile, "users.u42.consumer_profile");
    }

    #[test]
    fn authorization_url_requests_offline_access() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CredentialStore::open(dir.path().join("store.json")));
        let client = ConsumerAuthClient::new(&ConsumerProviderConfig::default(), store).unwrap();
        let url = client
            .build_authorization_url(
                client.scopes(),
                REDIRECT,
                PromptMode::SelectAccountConsent,
                &AuthRequest::new_random(),
            )
            .unwrap();

        assert_eq!(url.host_str(), Some("accounts.google.com"));
        let query = query_map(&url);
        assert_eq!(query["access_type"], "offline");
        assert_eq!(query["prompt"], "select_account consent");
        assert_eq!(query["redirect_uri"], REDIRECT);
    }

    #[tokio::test]
    async fn exchange_stores_four_keys_and_silent_returns_token() {
        let server = MockServer::start().await;
        mount_code_exchange(&server, 3599).await;
        mount_userinfo(&server).await;
        let dir = TempDir::new().unwrap();
        let (client, store) = client_at(&server, &dir);

        let credential = client
            .exchange_code_for_tokens("4/code", client.scopes(), REDIRECT, "verifier")
            .await
            .unwrap();
        assert_eq!(credential.account.username, "grace@gmail.com");
        assert_eq!(credential.account.home_account_id, "1077");

        let keys = ConsumerKeys::default();
        for key in keys.all() {
            assert!(store.has(key), "missing {key}");
        }

        assert_eq!(client.acquire_token_silently().await.unwrap(), "ya29.first");
        assert_eq!(client.list_cached_accounts().len(), 1);
        assert_eq!(
            client.cached_profile().unwrap().name.as_deref(),
            Some("Grace Hopper")
        );
    }

    #[tokio::test]
    async fn profile_failure_still_stores_tokens() {
        let server = MockServer::start().await;
        mount_code_exchange(&server, 3599).await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let (client, store) = client_at(&server, &dir);

        let credential = client
            .exchange_code_for_tokens("4/code", client.scopes(), REDIRECT, "verifier")
            .await
            .unwrap();
        assert_eq!(credential.account, Account::unknown());
        assert!(store.has("consumer_refresh_token"));
        assert!(!store.has("consumer_profile"));
    }

    #[tokio::test]
    async fn token_one_second_past_expiry_is_refreshed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=1%2F%2Frefresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "ya29.second",
                "token_type": "Bearer",
                "expires_in": 3599,
            })))
            .expect(1)
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let (client, store) = client_at(&server, &dir);
        store.set("consumer_access_token", "ya29.stale");
        store.set("consumer_refresh_token", "1//refresh");
        store.set("consumer_expires_at", &(Utc::now() - ChronoDuration::seconds(1)));

        assert_eq!(client.acquire_token_silently().await.unwrap(), "ya29.second");
        assert_eq!(
            store.get::<String>("consumer_access_token").as_deref(),
            Some("ya29.second")
        );
        // Not rotated: the stored refresh token stays.
        assert_eq!(
            store.get::<String>("consumer_refresh_token").as_deref(),
            Some("1//refresh")
        );
        let expiry: DateTime<Utc> = store.get("consumer_expires_at").unwrap();
        assert!(expiry > Utc::now());
    }

    #[tokio::test]
    async fn rotated_refresh_token_replaces_stored_one() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "ya29.second",
                "refresh_token": "1//rotated",
                "token_type": "Bearer",
                "expires_in": 3599,
            })))
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let (client, store) = client_at(&server, &dir);
        store.set("consumer_refresh_token", "1//refresh");

        client.acquire_token_silently().await.unwrap();
        assert_eq!(
            store.get::<String>("consumer_refresh_token").as_deref(),
            Some("1//rotated")
        );
    }

    #[tokio::test]
    async fn revoked_refresh_is_silent_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "Token has been expired or revoked.",
            })))
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let (client, store) = client_at(&server, &dir);
        store.set("consumer_refresh_token", "1//revoked");

        let failure = client.acquire_token_silently().await.unwrap_err();
        assert!(failure.is_session_expired());
    }

    #[tokio::test]
    async fn missing_state_distinguishes_never_connected() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let (client, store) = client_at(&server, &dir);

        assert_eq!(
            client.acquire_token_silently().await.unwrap_err(),
            SilentAuthFailure::NoCredential
        );

        store.set("consumer_access_token", "ya29.stale");
        store.set("consumer_expires_at", &(Utc::now() - ChronoDuration::hours(2)));
        assert_eq!(
            client.acquire_token_silently().await.unwrap_err(),
            SilentAuthFailure::NoRefreshToken
        );
    }

    #[tokio::test]
    async fn active_user_scopes_storage() {
        let server = MockServer::start().await;
        mount_code_exchange(&server, 3599).await;
        mount_userinfo(&server).await;
        let dir = TempDir::new().unwrap();
        let (client, store) = client_at(&server, &dir);

        client.set_active_user(Some("member-7"));
        client
            .exchange_code_for_tokens("4/code", client.scopes(), REDIRECT, "verifier")
            .await
            .unwrap();
        assert!(store.has("users.member-7.consumer_refresh_token"));
        assert!(!store.has("consumer_refresh_token"));

        client.set_active_user(None);
        assert!(client.list_cached_accounts().is_empty());

        client.set_active_user(Some("member-7"));
        let account = client.list_cached_accounts().remove(0);
        client.remove_account(&account).unwrap();
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn switching_user_mid_exchange_keeps_tokens_with_original_user() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({
                        "access_token": "ya29.first",
                        "refresh_token": "1//refresh",
                        "token_type": "Bearer",
                        "expires_in": 3599,
                    }))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;
        mount_userinfo(&server).await;
        let dir = TempDir::new().unwrap();
        let (client, store) = client_at(&server, &dir);

        client.set_active_user(Some("alice"));
        let exchange =
            client.exchange_code_for_tokens("4/code", client.scopes(), REDIRECT, "verifier");
        let switch = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            client.set_active_user(Some("bob"));
        };
        let (result, ()) = tokio::join!(exchange, switch);
        result.unwrap();

        for key in ConsumerKeys::for_user(Some("alice")).all() {
            assert!(store.has(key), "missing {key}");
        }
        assert!(store.keys().iter().all(|k| !k.starts_with("users.bob.")));
        assert!(client.list_cached_accounts().is_empty());
    }

    #[tokio::test]
    async fn reopened_store_serves_token_without_network() {
        let server = MockServer::start().await;
        mount_code_exchange(&server, 3599).await;
        mount_userinfo(&server).await;
        let dir = TempDir::new().unwrap();
        let issued = {
            let (client, _) = client_at(&server, &dir);
            client
                .exchange_code_for_tokens("4/code", client.scopes(), REDIRECT, "verifier")
                .await
                .unwrap()
        };

        server.reset().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let (client, _) = client_at(&server, &dir);
        assert_eq!(client.acquire_token_silently().await.unwrap(), "ya29.first");
        let expiry = client.cached_expiry().unwrap();
        assert_eq!(expiry.timestamp(), issued.expires_at.timestamp());
        assert!(client.has_refresh_token());
        assert_eq!(client.list_cached_accounts()[0].username, "grace@gmail.com");
    }
}
