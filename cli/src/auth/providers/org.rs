//! Organizational (Microsoft identity platform) provider client.
//!
//! Tokens live in a [`TokenCache`] that a [`CachePlugin`] keeps in sync with
//! durable storage. Account identity comes from the `id_token` returned with
//! the first token response.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, PkceCodeVerifier, RefreshToken, Scope, TokenUrl,
};
use serde::Deserialize;
use tokio::sync::Mutex;
use url::Url;

use super::{
    authorization_request, authorization_url, build_client, exchange_error, refresh_failure,
    AuthRequest, IssuedTokens, OAuthClient, OAuthProviderConfig, PromptMode,
};
use crate::auth::cache::{CacheEntry, CachePlugin, TokenCache};
use crate::auth::tokens::{Account, Credential, Provider};
use crate::config::OrgProviderConfig;
use crate::error::{CuratorError, Result, SilentAuthFailure};

/// Claims read from the organizational `id_token`.
#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    #[serde(default)]
    oid: Option<String>,
    #[serde(default)]
    tid: Option<String>,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// Build the OAuth endpoints for an organizational authority.
///
/// # Errors
///
/// Returns an error if the authority does not form valid endpoint URLs.
pub fn get_config(config: &OrgProviderConfig) -> Result<OAuthProviderConfig> {
    let authority = config.authority.as_str().trim_end_matches('/');

    Ok(OAuthProviderConfig {
        client_id: ClientId::new(config.client_id.clone()),
        client_secret: None,
        auth_url: AuthUrl::new(format!("{authority}/oauth2/v2.0/authorize"))
            .map_err(|e| CuratorError::Config(format!("Invalid auth URL: {e}")))?,
        token_url: TokenUrl::new(format!("{authority}/oauth2/v2.0/token"))
            .map_err(|e| CuratorError::Config(format!("Invalid token URL: {e}")))?,
        scopes: config.scopes.clone(),
    })
}

/// Client for the organizational identity provider.
pub struct OrgAuthClient {
    client: OAuthClient,
    scopes: Vec<String>,
    cache: Mutex<TokenCache>,
    plugin: Arc<dyn CachePlugin>,
}

impl OrgAuthClient {
    /// Creates a client whose cache is persisted through `plugin`.
    pub fn new(config: &OrgProviderConfig, plugin: Arc<dyn CachePlugin>) -> Result<Self> {
        let provider = get_config(config)?;
        Ok(Self {
            client: build_client(&provider),
            scopes: provider.scopes,
            cache: Mutex::new(TokenCache::default()),
            plugin,
        })
    }

    /// Scopes requested on login.
    #[must_use]
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// Builds the authorization endpoint URL. No network I/O.
    pub fn build_authorization_url(
        &self,
        scopes: &[String],
        redirect_uri: &str,
        prompt: PromptMode,
        request: &AuthRequest,
    ) -> Result<Url> {
        let auth = authorization_request(&self.client, scopes, redirect_uri, prompt, request)?;
        Ok(authorization_url(auth))
    }

    /// Redeems an authorization code and caches the resulting tokens.
    pub async fn exchange_code_for_tokens(
        &self,
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
            .add_extra_param("scope", scopes.join(" "))
            .request_async(async_http_client)
            .await
            .map_err(|e| exchange_error(Provider::Org, &e))?;

        let tokens = IssuedTokens::from_response(&response, scopes);
        let account = tokens
            .id_token
            .as_deref()
            .ok_or_else(|| CuratorError::AuthExchange {
                provider: Provider::Org,
                code: "missing_id_token".to_string(),
                description: "Token response did not include an id_token".to_string(),
            })
            .and_then(account_from_id_token)?;

        let entry = CacheEntry {
            account,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: tokens.expires_at,
            scopes: tokens.scopes,
        };

        let mut cache = self.cache.lock().await;
        self.load(&mut cache);
        cache.upsert(entry.clone());
        self.save(&mut cache);

        tracing::info!(account = %entry.account.username, "Organizational account signed in");
        Ok(entry.to_credential())
    }

    /// Returns a valid access token for `account` without user interaction.
    pub async fn acquire_token_silently(
        &self,
        account: &Account,
        scopes: &[String],
    ) -> std::result::Result<String, SilentAuthFailure> {
        let mut cache = self.cache.lock().await;
        self.load(&mut cache);

        let entry = cache
            .get(&account.home_account_id)
            .cloned()
            .ok_or(SilentAuthFailure::NoCredential)?;

        if entry.serves(scopes, Utc::now()) {
            tracing::debug!(
                account = %account.username,
                "Using cached organizational access token"
            );
            return Ok(entry.access_token);
        }

        let refresh_token = entry
            .refresh_token
            .clone()
            .ok_or(SilentAuthFailure::NoRefreshToken)?;

        tracing::debug!(account = %account.username, "Refreshing organizational access token");
        let response = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.clone()))
            .add_scopes(scopes.iter().cloned().map(Scope::new))
            .request_async(async_http_client)
            .await
            .map_err(|e| refresh_failure(Provider::Org, &e))?;

        let tokens = IssuedTokens::from_response(&response, scopes);
        let access_token = tokens.access_token.clone();
        cache.upsert(CacheEntry {
            account: entry.account,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token.or(Some(refresh_token)),
            expires_at: tokens.expires_at,
            scopes: tokens.scopes,
        });
        self.save(&mut cache);

        Ok(access_token)
    }

    /// Enumerates accounts known to the local cache.
    pub async fn list_cached_accounts(&self) -> Vec<Account> {
        let mut cache = self.cache.lock().await;
        self.load(&mut cache);
        cache.accounts()
    }

    /// Returns the cached credential for `account`, without refreshing it.
    pub async fn cached_credential(&self, account: &Account) -> Option<Credential> {
        let mut cache = self.cache.lock().await;
        self.load(&mut cache);
        cache.get(&account.home_account_id).map(CacheEntry::to_credential)
    }

    /// Purges one account's tokens from the cache.
    ///
    /// # Errors
    ///
    /// Returns [`CuratorError::CacheIo`] if the updated cache could not be persisted.
    pub async fn remove_account(&self, account: &Account) -> Result<()> {
        let mut cache = self.cache.lock().await;
        self.plugin.before_cache_access(&mut cache)?;
        if cache.remove(&account.home_account_id) {
            tracing::info!(
                account = %account.username,
                "Removed organizational account from cache"
            );
        }
        self.plugin.after_cache_access(&mut cache)
    }

    fn load(&self, cache: &mut TokenCache) {
        if let Err(e) = self.plugin.before_cache_access(cache) {
            tracing::warn!(
                error = %e,
                "Could not load organizational token cache; using in-memory copy"
            );
        }
    }

    fn save(&self, cache: &mut TokenCache) {
        if let Err(e) = self.plugin.after_cache_access(cache) {
            tracing::warn!(error = %e, "Could not persist organizational token cache");
        }
    }
}

/// Reads the account identity out of an (unverified) `id_token`.
///
/// The token came straight from the token endpoint over TLS, so its claims
/// are only decoded, not validated.
fn account_from_id_token(id_token: &str) -> Result<Account> {
    let invalid = |detail: String| CuratorError::AuthExchange {
        provider: Provider::Org,
        code: "invalid_id_token".to_string(),
        description: detail,
    };

    let payload = id_token
        .split('.')
        .nth(1)
        .ok_or_else(|| invalid("id_token is not a JWT".to_string()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| invalid(format!("id_token payload is not base64url: {e}")))?;
    let claims: IdTokenClaims = serde_json::from_slice(&bytes)
        .map_err(|e| invalid(format!("id_token claims are not JSON: {e}")))?;

    let home_account_id = match (&claims.oid, &claims.tid, &claims.sub) {
        (Some(oid), Some(tid), _) => format!("{oid}.{tid}"),
        (Some(oid), None, _) => oid.clone(),
        (None, _, Some(sub)) => sub.clone(),
        (None, _, None) => return Err(invalid("id_token has no subject".to_string())),
    };
    let username = claims
        .preferred_username
        .or(claims.email)
        .unwrap_or_else(|| home_account_id.clone());

    Ok(Account {
        home_account_id,
        username,
        name: claims.name,
        tenant_id: claims.tid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::cache::{MockCachePlugin, StoreCachePlugin};
    use crate::auth::credentials::CredentialStore;
    use crate::auth::providers::test_support::{fake_id_token, query_map};
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const REDIRECT: &str = "http://localhost:3000";

    fn org_config(authority: &str) -> OrgProviderConfig {
        OrgProviderConfig {
            authority: Url::parse(authority).unwrap(),
            ..OrgProviderConfig::default()
        }
    }

    fn id_token() -> String {
        fake_id_token(&json!({
            "oid": "oid-1",
            "tid": "tenant-1",
            "preferred_username": "ada@contoso.org",
            "name": "Ada Lovelace",
        }))
    }

    fn token_body(access: &str, refresh: Option<&str>, expires_in: i64) -> serde_json::Value {
        let mut body = json!({
            "access_token": access,
            "token_type": "Bearer",
            "expires_in": expires_in,
            "scope": "User.Read Files.ReadWrite",
            "id_token": id_token(),
        });
        if let Some(refresh) = refresh {
            body["refresh_token"] = json!(refresh);
        }
        body
    }

    fn store_client(server: &MockServer, dir: &TempDir) -> (OrgAuthClient, Arc<CredentialStore>) {
        let store = Arc::new(CredentialStore::open(dir.path().join("store.json")));
        let plugin = Arc::new(StoreCachePlugin::new(Arc::clone(&store)));
        let client = OrgAuthClient::new(&org_config(&server.uri()), plugin).unwrap();
        (client, store)
    }

    async fn mount_code_exchange(server: &MockServer, expires_in: i64) {
        Mock::given(method("POST"))
            .and(path("/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("at-1", Some("rt-1"), expires_in)),
            )
            .mount(server)
            .await;
    }

    #[test]
    fn endpoints_derive_from_authority() {
        let config = get_config(&org_config("https://login.example.com/organizations/")).unwrap();
        assert_eq!(
            config.auth_url.as_str(),
            "https://login.example.com/organizations/oauth2/v2.0/authorize"
        );
        assert_eq!(
            config.token_url.as_str(),
            "https://login.example.com/organizations/oauth2/v2.0/token"
        );
    }

    #[test]
    fn authorization_url_targets_authority() {
        let client = OrgAuthClient::new(
            &org_config("https://login.example.com/organizations"),
            Arc::new(MockCachePlugin::new()),
        )
        .unwrap();
        let url = client
            .build_authorization_url(
                client.scopes(),
                REDIRECT,
                PromptMode::SelectAccount,
                &AuthRequest::new_random(),
            )
            .unwrap();

        assert_eq!(url.path(), "/organizations/oauth2/v2.0/authorize");
        let query = query_map(&url);
        assert_eq!(query["prompt"], "select_account");
        assert!(query["scope"].contains("Files.ReadWrite"));
    }

    #[test]
    fn id_token_claims_form_account() {
        let account = account_from_id_token(&id_token()).unwrap();
        assert_eq!(account.home_account_id, "oid-1.tenant-1");
        assert_eq!(account.username, "ada@contoso.org");
        assert_eq!(account.name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(account.tenant_id.as_deref(), Some("tenant-1"));
    }

    #[test]
    fn id_token_falls_back_to_subject() {
        let token = fake_id_token(&json!({ "sub": "subject-9", "email": "x@y.z" }));
        let account = account_from_id_token(&token).unwrap();
        assert_eq!(account.home_account_id, "subject-9");
        assert_eq!(account.username, "x@y.z");
    }

    #[test]
    fn malformed_id_token_is_an_exchange_error() {
        assert!(matches!(
            account_from_id_token("nodots"),
            Err(CuratorError::AuthExchange { .. })
        ));
        assert!(matches!(
            account_from_id_token("a.!!!.c"),
            Err(CuratorError::AuthExchange { .. })
        ));
        let no_subject = fake_id_token(&json!({ "name": "Nobody" }));
        assert!(account_from_id_token(&no_subject).is_err());
    }

    #[tokio::test]
    async fn exchange_then_silent_returns_cached_token() {
        let server = MockServer::start().await;
        mount_code_exchange(&server, 3600).await;
        let dir = TempDir::new().unwrap();
        let (client, _store) = store_client(&server, &dir);

        let credential = client
            .exchange_code_for_tokens("code-1", client.scopes(), REDIRECT, "verifier")
            .await
            .unwrap();
        assert_eq!(credential.account.username, "ada@contoso.org");
        assert!(credential.expires_at > Utc::now() + chrono::Duration::minutes(30));

        let token = client
            .acquire_token_silently(&credential.account, &["User.Read".to_string()])
            .await
            .unwrap();
        assert_eq!(token, "at-1");
        assert_eq!(client.list_cached_accounts().await, vec![credential.account]);
    }

    #[tokio::test]
    async fn exchange_error_carries_provider_description() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "AADSTS70008: The code has expired.",
            })))
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let (client, store) = store_client(&server, &dir);

        let err = client
            .exchange_code_for_tokens("stale", client.scopes(), REDIRECT, "verifier")
            .await
            .unwrap_err();
        match err {
            CuratorError::AuthExchange { code, description, .. } => {
                assert_eq!(code, "invalid_grant");
                assert!(description.contains("code has expired"));
            },
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_persisted_across_restart() {
        let server = MockServer::start().await;
        // Issued already expired so the first silent call must refresh.
        mount_code_exchange(&server, 0).await;
        Mock::given(method("POST"))
            .and(path("/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=rt-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-2", None, 3600)))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let (client, _store) = store_client(&server, &dir);
        let credential = client
            .exchange_code_for_tokens("code-1", client.scopes(), REDIRECT, "verifier")
            .await
            .unwrap();
        drop(client);

        // Simulated restart: fresh store and client over the same file.
        let (restarted, _store) = store_client(&server, &dir);
        let token = restarted
            .acquire_token_silently(&credential.account, &["User.Read".to_string()])
            .await
            .unwrap();
        assert_eq!(token, "at-2");

        // The refresh response had no refresh_token; the old one is kept.
        let cached = restarted.cached_credential(&credential.account).await.unwrap();
        assert_eq!(cached.refresh_token.as_deref(), Some("rt-1"));

        // Second call is served from cache (refresh mock expects exactly one call).
        let again = restarted
            .acquire_token_silently(&credential.account, &["User.Read".to_string()])
            .await
            .unwrap();
        assert_eq!(again, "at-2");
    }

    #[tokio::test]
    async fn revoked_refresh_token_is_a_silent_failure() {
        let server = MockServer::start().await;
        mount_code_exchange(&server, 0).await;
        Mock::given(method("POST"))
            .and(path("/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "AADSTS50173: The grant was revoked.",
            })))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let (client, _store) = store_client(&server, &dir);
        let credential = client
            .exchange_code_for_tokens("code-1", client.scopes(), REDIRECT, "verifier")
            .await
            .unwrap();

        let failure = client
            .acquire_token_silently(&credential.account, client.scopes())
            .await
            .unwrap_err();
        assert!(matches!(
            failure,
            SilentAuthFailure::Rejected { ref code, .. } if code == "invalid_grant"
        ));
        assert!(failure.is_session_expired());
    }

    #[tokio::test]
    async fn unknown_account_is_no_credential() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let (client, _store) = store_client(&server, &dir);

        let failure = client
            .acquire_token_silently(&Account::unknown(), client.scopes())
            .await
            .unwrap_err();
        assert_eq!(failure, SilentAuthFailure::NoCredential);
    }

    #[tokio::test]
    async fn remove_account_purges_cache() {
        let server = MockServer::start().await;
        mount_code_exchange(&server, 3600).await;
        let dir = TempDir::new().unwrap();
        let (client, _store) = store_client(&server, &dir);
        let credential = client
            .exchange_code_for_tokens("code-1", client.scopes(), REDIRECT, "verifier")
            .await
            .unwrap();

        client.remove_account(&credential.account).await.unwrap();
        client.remove_account(&credential.account).await.unwrap();
        assert!(client.list_cached_accounts().await.is_empty());

        let (restarted, _store) = store_client(&server, &dir);
        assert!(restarted.list_cached_accounts().await.is_empty());
    }

    #[tokio::test]
    async fn pure_reads_never_write_the_cache() {
        let mut plugin = MockCachePlugin::new();
        plugin.expect_before_cache_access().times(2).returning(|_| Ok(()));
        plugin.expect_after_cache_access().never();

        let client = OrgAuthClient::new(
            &org_config("https://login.example.com/organizations"),
            Arc::new(plugin),
        )
        .unwrap();

        assert!(client.list_cached_accounts().await.is_empty());
        assert!(client
            .acquire_token_silently(&Account::unknown(), client.scopes())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn cache_write_failure_does_not_fail_exchange() {
        let server = MockServer::start().await;
        mount_code_exchange(&server, 3600).await;

        let mut plugin = MockCachePlugin::new();
        plugin.expect_before_cache_access().returning(|_| Ok(()));
        plugin
            .expect_after_cache_access()
            .times(1)
            .returning(|_| Err(CuratorError::CacheIo("disk full".to_string())));

        let client = OrgAuthClient::new(&org_config(&server.uri()), Arc::new(plugin)).unwrap();
        let credential = client
            .exchange_code_for_tokens("code-1", client.scopes(), REDIRECT, "verifier")
            .await
            .unwrap();
        assert_eq!(credential.access_token, "at-1");
    }
}
