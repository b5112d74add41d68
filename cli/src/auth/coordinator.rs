//! End-to-end sign-in orchestration for both providers.
//!
//! The coordinator owns one loopback listener slot per provider. `login`
//! starts (or reuses) the listener, registers a fresh state/PKCE pair with it
//! and opens the browser, then returns. A flow-driver task per listener
//! receives the redirect, exchanges the code and reports the result on the
//! event channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::Instant;
use url::Url;

use crate::auth::browser::BrowserLauncher;
use crate::auth::cache::StoreCachePlugin;
use crate::auth::credentials::CredentialStore;
use crate::auth::loopback::{LoopbackOptions, LoopbackServer, RedirectOutcome};
use crate::auth::providers::{
    AuthRequest, ConsumerAuthClient, ConsumerKeys, OrgAuthClient, PromptMode,
};
use crate::auth::tokens::{Account, Credential, Provider};
use crate::config::AuthConfig;
use crate::error::{CuratorError, Result, SilentAuthFailure};

/// Store key naming the organizational account used for silent acquisition.
pub const ORG_ACCOUNT_KEY: &str = "org_account";

/// Store key of the pre-cache organizational access token.
pub const LEGACY_ORG_TOKEN_KEY: &str = "org_access_token";

const EVENT_CAPACITY: usize = 16;

/// Sign-in lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuthEvent {
    SignedIn { provider: Provider, account: Account },
    SignInFailed { provider: Provider, message: String },
    SignedOut { provider: Provider },
}

impl AuthEvent {
    #[must_use]
    pub const fn provider(&self) -> Provider {
        match self {
            Self::SignedIn { provider, .. }
            | Self::SignInFailed { provider, .. }
            | Self::SignedOut { provider } => *provider,
        }
    }
}

/// Returned by [`AuthCoordinator::login`] once the browser step has begun.
#[derive(Debug, Clone)]
pub struct LoginStarted {
    /// URL the user has to visit.
    pub authorization_url: Url,
    /// Whether the system browser accepted the URL.
    pub browser_opened: bool,
}

/// Locally known sign-in state of one provider. Built without network I/O.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub provider: Provider,
    /// Account silent acquisition uses, if any.
    pub active_account: Option<Account>,
    /// All cached accounts.
    pub accounts: Vec<Account>,
    /// Expiry of the active account's access token.
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether a refresh token is stored for the active account.
    pub can_refresh: bool,
    /// Whether an interactive sign-in is waiting for its redirect.
    pub sign_in_pending: bool,
}

/// Timing knobs of the interactive flow.
#[derive(Debug, Clone, Copy)]
struct FlowTimings {
    login_timeout: Duration,
    grace_period: Duration,
    bind_retry_delay: Duration,
}

#[derive(Debug, Clone)]
struct RedirectTarget {
    port: u16,
    path: String,
}

impl RedirectTarget {
    fn uri(&self) -> String {
        format!("http://localhost:{}{}", self.port, self.path)
    }
}

/// What a redirect needs to finish one login.
#[derive(Debug, Clone)]
struct PendingSignIn {
    pkce_verifier: String,
    /// Consumer keys of the user active at `login`; `None` for org.
    consumer_keys: Option<ConsumerKeys>,
}

type PendingRequests = Arc<StdMutex<HashMap<String, PendingSignIn>>>;

struct ActiveListener {
    id: u64,
    server: LoopbackServer,
    /// `state` → pending sign-in of every login routed through this listener.
    pending: PendingRequests,
    deadline: watch::Sender<Instant>,
}

struct Inner {
    store: Arc<CredentialStore>,
    org: OrgAuthClient,
    consumer: ConsumerAuthClient,
    browser: Arc<dyn BrowserLauncher>,
    events: broadcast::Sender<AuthEvent>,
    listeners: Mutex<HashMap<Provider, ActiveListener>>,
    next_listener_id: AtomicU64,
    timings: FlowTimings,
    org_redirect: RedirectTarget,
    consumer_redirect: RedirectTarget,
}

/// Orchestrates login, silent token acquisition and logout.
///
/// Cheap to clone; clones share listeners, clients and the event channel.
#[derive(Clone)]
pub struct AuthCoordinator {
    inner: Arc<Inner>,
}

impl AuthCoordinator {
    /// Builds a coordinator whose credentials live in `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider's endpoint configuration is invalid.
    pub fn new(
        config: &AuthConfig,
        store: Arc<CredentialStore>,
        browser: Arc<dyn BrowserLauncher>,
    ) -> Result<Self> {
        let plugin = Arc::new(StoreCachePlugin::new(Arc::clone(&store)));
        let org = OrgAuthClient::new(&config.org, plugin)?;
        let consumer = ConsumerAuthClient::new(&config.consumer, Arc::clone(&store))?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                org,
                consumer,
                browser,
                events,
                listeners: Mutex::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
                timings: FlowTimings {
                    login_timeout: config.login_timeout(),
                    grace_period: config.grace_period(),
                    bind_retry_delay: config.bind_retry_delay(),
                },
                org_redirect: RedirectTarget {
                    port: config.org.redirect_port,
                    path: config.org.redirect_path.clone(),
                },
                consumer_redirect: RedirectTarget {
                    port: config.consumer.redirect_port,
                    path: config.consumer.redirect_path.clone(),
                },
            }),
        })
    }

    /// Receives every event emitted after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.events.subscribe()
    }

    /// Starts an interactive sign-in and returns without waiting for it.
    ///
    /// The outcome arrives as [`AuthEvent::SignedIn`] or
    /// [`AuthEvent::SignInFailed`].
    ///
    /// # Errors
    ///
    /// Returns [`CuratorError::PortBind`] if the redirect listener could not
    /// be started; the failure is also emitted as an event.
    pub async fn login(&self, provider: Provider) -> Result<LoginStarted> {
        match self.inner.begin_login(provider).await {
            Ok(url) => {
                let browser_opened = match self.inner.browser.open(&url) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(%provider, error = %e, "Open the sign-in URL manually");
                        false
                    },
                };
                Ok(LoginStarted {
                    authorization_url: url,
                    browser_opened,
                })
            },
            Err(e) => {
                tracing::error!(%provider, error = %e, "Could not start sign-in");
                self.inner.emit(AuthEvent::SignInFailed {
                    provider,
                    message: e.to_string(),
                });
                Err(e)
            },
        }
    }

    /// Returns a usable access token, or `None` if the user has to sign in.
    pub async fn get_access_token(&self, provider: Provider) -> Option<String> {
        match self.access_token(provider).await {
            Ok(token) => Some(token),
            Err(reason) => {
                tracing::info!(%provider, %reason, "No access token available without sign-in");
                None
            },
        }
    }

    /// Like [`get_access_token`](Self::get_access_token), but says why no
    /// token could be obtained.
    pub async fn access_token(
        &self,
        provider: Provider,
    ) -> std::result::Result<String, SilentAuthFailure> {
        match provider {
            Provider::Org => {
                let account = self
                    .inner
                    .active_org_account()
                    .await
                    .ok_or(SilentAuthFailure::NoCredential)?;
                self.inner
                    .org
                    .acquire_token_silently(&account, self.inner.org.scopes())
                    .await
            },
            Provider::Consumer => self.inner.consumer.acquire_token_silently().await,
        }
    }

    /// Forgets every cached account of `provider`. Always succeeds.
    pub async fn logout(&self, provider: Provider) -> bool {
        match provider {
            Provider::Org => {
                for account in self.inner.org.list_cached_accounts().await {
                    if let Err(e) = self.inner.org.remove_account(&account).await {
                        tracing::warn!(
                            account = %account.username,
                            error = %e,
                            "Could not remove organizational account"
                        );
                    }
                }
                for key in [ORG_ACCOUNT_KEY, LEGACY_ORG_TOKEN_KEY] {
                    if let Err(e) = self.inner.store.try_delete(key) {
                        tracing::warn!(key, error = %e, "Could not remove stored key");
                    }
                }
            },
            Provider::Consumer => {
                let account = self
                    .inner
                    .consumer
                    .list_cached_accounts()
                    .into_iter()
                    .next()
                    .unwrap_or_else(Account::unknown);
                if let Err(e) = self.inner.consumer.remove_account(&account) {
                    tracing::warn!(error = %e, "Could not remove consumer account");
                }
            },
        }

        tracing::info!(%provider, "Signed out");
        self.inner.emit(AuthEvent::SignedOut { provider });
        true
    }

    /// Signs out of both providers, then wipes the whole store, including the
    /// consumer credentials of every application user.
    pub async fn logout_all(&self) {
        for provider in Provider::ALL {
            self.logout(provider).await;
        }
        let store = &self.inner.store;
        let removed = store.keys().len();
        store.clear();
        tracing::info!(path = %store.path().display(), removed, "Cleared credential store");
    }

    /// Reports what is cached for `provider` without touching the network.
    pub async fn status(&self, provider: Provider) -> ProviderStatus {
        let sign_in_pending = self
            .inner
            .listeners
            .lock()
            .await
            .get(&provider)
            .is_some_and(|l| l.server.is_accepting());

        let (active_account, accounts, expires_at, can_refresh) = match provider {
            Provider::Org => {
                let accounts = self.inner.org.list_cached_accounts().await;
                let active = self.inner.active_org_account().await;
                let credential = match &active {
                    Some(account) => self.inner.org.cached_credential(account).await,
                    None => None,
                };
                let can_refresh = credential.as_ref().is_some_and(Credential::can_refresh);
                (active, accounts, credential.map(|c| c.expires_at), can_refresh)
            },
            Provider::Consumer => {
                let consumer = &self.inner.consumer;
                let accounts = consumer.list_cached_accounts();
                (
                    accounts.first().cloned(),
                    accounts,
                    consumer.cached_expiry(),
                    consumer.has_refresh_token(),
                )
            },
        };

        ProviderStatus {
            provider,
            active_account,
            accounts,
            expires_at,
            can_refresh,
            sign_in_pending,
        }
    }

    /// Scopes consumer credentials to `user_id` (`None` for the shared keys).
    pub fn set_active_user(&self, user_id: Option<&str>) {
        self.inner.consumer.set_active_user(user_id);
    }

    /// Closes every listener. Pending sign-ins are abandoned.
    pub async fn shutdown(&self) {
        let listeners: Vec<ActiveListener> = {
            let mut slots = self.inner.listeners.lock().await;
            slots.drain().map(|(_, listener)| listener).collect()
        };
        for listener in listeners {
            listener.server.close().await;
        }
    }

    #[cfg(test)]
    async fn listener_id(&self, provider: Provider) -> Option<u64> {
        self.inner.listeners.lock().await.get(&provider).map(|l| l.id)
    }
}

impl Inner {
    fn emit(&self, event: AuthEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn redirect_target(&self, provider: Provider) -> &RedirectTarget {
        match provider {
            Provider::Org => &self.org_redirect,
            Provider::Consumer => &self.consumer_redirect,
        }
    }

    /// Picks the account recorded at sign-in, falling back to any cached one.
    async fn active_org_account(&self) -> Option<Account> {
        let accounts = self.org.list_cached_accounts().await;
        let recorded: Option<Account> = self.store.get(ORG_ACCOUNT_KEY);
        recorded
            .and_then(|r| {
                accounts
                    .iter()
                    .find(|a| a.home_account_id == r.home_account_id)
                    .cloned()
            })
            .or_else(|| accounts.into_iter().next())
    }

    /// Ensures a listener, registers a new request with it and builds the URL.
    async fn begin_login(self: &Arc<Self>, provider: Provider) -> Result<Url> {
        let target = self.redirect_target(provider).clone();
        let redirect_uri = target.uri();
        let request = AuthRequest::new_random();
        let pending = PendingSignIn {
            pkce_verifier: request.pkce_verifier.clone(),
            consumer_keys: match provider {
                Provider::Org => None,
                Provider::Consumer => Some(self.consumer.active_keys()),
            },
        };

        let mut slots = self.listeners.lock().await;

        let reusable = slots.get(&provider).is_some_and(|l| l.server.is_accepting());
        if reusable {
            tracing::debug!(%provider, "Reusing active redirect listener");
        } else {
            if let Some(stale) = slots.remove(&provider) {
                tracing::debug!(%provider, id = stale.id, "Replacing closed redirect listener");
                stale.server.close().await;
            }
            let listener = self.start_listener(provider, &target).await?;
            slots.insert(provider, listener);
        }

        let Some(listener) = slots.get(&provider) else {
            return Err(CuratorError::Config("redirect listener missing".to_string()));
        };
        listener
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request.state.clone(), pending);
        let _ = listener.deadline.send(Instant::now() + self.timings.login_timeout);
        drop(slots);

        match provider {
            Provider::Org => self.org.build_authorization_url(
                self.org.scopes(),
                &redirect_uri,
                PromptMode::SelectAccount,
                &request,
            ),
            Provider::Consumer => self.consumer.build_authorization_url(
                self.consumer.scopes(),
                &redirect_uri,
                PromptMode::SelectAccountConsent,
                &request,
            ),
        }
    }

    async fn start_listener(
        self: &Arc<Self>,
        provider: Provider,
        target: &RedirectTarget,
    ) -> Result<ActiveListener> {
        let (tx, rx) = mpsc::channel(4);
        let options = LoopbackOptions {
            port: target.port,
            redirect_path: target.path.clone(),
            grace_period: self.timings.grace_period,
            bind_retry_delay: self.timings.bind_retry_delay,
        };
        let server = LoopbackServer::start(&options, tx).await?;

        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let pending: PendingRequests = Arc::default();
        let (deadline, deadline_rx) = watch::channel(Instant::now() + self.timings.login_timeout);

        tokio::spawn(Arc::clone(self).drive_flow(
            provider,
            id,
            target.uri(),
            rx,
            deadline_rx,
            Arc::clone(&pending),
        ));

        tracing::debug!(%provider, id, port = target.port, "Started redirect listener");
        Ok(ActiveListener {
            id,
            server,
            pending,
            deadline,
        })
    }

    /// Waits for the listener's terminal redirect or its deadline.
    async fn drive_flow(
        self: Arc<Self>,
        provider: Provider,
        id: u64,
        redirect_uri: String,
        mut outcomes: mpsc::Receiver<RedirectOutcome>,
        mut deadline: watch::Receiver<Instant>,
        pending: PendingRequests,
    ) {
        let outcome = loop {
            let until = *deadline.borrow_and_update();
            tokio::select! {
                received = outcomes.recv() => break received,
                () = tokio::time::sleep_until(until) => {
                    // A reusing login may have pushed the deadline out meanwhile.
                    if deadline.has_changed().unwrap_or(false) {
                        continue;
                    }
                    if self.expire_listener(provider, id).await {
                        return;
                    }
                }
            }
        };

        let Some(outcome) = outcome else {
            tracing::debug!(%provider, id, "Redirect listener closed without a response");
            return;
        };

        let event = match outcome {
            RedirectOutcome::Code { code, state } => {
                let sign_in = state.as_ref().and_then(|s| {
                    pending
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(s)
                });
                match sign_in {
                    Some(sign_in) => self.complete(provider, &code, &redirect_uri, &sign_in).await,
                    None => {
                        tracing::warn!(%provider, "Redirect state matched no pending sign-in");
                        AuthEvent::SignInFailed {
                            provider,
                            message: CuratorError::StateMismatch.to_string(),
                        }
                    },
                }
            },
            RedirectOutcome::Error { error, description } => {
                let description = description.unwrap_or_else(|| error.clone());
                AuthEvent::SignInFailed {
                    provider,
                    message: CuratorError::AuthorizationDenied { error, description }.to_string(),
                }
            },
        };
        self.emit(event);

        // The listener shuts itself down after the grace period.
        tokio::time::sleep(self.timings.grace_period).await;
        if let Some(listener) = self.take_listener(provider, id).await {
            listener.server.close().await;
        }
    }

    async fn complete(
        &self,
        provider: Provider,
        code: &str,
        redirect_uri: &str,
        sign_in: &PendingSignIn,
    ) -> AuthEvent {
        let verifier = &sign_in.pkce_verifier;
        let result = match (provider, &sign_in.consumer_keys) {
            (Provider::Org, _) => self
                .org
                .exchange_code_for_tokens(code, self.org.scopes(), redirect_uri, verifier)
                .await
                .inspect(|credential| self.store.set(ORG_ACCOUNT_KEY, &credential.account)),
            (Provider::Consumer, Some(keys)) => {
                let scopes = self.consumer.scopes();
                self.consumer
                    .exchange_code_into(keys, code, scopes, redirect_uri, verifier)
                    .await
            },
            (Provider::Consumer, None) => {
                let scopes = self.consumer.scopes();
                self.consumer
                    .exchange_code_for_tokens(code, scopes, redirect_uri, verifier)
                    .await
            },
        };

        match result {
            Ok(credential) => AuthEvent::SignedIn {
                provider,
                account: credential.account,
            },
            Err(e) => AuthEvent::SignInFailed {
                provider,
                message: e.to_string(),
            },
        }
    }

    /// Removes the listener from its slot unless it was already replaced.
    async fn take_listener(&self, provider: Provider, id: u64) -> Option<ActiveListener> {
        let mut slots = self.listeners.lock().await;
        match slots.get(&provider) {
            Some(l) if l.id == id => slots.remove(&provider),
            _ => None,
        }
    }

    /// Closes the listener if its deadline has really passed.
    ///
    /// Returns `false` when a login extended the deadline in the meantime.
    async fn expire_listener(&self, provider: Provider, id: u64) -> bool {
        let listener = {
            let mut slots = self.listeners.lock().await;
            match slots.get(&provider) {
                Some(l) if l.id == id => {
                    if *l.deadline.borrow() > Instant::now() {
                        return false;
                    }
                    slots.remove(&provider)
                },
                _ => None,
            }
        };
        let Some(listener) = listener else {
            return true;
        };

        tracing::warn!(%provider, "Sign-in timed out waiting for the browser");
        listener.server.close().await;
        self.emit(AuthEvent::SignInFailed {
            provider,
            message: CuratorError::LoginTimeout {
                provider,
                secs: self.timings.login_timeout.as_secs(),
            }
            .to_string(),
        });
        true
    }
}
