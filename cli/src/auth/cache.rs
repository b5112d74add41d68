//! In-memory token cache for the organizational provider and its
//! persistence hook.
//!
//! The cache is serialized to an opaque string that only this module
//! understands. A [`CachePlugin`] loads the latest blob before every
//! cache-dependent operation and writes it back afterwards, but only when the
//! cache reports that it changed.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::credentials::CredentialStore;
use crate::auth::tokens::{is_expired_at, scopes_cover, Account, Credential, Provider};
use crate::error::Result;

/// Store key holding the serialized organizational cache.
pub const ORG_CACHE_KEY: &str = "org_token_cache";

/// Tokens cached for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub account: Account,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl CacheEntry {
    /// Whether the cached access token can serve `scopes` at `now`.
    #[must_use]
    pub fn serves(&self, scopes: &[String], now: DateTime<Utc>) -> bool {
        !is_expired_at(self.expires_at, now) && scopes_cover(&self.scopes, scopes)
    }

    #[must_use]
    pub fn to_credential(&self) -> Credential {
        Credential {
            provider: Provider::Org,
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_at: self.expires_at,
            account: self.account.clone(),
            scopes: self.scopes.clone(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheDocument {
    #[serde(default)]
    accounts: BTreeMap<String, CacheEntry>,
}

/// Account-keyed token cache with change tracking.
#[derive(Debug, Default)]
pub struct TokenCache {
    doc: CacheDocument,
    changed: bool,
}

impl TokenCache {
    /// Replaces the cache contents with a serialized blob.
    ///
    /// A blob that does not parse loads as an empty cache.
    pub fn deserialize(&mut self, blob: &str) {
        self.doc = serde_json::from_str(blob).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Discarding unreadable organizational token cache");
            CacheDocument::default()
        });
        self.changed = false;
    }

    /// Serializes the cache to its opaque string form.
    pub fn serialize(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.doc)?)
    }

    /// Whether the cache was mutated since it was last loaded or saved.
    #[must_use]
    pub const fn has_changed(&self) -> bool {
        self.changed
    }

    pub fn mark_saved(&mut self) {
        self.changed = false;
    }

    #[must_use]
    pub fn get(&self, home_account_id: &str) -> Option<&CacheEntry> {
        self.doc.accounts.get(home_account_id)
    }

    /// Inserts or overwrites the entry for the entry's account.
    pub fn upsert(&mut self, entry: CacheEntry) {
        let key = entry.account.home_account_id.clone();
        if self.doc.accounts.get(&key) != Some(&entry) {
            self.doc.accounts.insert(key, entry);
            self.changed = true;
        }
    }

    /// Removes an account. Returns `true` if it was cached.
    pub fn remove(&mut self, home_account_id: &str) -> bool {
        let removed = self.doc.accounts.remove(home_account_id).is_some();
        self.changed |= removed;
        removed
    }

    /// Accounts in the cache, sorted by username.
    #[must_use]
    pub fn accounts(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> =
            self.doc.accounts.values().map(|e| e.account.clone()).collect();
        accounts.sort_by(|a, b| a.username.cmp(&b.username));
        accounts
    }
}

/// Load/save hook run around cache-dependent operations.
#[cfg_attr(test, mockall::automock)]
pub trait CachePlugin: Send + Sync {
    /// Loads the latest persisted cache into `cache`.
    fn before_cache_access(&self, cache: &mut TokenCache) -> Result<()>;

    /// Persists `cache` if it changed.
    fn after_cache_access(&self, cache: &mut TokenCache) -> Result<()>;
}

/// Cache plugin backed by the [`CredentialStore`].
pub struct StoreCachePlugin {
    store: Arc<CredentialStore>,
}

impl StoreCachePlugin {
    #[must_use]
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self { store }
    }
}

impl CachePlugin for StoreCachePlugin {
    fn before_cache_access(&self, cache: &mut TokenCache) -> Result<()> {
        match self.store.get::<String>(ORG_CACHE_KEY) {
            Some(blob) => cache.deserialize(&blob),
            None => *cache = TokenCache::default(),
        }
        Ok(())
    }

    fn after_cache_access(&self, cache: &mut TokenCache) -> Result<()> {
        if !cache.has_changed() {
            return Ok(());
        }
        let blob = cache.serialize()?;
        // Cleared first: a failed write still leaves the in-memory store updated.
        cache.mark_saved();
        self.store.try_set(ORG_CACHE_KEY, &blob)
    }
}
