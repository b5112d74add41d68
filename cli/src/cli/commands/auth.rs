//! Authentication command handlers.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::auth::{
    Account, AuthCoordinator, AuthEvent, BrowserLauncher, CredentialStore, ManualBrowser,
    Provider, ProviderStatus, SystemBrowser,
};
use crate::client::ApiClient;
use crate::config::{load_config, resolve_store_path, CuratorConfig};
use crate::error::{CuratorError, Result, SilentAuthFailure};

/// Opens the store and builds a coordinator for one command.
fn coordinator(config: &CuratorConfig, no_browser: bool) -> Result<AuthCoordinator> {
    let store = Arc::new(CredentialStore::open(resolve_store_path(config)?));
    let browser: Arc<dyn BrowserLauncher> = if no_browser {
        Arc::new(ManualBrowser)
    } else {
        Arc::new(SystemBrowser)
    };
    AuthCoordinator::new(&config.auth, store, browser)
}

/// Handle the `curator auth login` command.
pub async fn handle_login(
    provider: Provider,
    no_browser: bool,
    user: Option<String>,
) -> Result<()> {
    let config = load_config()?;
    let coordinator = coordinator(&config, no_browser)?;
    coordinator.set_active_user(user.as_deref());

    // Subscribe first so a fast redirect is not missed.
    let mut events = coordinator.subscribe();

    println!("Signing in with {}...", provider.display_name());
    println!();

    let started = coordinator.login(provider).await?;
    if started.browser_opened {
        println!("Browser opened. Complete the sign-in there.");
    } else {
        println!("To sign in, please visit:");
        println!();
        println!("  {}", started.authorization_url);
    }
    println!();
    println!("Waiting for authorization...");

    let outcome = wait_for_outcome(&mut events, provider).await;
    coordinator.shutdown().await;

    let account = outcome?;
    println!();
    println!("Successfully signed in as {account}!");
    Ok(())
}

async fn wait_for_outcome(
    events: &mut broadcast::Receiver<AuthEvent>,
    provider: Provider,
) -> Result<Account> {
    loop {
        match events.recv().await {
            Ok(event) if event.provider() != provider => {},
            Ok(AuthEvent::SignedIn { account, .. }) => return Ok(account),
            Ok(AuthEvent::SignInFailed { message, .. }) => {
                return Err(CuratorError::SignInFailed(message));
            },
            Ok(AuthEvent::SignedOut { .. }) => {},
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Missed sign-in events");
            },
            Err(broadcast::error::RecvError::Closed) => {
                return Err(CuratorError::SignInFailed("sign-in was abandoned".to_string()));
            },
        }
    }
}

/// Handle the `curator auth logout` command.
pub async fn handle_logout(providers: &[Provider], user: Option<String>) -> Result<()> {
    let config = load_config()?;
    let coordinator = coordinator(&config, true)?;
    coordinator.set_active_user(user.as_deref());

    for &provider in providers {
        let had_accounts = !coordinator.status(provider).await.accounts.is_empty();
        coordinator.logout(provider).await;
        if had_accounts {
            println!("Signed out of {}.", provider.display_name());
        } else {
            println!("Not signed in to {}.", provider.display_name());
        }
    }

    Ok(())
}

/// Handle the `curator auth logout --all` command.
pub async fn handle_logout_all() -> Result<()> {
    let config = load_config()?;
    let coordinator = coordinator(&config, true)?;
    coordinator.logout_all().await;

    println!("Signed out of every account.");
    println!(
        "Cleared credential store at {}.",
        resolve_store_path(&config)?.display()
    );
    Ok(())
}

/// Handle the `curator auth token` command.
pub async fn handle_token(provider: Provider, user: Option<String>) -> Result<()> {
    let config = load_config()?;
    let coordinator = coordinator(&config, true)?;
    coordinator.set_active_user(user.as_deref());

    let token = coordinator.access_token(provider).await.map_err(|reason| {
        eprintln!("{}", token_failure_hint(provider, &reason));
        CuratorError::SilentAuth(reason)
    })?;
    println!("{token}");
    Ok(())
}

/// Tells an expired session apart from an account that was never connected.
fn token_failure_hint(provider: Provider, reason: &SilentAuthFailure) -> String {
    let name = provider.display_name();
    if reason.is_session_expired() {
        format!("Your {name} session has expired. Run 'curator auth login {provider}' to sign in again.")
    } else if matches!(reason, SilentAuthFailure::NoCredential) {
        format!("No {name} account is connected yet. Run 'curator auth login {provider}' to connect one.")
    } else {
        format!("Could not reach {name} to refresh the token. Try again later.")
    }
}

/// Handle the `curator auth status` command.
pub async fn handle_status(json: bool) -> Result<()> {
    let config = load_config()?;
    let coordinator = coordinator(&config, true)?;

    let mut statuses = Vec::with_capacity(Provider::ALL.len());
    for provider in Provider::ALL {
        statuses.push(coordinator.status(provider).await);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    for (i, status) in statuses.iter().enumerate() {
        if i > 0 {
            println!();
        }
        print_status(status);
    }
    Ok(())
}

fn print_status(status: &ProviderStatus) {
    let name = status.provider.display_name();
    let Some(account) = &status.active_account else {
        println!("{name}: not signed in");
        println!("  Run 'curator auth login {}' to connect.", status.provider);
        return;
    };

    println!("{name}: signed in");
    println!();
    println!("  Account:    {account}");
    if let Some(expires_at) = status.expires_at {
        let state = if expires_at > chrono::Utc::now() { "valid" } else { "expired" };
        println!("  Token:      {state} (expires {})", expires_at.to_rfc3339());
    }
    println!(
        "  Refresh:    {}",
        if status.can_refresh { "available" } else { "unavailable" }
    );
    if status.accounts.len() > 1 {
        println!("  Cached:     {} accounts", status.accounts.len());
    }
}

/// Handle the `curator auth accounts` command.
pub async fn handle_accounts(providers: &[Provider]) -> Result<()> {
    let config = load_config()?;
    let coordinator = coordinator(&config, true)?;

    for &provider in providers {
        let status = coordinator.status(provider).await;
        println!("{}:", provider.display_name());
        if status.accounts.is_empty() {
            println!("  (none)");
        }
        for account in &status.accounts {
            let marker = if status.active_account.as_ref() == Some(account) { "*" } else { " " };
            println!(" {marker} {account}");
        }
    }
    Ok(())
}

/// Handle the `curator auth whoami` command.
pub async fn handle_whoami(provider: Provider, user: Option<String>) -> Result<()> {
    let config = load_config()?;
    let coordinator = coordinator(&config, true)?;
    coordinator.set_active_user(user.as_deref());

    let api = ApiClient::new(&config, Arc::new(coordinator))?;
    let profile = api.fetch_profile(provider).await?;

    println!("Provider: {}", provider.display_name());
    println!("ID:       {}", profile.id);
    if let Some(name) = &profile.name {
        println!("Name:     {name}");
    }
    if let Some(email) = &profile.email {
        println!("Email:    {email}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_hint_separates_expired_from_never_connected() {
        let expired = token_failure_hint(
            Provider::Consumer,
            &SilentAuthFailure::Rejected {
                code: "invalid_grant".to_string(),
                description: "Token has been expired or revoked.".to_string(),
            },
        );
        assert!(expired.contains("session has expired"));
        assert!(expired.contains("curator auth login consumer"));

        let never = token_failure_hint(Provider::Org, &SilentAuthFailure::NoCredential);
        assert!(never.contains("No "));
        assert!(never.contains("curator auth login org"));
        assert!(!never.contains("expired"));

        let offline = token_failure_hint(
            Provider::Org,
            &SilentAuthFailure::Network("reset".to_string()),
        );
        assert!(offline.contains("Try again later"));
    }
}
