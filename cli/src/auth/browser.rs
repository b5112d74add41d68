//! Launching the authorization URL in the user's browser.

use url::Url;

use crate::error::{CuratorError, Result};

/// Opens an authorization URL for the user.
pub trait BrowserLauncher: Send + Sync {
    /// Hands `url` to a browser.
    ///
    /// # Errors
    ///
    /// Returns [`CuratorError::Browser`] if no browser could be started.
    fn open(&self, url: &Url) -> Result<()>;
}

/// Uses the platform's default browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &Url) -> Result<()> {
        open::that(url.as_str()).map_err(|e| CuratorError::Browser(e.to_string()))
    }
}

/// Never opens anything; the caller prints the URL instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualBrowser;

impl BrowserLauncher for ManualBrowser {
    fn open(&self, _url: &Url) -> Result<()> {
        Err(CuratorError::Browser("automatic browser launch disabled".to_string()))
    }
}
