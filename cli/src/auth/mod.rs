//! Authentication module for curator.
//!
//! Interactive sign-in uses the OAuth authorization-code flow with PKCE and a
//! loopback redirect listener, for an organizational (Microsoft) and a
//! consumer (Google) identity. Tokens are kept in a JSON credential store and
//! refreshed silently on access.

pub mod browser;
pub mod cache;
pub mod coordinator;
pub mod credentials;
pub mod loopback;
pub mod providers;
pub mod tokens;

pub use browser::{BrowserLauncher, ManualBrowser, SystemBrowser};
pub use coordinator::{AuthCoordinator, AuthEvent, ProviderStatus};
pub use credentials::CredentialStore;
pub use tokens::{Account, Provider};
