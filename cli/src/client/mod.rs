//! Authenticated access to the providers' APIs.

pub mod api;
pub mod middleware;

pub use api::ApiClient;

use async_trait::async_trait;

use crate::auth::{AuthCoordinator, Provider};

/// Something that can hand out an access token for a provider.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    /// A usable access token, or `None` if the user has to sign in.
    async fn access_token(&self, provider: Provider) -> Option<String>;
}

#[async_trait]
impl AccessTokenSource for AuthCoordinator {
    async fn access_token(&self, provider: Provider) -> Option<String> {
        self.get_access_token(provider).await
    }
}
