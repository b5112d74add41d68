//! Authentication middleware for injecting Bearer tokens.

use std::sync::Arc;

use async_trait::async_trait;
use http::Extensions;
use reqwest::{Request, Response, StatusCode};
use reqwest_middleware::{Middleware, Next, Result};

use crate::auth::Provider;
use crate::client::AccessTokenSource;

/// Middleware that injects the Bearer token of the request's provider.
///
/// The provider is read from the request extensions; requests without one
/// are sent unauthenticated.
pub struct AuthMiddleware {
    source: Arc<dyn AccessTokenSource>,
}

impl AuthMiddleware {
    /// Create a new authentication middleware.
    #[must_use]
    pub fn new(source: Arc<dyn AccessTokenSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        let provider = extensions.get::<Provider>().copied();

        if let Some(provider) = provider {
            match self.source.access_token(provider).await {
                Some(token) => {
                    if let Ok(value) = format!("Bearer {token}").parse() {
                        req.headers_mut().insert(http::header::AUTHORIZATION, value);
                    }
                },
                None => tracing::debug!(%provider, "No access token; sending request without one"),
            }
        }

        let response = next.run(req, extensions).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            if let Some(provider) = provider {
                tracing::warn!(%provider, "Provider API rejected the access token");
            }
        }
        Ok(response)
    }
}
