//! Provider API client.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::RetryTransientMiddleware;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::auth::providers::ConsumerProfile;
use crate::auth::Provider;
use crate::client::middleware::AuthMiddleware;
use crate::client::AccessTokenSource;
use crate::config::{ApiConfig, CuratorConfig};
use crate::error::{CuratorError, Result};

/// Who a provider says the signed-in user is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserProfile {
    pub provider: Provider,
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphUser {
    id: String,
    display_name: Option<String>,
    mail: Option<String>,
    user_principal_name: Option<String>,
}

/// HTTP client that authenticates requests with the coordinator's tokens.
pub struct ApiClient {
    client: ClientWithMiddleware,
    graph_url: Url,
    userinfo_url: Url,
}

impl ApiClient {
    /// Create a new API client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &CuratorConfig, source: Arc<dyn AccessTokenSource>) -> Result<Self> {
        Self::with_endpoints(
            &config.api,
            config.auth.consumer.userinfo_url.clone(),
            source,
        )
    }

    fn with_endpoints(
        config: &ApiConfig,
        userinfo_url: Url,
        source: Arc<dyn AccessTokenSource>,
    ) -> Result<Self> {
        let inner_client = Client::builder()
            .user_agent(format!("curator/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(config.max_retries);

        let client = ClientBuilder::new(inner_client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .with(AuthMiddleware::new(source))
            .build();

        Ok(Self {
            client,
            graph_url: config.graph_url.clone(),
            userinfo_url,
        })
    }

    /// GETs `url` with `provider`'s token and decodes the JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`CuratorError::Unauthorized`] on 401, [`CuratorError::ApiError`]
    /// on other failure statuses.
    pub async fn get_json<T: DeserializeOwned>(&self, provider: Provider, url: Url) -> Result<T> {
        let response = self
            .client
            .get(url)
            .with_extension(provider)
            .header(http::header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(CuratorError::Unauthorized);
        }
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(CuratorError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json()
            .await
            .map_err(|e| CuratorError::Serialization(e.to_string()))
    }

    /// Fetches the signed-in user's profile from `provider`.
    pub async fn fetch_profile(&self, provider: Provider) -> Result<UserProfile> {
        match provider {
            Provider::Org => {
                let url = self.graph_url.join("me")?;
                let user: GraphUser = self.get_json(provider, url).await?;
                Ok(UserProfile {
                    provider,
                    id: user.id,
                    name: user.display_name,
                    email: user.mail.or(user.user_principal_name),
                })
            },
            Provider::Consumer => {
                let profile: ConsumerProfile =
                    self.get_json(provider, self.userinfo_url.clone()).await?;
                Ok(UserProfile {
                    provider,
                    id: profile.sub.unwrap_or_default(),
                    name: profile.name,
                    email: profile.email,
                })
            },
        }
    }
}
