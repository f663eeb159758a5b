//! Pre- and post-execution webhooks.

use crate::core::IdentitySeeds;
use crate::errors::WebhookError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether the orchestrator waits for an answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookDirection {
    /// Notification only; the response body is ignored.
    #[default]
    OneWay,
    /// The response may halt the request or add derived identity.
    TwoWay,
}

/// A registered webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    /// Name used in logs and errors.
    pub name: String,
    /// Endpoint URL.
    pub url: String,
    /// Call direction.
    #[serde(default)]
    pub direction: WebhookDirection,
}

impl Webhook {
    /// A one-way webhook.
    #[must_use]
    pub fn one_way(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            direction: WebhookDirection::OneWay,
        }
    }

    /// A two-way webhook.
    #[must_use]
    pub fn two_way(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            direction: WebhookDirection::TwoWay,
            ..Self::one_way(name, url)
        }
    }
}

/// Body posted to a webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// The request being processed.
    pub privacy_request_id: Uuid,
    /// The request's effective identity.
    pub identity: IdentitySeeds,
    /// Call direction.
    pub direction: WebhookDirection,
}

/// What a two-way webhook answered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookResponse {
    /// Pause the request until it is resumed.
    #[serde(default)]
    pub halt: bool,
    /// Identity values to add to the request.
    #[serde(default)]
    pub derived_identity: Option<IdentitySeeds>,
}

/// Calls webhooks.
#[async_trait]
pub trait WebhookClient: Send + Sync {
    /// Posts the payload and returns the parsed answer. One-way calls
    /// return the default response.
    async fn call(&self, webhook: &Webhook, payload: &WebhookPayload) -> Result<WebhookResponse, WebhookError>;
}

#[cfg(feature = "http")]
pub use http::HttpWebhookClient;

#[cfg(feature = "http")]
mod http {
    use super::{Webhook, WebhookClient, WebhookDirection, WebhookError, WebhookPayload, WebhookResponse};
    use async_trait::async_trait;
    use reqwest::{Client, StatusCode};
    use std::time::Duration;

    /// Webhook client over `reqwest`.
    #[derive(Debug, Clone)]
    pub struct HttpWebhookClient {
        client: Client,
    }

    impl HttpWebhookClient {
        /// Creates a client whose calls time out after `timeout`.
        pub fn new(timeout: Duration) -> Result<Self, WebhookError> {
            let client = Client::builder().timeout(timeout).build().map_err(|e| WebhookError::Permanent {
                name: "client".to_string(),
                message: format!("cannot build HTTP client: {e}"),
            })?;
            Ok(Self { client })
        }
    }

    #[async_trait]
    impl WebhookClient for HttpWebhookClient {
        async fn call(&self, webhook: &Webhook, payload: &WebhookPayload) -> Result<WebhookResponse, WebhookError> {
            let response = self
                .client
                .post(&webhook.url)
                .json(payload)
                .send()
                .await
                .map_err(|e| WebhookError::Transient {
                    name: webhook.name.clone(),
                    message: e.without_url().to_string(),
                })?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                return Err(WebhookError::Transient {
                    name: webhook.name.clone(),
                    message: format!("status {status}"),
                });
            }
            if !status.is_success() {
                return Err(WebhookError::Permanent {
                    name: webhook.name.clone(),
                    message: format!("status {status}"),
                });
            }
            if webhook.direction == WebhookDirection::OneWay {
                return Ok(WebhookResponse::default());
            }

            let body = response.text().await.map_err(|e| WebhookError::Transient {
                name: webhook.name.clone(),
                message: e.without_url().to_string(),
            })?;
            if body.trim().is_empty() {
                return Ok(WebhookResponse::default());
            }
            serde_json::from_str(&body).map_err(|e| WebhookError::InvalidResponse {
                name: webhook.name.clone(),
                message: e.to_string(),
            })
        }
    }

}
