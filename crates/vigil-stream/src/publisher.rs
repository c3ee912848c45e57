//! Outbound publisher seam.
//!
//! Publishing distinguishes transient failures (retry by re-queueing at the
//! buffer head, preserving FIFO order) from fatal ones (count and drop). The
//! Pub/Sub implementation posts single-message batches to the REST publish
//! endpoint; deployment provides credentials the usual way.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use tracing::debug;

use vigil_core::config::BridgeConfig;

/// Why a publish did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// Worth retrying: 5xx, 429, timeouts, connection resets.
    #[error("transient publish failure: {0}")]
    Transient(String),
    /// Not worth retrying: the message or configuration is wrong.
    #[error("fatal publish failure: {0}")]
    Fatal(String),
}

/// Outbound topic publisher.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, payload: &[u8]) -> Result<(), PublishError>;
}

/// Publishes to a Google Pub/Sub topic over REST.
pub struct PubSubPublisher {
    client: reqwest::Client,
    publish_url: String,
    bearer_token: Option<String>,
}

impl PubSubPublisher {
    pub fn new(config: &BridgeConfig, bearer_token: Option<String>) -> Result<PubSubPublisher, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(config.publish_timeout_seconds))
            .build()?;
        Ok(PubSubPublisher {
            client,
            publish_url: format!(
                "https://pubsub.googleapis.com/v1/projects/{}/topics/{}:publish",
                config.pubsub_project, config.pubsub_topic
            ),
            bearer_token,
        })
    }
}

#[async_trait]
impl Publisher for PubSubPublisher {
    async fn publish(&self, payload: &[u8]) -> Result<(), PublishError> {
        let body = serde_json::json!({
            "messages": [
                { "data": base64::engine::general_purpose::STANDARD.encode(payload) }
            ]
        });

        let mut request = self.client.post(&self.publish_url).json(&body);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            // reqwest timeouts and connection errors are worth a retry.
            PublishError::Transient(e.to_string())
        })?;

        let status = response.status();
        if status.is_success() {
            debug!("published message");
            return Ok(());
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(PublishError::Transient(format!("HTTP {status}")));
        }
        let detail: String = response
            .text()
            .await
            .unwrap_or_default()
            .chars()
            .take(200)
            .collect();
        Err(PublishError::Fatal(format!("HTTP {status}: {detail}")))
    }
}
