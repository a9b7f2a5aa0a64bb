//! Message-queue backed payloads
//!
//! Workers publish oversized bodies as base64 text messages. The proxy
//! receives a message by id and acknowledges it by deleting it.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use reqwest::StatusCode;
use tracing::warn;
use url::Url;

use super::TransportError;

/// Queue holding bodies that workers could not return inline
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Receive and acknowledge one message, returning its decoded payload
    async fn receive(&self, message_id: &str) -> Result<Bytes, TransportError>;
}

/// Queue gateway exposed over HTTP at `{queue_url}/messages/{id}`. This is
/// a plain HTTP protocol, not the SQS API.
pub struct HttpMessageQueue {
    client: reqwest::Client,
    base: Url,
}

impl HttpMessageQueue {
    pub fn new(base: Url) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Backend(e.to_string()))?;
        Ok(Self { client, base })
    }

    fn message_url(&self, message_id: &str) -> Result<Url, TransportError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::Backend(format!("invalid queue URL {}", self.base)))?
            .pop_if_empty()
            .push("messages")
            .push(message_id);
        Ok(url)
    }
}

#[async_trait]
impl MessageQueue for HttpMessageQueue {
    async fn receive(&self, message_id: &str) -> Result<Bytes, TransportError> {
        let url = self.message_url(message_id)?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| TransportError::Backend(e.to_string()))?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                return Err(TransportError::MessageNotFound(message_id.to_string()))
            }
            status => {
                return Err(TransportError::Backend(format!(
                    "queue returned status {} for {}",
                    status, message_id
                )))
            }
        }

        let text = response
            .bytes()
            .await
            .map_err(|e| TransportError::Backend(e.to_string()))?;
        let payload = BASE64
            .decode(text.trim_ascii())
            .map_err(|e| TransportError::Backend(format!("malformed message {}: {}", message_id, e)))?;

        match self.client.delete(url).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(message_id, status = %resp.status(), "Failed to acknowledge message"),
            Err(e) => warn!(message_id, error = %e, "Failed to acknowledge message"),
        }

        Ok(Bytes::from(payload))
    }
}
