//! Direct-dial request fulfilment

use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderValue, CONNECTION};
use reqwest::redirect::Policy;
use tracing::{debug, instrument};

use super::normalize_response;
use crate::error::{ProxyError, Result};
use crate::models::{ProxyRequest, ProxyResponse};
use crate::stats::ProxyStats;

/// Fulfils requests from this host. Redirects are returned to the client,
/// never followed.
pub struct LocalRequestBackend {
    client: reqwest::Client,
    stats: Arc<ProxyStats>,
}

impl LocalRequestBackend {
    pub fn new(request_timeout: Duration, stats: Arc<ProxyStats>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .no_proxy()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ProxyError::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, stats })
    }

    #[instrument(skip(self, request), fields(method = %request.method(), url = %request.url()))]
    pub async fn fulfill(&self, request: ProxyRequest) -> Result<ProxyResponse> {
        self.stats.record_bytes_up(request.wire_size());

        let mut builder = self
            .client
            .request(request.method().clone(), request.url().clone())
            .headers(request.headers().clone())
            .header(CONNECTION, HeaderValue::from_static("close"));
        if let Some(body) = request.body() {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProxyError::Timeout("upstream request")
            } else {
                ProxyError::Upstream(e.to_string())
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| ProxyError::Upstream(format!("failed to read response: {}", e)))?;
        debug!(status = status.as_u16(), size = body.len(), "Upstream responded");

        let response = normalize_response(request.method(), status, headers, body);
        self.stats.record_bytes_down(response.wire_size());
        Ok(response)
    }
}
