//! Request path shared by plain HTTP and intercepted HTTPS
//!
//! Filters headers, times the request and hands it to the request backend,
//! then turns the result into a client response.

use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use tracing::{info, instrument, warn};
use url::Url;

use super::headers::HeaderPolicy;
use crate::backend::RequestBackend;
use crate::error::{ProxyError, Result};
use crate::models::ProxyResponse;
use crate::stats::ProxyStats;

pub struct Forwarder {
    backend: Arc<RequestBackend>,
    headers: HeaderPolicy,
    stats: Arc<ProxyStats>,
    verbose: bool,
}

impl Forwarder {
    pub fn new(
        backend: Arc<RequestBackend>,
        headers: HeaderPolicy,
        stats: Arc<ProxyStats>,
        verbose: bool,
    ) -> Self {
        Self {
            backend,
            headers,
            stats,
            verbose,
        }
    }

    pub fn backend(&self) -> &Arc<RequestBackend> {
        &self.backend
    }

    /// Read the client's body, forward to `url` and build the client response
    #[instrument(skip(self, req, url), fields(method = %req.method(), url = %url))]
    pub async fn serve(&self, req: Request<Incoming>, url: Url) -> Response<Full<Bytes>> {
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("Failed to read body: {}", e),
                )
            }
        };

        match self.forward(parts.method, url, &parts.headers, body).await {
            Ok(response) => self.client_response(response),
            Err(e) => {
                warn!(error = %e, "Request failed");
                error_response(e.status_code(), &e.to_string())
            }
        }
    }

    /// Forward one request through the backend
    pub async fn forward(
        &self,
        method: Method,
        url: Url,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<ProxyResponse> {
        let _timer = self.stats.record_delay();

        let request = crate::models::ProxyRequest::new(
            method,
            url,
            self.headers.outbound(headers),
            Some(body),
        )?;
        if self.verbose {
            info!(
                method = %request.method(),
                url = %request.url(),
                headers = ?request.headers(),
                "Proxying request"
            );
        }

        let response = self.backend.fulfill(request).await?;
        if self.verbose {
            info!(
                status = response.status().as_u16(),
                size = response.body().len(),
                headers = ?response.headers(),
                "Upstream response"
            );
        }
        Ok(response)
    }

    fn client_response(&self, response: ProxyResponse) -> Response<Full<Bytes>> {
        let (status, headers, body) = response.into_parts();
        let mut resp = Response::new(Full::new(body));
        *resp.status_mut() = status;
        *resp.headers_mut() = self.headers.inbound(&headers);
        resp
    }
}

/// Plain-text error response
pub fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(message.to_string())));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    resp
}

/// Absolute URL of a request made to the proxy in origin form over an
/// intercepted tunnel
pub fn intercepted_url(authority: &str, req: &Request<Incoming>) -> Result<Url> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Url::parse(&format!("https://{}{}", authority, path)).map_err(ProxyError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RemoteWorkerBackend;
    use crate::config::{DispatchStrategy, WorkerConfig};
    use crate::stats::{StatsRecorder, PROXY_MODEL};
    use crate::transport::LargePayloadTransport;
    use crate::workers::testing::ScriptedInvoker;
    use crate::workers::{InvokeError, RemoteInvoker, WorkerPool};

    fn forwarder(invoker: ScriptedInvoker, stats: &StatsRecorder) -> Forwarder {
        let config = WorkerConfig {
            functions: vec!["fn".to_string()],
            invoke_endpoint: Url::parse("http://127.0.0.1:9001").unwrap(),
            strategy: DispatchStrategy::ShortLived,
            max_workers: 1,
            persistent_workers: 1,
            overflow_threshold: 0,
            invoke_timeout: 5,
            queue_timeout: 5,
        };
        let invoker: Arc<dyn RemoteInvoker> = Arc::new(invoker);
        let pool = Arc::new(WorkerPool::new(&config, invoker, stats).unwrap());
        let backend = RequestBackend::Remote(RemoteWorkerBackend::new(
            pool,
            Arc::new(LargePayloadTransport::Disabled),
            stats.proxy_model(PROXY_MODEL),
        ));
        Forwarder::new(
            Arc::new(backend),
            HeaderPolicy::new(false),
            stats.proxy_model(PROXY_MODEL),
            true,
        )
    }

    #[tokio::test]
    async fn test_forward_filters_headers_and_records_delay() {
        let stats = StatsRecorder::new();
        let invoker = ScriptedInvoker::with(|payload| {
            let request: serde_json::Value = serde_json::from_slice(payload).unwrap();
            let leaked = request["headers"].get("proxy-connection").is_some();
            Ok(Bytes::from(format!(
                r#"{{"statusCode":200,"headers":{{"connection":"keep-alive","x-leaked":"{}"}}}}"#,
                leaked
            )))
        });
        let forwarder = forwarder(invoker, &stats);

        let mut headers = HeaderMap::new();
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        let response = forwarder
            .forward(
                Method::GET,
                Url::parse("http://example.com/").unwrap(),
                &headers,
                Bytes::new(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()["x-leaked"], "false");

        let client = forwarder.client_response(response);
        assert!(client.headers().get("connection").is_none());
        assert_eq!(client.headers()["content-length"], "0");
        assert_eq!(stats.proxy_model(PROXY_MODEL).total_requests(), 1);
    }

    #[tokio::test]
    async fn test_forward_error_still_records_delay() {
        let stats = StatsRecorder::new();
        let invoker = ScriptedInvoker::with(|_| Err(InvokeError::Status(500)));
        let forwarder = forwarder(invoker, &stats);

        let err = forwarder
            .forward(
                Method::GET,
                Url::parse("http://example.com/").unwrap(),
                &HeaderMap::new(),
                Bytes::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(stats.proxy_model(PROXY_MODEL).total_requests(), 1);
    }

    #[test]
    fn test_error_response() {
        let resp = error_response(StatusCode::BAD_GATEWAY, "boom");
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(resp.headers()[CONTENT_TYPE], "text/plain");
    }
}
