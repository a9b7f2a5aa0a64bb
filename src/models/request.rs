use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use url::Url;

use crate::error::{ProxyError, Result};

/// A single HTTP request to be fulfilled by a backend.
///
/// Headers have already been filtered by the caller.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl ProxyRequest {
    /// Build a request. GET never carries a body; empty bodies are dropped.
    pub fn new(method: Method, url: Url, headers: HeaderMap, body: Option<Bytes>) -> Result<Self> {
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ProxyError::InvalidRequest(format!(
                    "unsupported scheme: {}",
                    other
                )))
            }
        }
        if url.host_str().is_none() {
            return Err(ProxyError::InvalidRequest(format!(
                "missing host in {}",
                url
            )));
        }

        let body = if method == Method::GET {
            None
        } else {
            body.filter(|b| !b.is_empty())
        };

        Ok(Self {
            method,
            url,
            headers,
            body,
        })
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Bytes sent upstream, counting the request line, headers and body
    pub fn wire_size(&self) -> u64 {
        let head = self.method.as_str().len() + self.url.as_str().len();
        let headers: usize = self
            .headers
            .iter()
            .map(|(k, v)| k.as_str().len() + v.len() + 4)
            .sum();
        (head + headers + self.body.as_ref().map_or(0, |b| b.len())) as u64
    }
}

/// The response produced for exactly one `ProxyRequest`
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl ProxyResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_parts(self) -> (StatusCode, HeaderMap, Bytes) {
        (self.status, self.headers, self.body)
    }

    /// Bytes received from upstream, counting headers and body
    pub fn wire_size(&self) -> u64 {
        let headers: usize = self
            .headers
            .iter()
            .map(|(k, v)| k.as_str().len() + v.len() + 4)
            .sum();
        (headers + self.body.len()) as u64
    }
}
