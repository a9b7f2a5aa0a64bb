//! Remote function invocation

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use url::Url;

use crate::error::{ProxyError, Result};

/// Header set by the invocation API when the function itself failed
pub const FUNCTION_ERROR_HEADER: &str = "x-amz-function-error";

const INVOKE_PATH_PREFIX: &str = "2015-03-31/functions";

/// Failure of a single remote invocation
#[derive(Error, Debug)]
pub enum InvokeError {
    #[error("function error: {0}")]
    Fault(String),

    #[error("invocation transport failed: {0}")]
    Transport(String),

    #[error("invocation returned status {0}")]
    Status(u16),
}

/// A resolved remote function: a bare name invoked through the invocation
/// API, or an absolute function URL invoked directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRef {
    name: String,
    invoke_url: Url,
}

impl FunctionRef {
    pub fn resolve(reference: &str, endpoint: &Url) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ProxyError::InvalidConfig(
                "empty remote function reference".to_string(),
            ));
        }

        if reference.starts_with("http://") || reference.starts_with("https://") {
            let invoke_url = Url::parse(reference).map_err(|e| {
                ProxyError::InvalidConfig(format!("invalid function URL {}: {}", reference, e))
            })?;
            return Ok(Self {
                name: reference.to_string(),
                invoke_url,
            });
        }

        if reference.contains('/') {
            return Err(ProxyError::InvalidConfig(format!(
                "invalid function name: {}",
                reference
            )));
        }

        let raw = format!(
            "{}/{}/{}/invocations",
            endpoint.as_str().trim_end_matches('/'),
            INVOKE_PATH_PREFIX,
            reference
        );
        let invoke_url = Url::parse(&raw)
            .map_err(|e| ProxyError::InvalidConfig(format!("invalid function {}: {}", reference, e)))?;

        Ok(Self {
            name: reference.to_string(),
            invoke_url,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn invoke_url(&self) -> &Url {
        &self.invoke_url
    }
}

impl fmt::Display for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Synchronously invokes a remote function with a serialized request
#[async_trait]
pub trait RemoteInvoker: Send + Sync {
    async fn invoke(
        &self,
        function: &FunctionRef,
        payload: Bytes,
    ) -> std::result::Result<Bytes, InvokeError>;
}

/// Invokes functions over the HTTP invocation API
pub struct HttpInvoker {
    client: reqwest::Client,
}

impl HttpInvoker {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ProxyError::Internal(format!("failed to build invoke client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RemoteInvoker for HttpInvoker {
    async fn invoke(
        &self,
        function: &FunctionRef,
        payload: Bytes,
    ) -> std::result::Result<Bytes, InvokeError> {
        let response = self
            .client
            .post(function.invoke_url().clone())
            .header(CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| InvokeError::Transport(e.to_string()))?;

        let status = response.status();
        let fault = response
            .headers()
            .get(FUNCTION_ERROR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| InvokeError::Transport(e.to_string()))?;

        if let Some(kind) = fault {
            let detail = String::from_utf8_lossy(&body[..body.len().min(256)]);
            return Err(InvokeError::Fault(format!("{} {}", kind, detail)));
        }
        if !status.is_success() {
            return Err(InvokeError::Status(status.as_u16()));
        }

        Ok(body)
    }
}
