use hyper::StatusCode;
use thiserror::Error;

use crate::transport::TransportError;
use crate::workers::InvokeError;

/// Unified error type for the proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    // Tunnel errors
    #[error("Connect failed: {0}")]
    Connect(String),

    // Remote fulfilment errors
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("Large payload transport error: {0}")]
    PayloadTransport(#[from] TransportError),

    // Interception errors
    #[error("TLS error: {0}")]
    Tls(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Get the HTTP status code reported to the client for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,

            // 502 Bad Gateway
            ProxyError::Connect(_)
            | ProxyError::Upstream(_)
            | ProxyError::PayloadTransport(_)
            | ProxyError::Tls(_) => StatusCode::BAD_GATEWAY,

            // 504 Gateway Timeout
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            ProxyError::InvalidConfig(_)
            | ProxyError::Io(_)
            | ProxyError::Http(_)
            | ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Remote fulfilment failed. Timeouts and unresolved large payloads count
    /// as upstream failures.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            ProxyError::Upstream(_) | ProxyError::Timeout(_) | ProxyError::PayloadTransport(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProxyError::Timeout(_))
    }
}

impl From<InvokeError> for ProxyError {
    fn from(err: InvokeError) -> Self {
        ProxyError::Upstream(err.to_string())
    }
}

// Convert from hyper errors
impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::Http(err.to_string())
    }
}

impl From<http::Error> for ProxyError {
    fn from(err: http::Error) -> Self {
        ProxyError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for ProxyError {
    fn from(err: url::ParseError) -> Self {
        ProxyError::InvalidRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_code_mapping() {
        assert_eq!(
            ProxyError::InvalidRequest("bad".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::Connect("refused".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::Upstream("fault".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::Timeout("remote invocation").status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyError::Tls("handshake".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::InvalidConfig("x".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_upstream_subtypes() {
        assert!(ProxyError::Timeout("remote invocation").is_upstream());
        assert!(ProxyError::Upstream("fault".to_string()).is_upstream());
        assert!(
            ProxyError::from(TransportError::ObjectMissing("k".to_string())).is_upstream()
        );
        assert!(!ProxyError::Connect("refused".to_string()).is_upstream());
        assert!(!ProxyError::Tls("bad cert".to_string()).is_upstream());
    }

    #[test]
    fn test_transport_error_surfaces_as_bad_gateway() {
        let err: ProxyError = TransportError::MessageNotFound("m-1".to_string()).into();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert!(err.to_string().contains("m-1"));
    }

    #[test]
    fn test_invoke_error_maps_to_upstream() {
        let err: ProxyError = InvokeError::Fault("Unhandled".to_string()).into();
        assert!(matches!(err, ProxyError::Upstream(_)));
    }
}
