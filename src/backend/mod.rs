//! Request and stream backends
//!
//! A `RequestBackend` fulfils one HTTP request; a `StreamBackend` fulfils a
//! CONNECT tunnel. Each is a closed set of variants.

mod local;
mod remote;
mod tunnel;

pub use local::LocalRequestBackend;
pub use remote::RemoteWorkerBackend;
pub use tunnel::{relay, LocalStreamBackend};

use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::ServerConfig;

use crate::error::{ProxyError, Result};
use crate::mitm::InterceptingStreamBackend;
use crate::models::{ProxyRequest, ProxyResponse};

pub enum RequestBackend {
    Local(LocalRequestBackend),
    Remote(RemoteWorkerBackend),
}

impl RequestBackend {
    /// Fulfil one request. Headers must already be filtered.
    pub async fn fulfill(&self, request: ProxyRequest) -> Result<ProxyResponse> {
        match self {
            Self::Local(backend) => backend.fulfill(request).await,
            Self::Remote(backend) => backend.fulfill(request).await,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Remote(_) => "remote",
        }
    }
}

pub enum StreamBackend {
    Local(LocalStreamBackend),
    Intercepting(InterceptingStreamBackend),
}

/// What a CONNECT resolved to before the client is told it succeeded
pub enum TunnelTarget {
    /// Connected socket to the real target
    Socket(TcpStream),
    /// Decrypt locally with a certificate issued for `host`
    Intercept {
        host: String,
        port: u16,
        tls: Arc<ServerConfig>,
    },
}

impl StreamBackend {
    /// Prepare a tunnel to `host:port`. Failure means no tunnel is opened.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TunnelTarget> {
        match self {
            Self::Local(backend) => backend.connect(host, port).await.map(TunnelTarget::Socket),
            Self::Intercepting(backend) => {
                let tls = backend.server_config(host).await?;
                Ok(TunnelTarget::Intercept {
                    host: host.to_string(),
                    port,
                    tls,
                })
            }
        }
    }

    /// Serve the client side of an established tunnel until it closes
    pub async fn stream<C>(&self, client: C, target: TunnelTarget) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match (self, target) {
            (Self::Local(backend), TunnelTarget::Socket(remote)) => {
                backend.stream(client, remote).await.map(|_| ())
            }
            (Self::Intercepting(backend), TunnelTarget::Intercept { host, port, tls }) => {
                backend.stream(client, host, port, tls).await
            }
            (Self::Local(_), TunnelTarget::Intercept { .. })
            | (Self::Intercepting(_), TunnelTarget::Socket(_)) => Err(ProxyError::Internal(
                "tunnel target from another backend".to_string(),
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Intercepting(_) => "intercepting",
        }
    }
}

/// Make the declared length match the body actually returned: drop
/// `Transfer-Encoding` and rewrite `Content-Length`, except for HEAD where the
/// upstream's declared length stands.
pub fn normalize_response(
    method: &Method,
    status: StatusCode,
    mut headers: HeaderMap,
    body: Bytes,
) -> ProxyResponse {
    headers.remove(TRANSFER_ENCODING);
    if *method != Method::HEAD {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    }
    ProxyResponse::new(status, headers, body)
}
