//! Stream backend that terminates the client's TLS locally
//!
//! Requests read from the decrypted tunnel go through the same forwarder as
//! plain HTTP requests.

use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use super::CertCache;
use crate::error::{ProxyError, Result};
use crate::proxy::forward::{error_response, intercepted_url, Forwarder};

pub struct InterceptingStreamBackend {
    certs: CertCache,
    forwarder: Arc<Forwarder>,
    handshake_timeout: Duration,
}

impl InterceptingStreamBackend {
    pub fn new(certs: CertCache, forwarder: Arc<Forwarder>, handshake_timeout: Duration) -> Self {
        Self {
            certs,
            forwarder,
            handshake_timeout,
        }
    }

    /// TLS configuration presented to clients connecting to `host`
    pub async fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
        self.certs.get(host).await
    }

    pub fn certs(&self) -> &CertCache {
        &self.certs
    }

    /// Accept TLS from the client, then serve HTTP/1.1 requests over it until
    /// the client closes the tunnel
    pub async fn stream<C>(
        &self,
        client: C,
        host: String,
        port: u16,
        tls: Arc<ServerConfig>,
    ) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let acceptor = TlsAcceptor::from(tls);
        let tls_stream = tokio::time::timeout(self.handshake_timeout, acceptor.accept(client))
            .await
            .map_err(|_| ProxyError::Timeout("TLS handshake"))?
            .map_err(|e| ProxyError::Tls(format!("handshake with client for {} failed: {}", host, e)))?;
        debug!(host = %host, port, "Intercepted tunnel established");

        let authority = if port == 443 {
            host.clone()
        } else {
            format!("{}:{}", host, port)
        };
        let forwarder = Arc::clone(&self.forwarder);
        let service = service_fn(move |req: Request<hyper::body::Incoming>| {
            let forwarder = Arc::clone(&forwarder);
            let authority = authority.clone();
            async move {
                let response = match intercepted_url(&authority, &req) {
                    Ok(url) => forwarder.serve(req, url).await,
                    Err(e) => error_response(e.status_code(), &e.to_string()),
                };
                Ok::<_, hyper::Error>(response)
            }
        });

        if let Err(e) = http1::Builder::new()
            .keep_alive(true)
            .serve_connection(TokioIo::new(tls_stream), service)
            .await
        {
            warn!(host = %host, error = %e, "Intercepted connection error");
            return Err(e.into());
        }
        debug!(host = %host, "Intercepted tunnel closed");
        Ok(())
    }
}
