//! Proxy listener using hyper
//!
//! Accepts client connections and serves each on its own task.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::error::{ProxyError, Result};
use crate::proxy::handler::ProxyHandler;

/// Proxy server
pub struct ProxyServer {
    host: String,
    port: u16,
    handler: Arc<ProxyHandler>,
}

impl ProxyServer {
    pub fn new(host: String, port: u16, handler: Arc<ProxyHandler>) -> Self {
        Self {
            host,
            port,
            handler,
        }
    }

    /// Bind the configured host and port and serve until shutdown. The host
    /// may be a name such as `localhost`.
    #[instrument(skip(self, shutdown), fields(host = %self.host, port = self.port))]
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = self.bind().await?;
        Self::serve(listener, Arc::clone(&self.handler), shutdown).await
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                ProxyError::InvalidConfig(format!(
                    "cannot listen on {}:{}: {}",
                    self.host, self.port, e
                ))
            })?;
        info!("Proxy server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept loop over an already bound listener
    pub async fn serve(
        listener: TcpListener,
        handler: Arc<ProxyHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let handler = Arc::clone(&handler);
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, client_addr, handler).await {
                                    debug!(client = %client_addr, "Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a single client connection
    async fn handle_connection(
        stream: TcpStream,
        client_addr: SocketAddr,
        handler: Arc<ProxyHandler>,
    ) -> Result<()> {
        debug!(client = %client_addr, "Accepted connection");
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let handler = Arc::clone(&handler);
            async move { Ok::<_, Infallible>(handler.handle(req).await) }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await?;

        Ok(())
    }
}
