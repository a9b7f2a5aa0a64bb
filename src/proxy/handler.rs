//! Per-request method dispatch
//!
//! CONNECT opens a tunnel through the stream backend; every other method is
//! forwarded through the request backend.

use std::sync::Arc;

use bytes::Bytes;
use http::header::HeaderValue;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::forward::error_response;
use super::instance::ProxyInstance;
use crate::error::{ProxyError, Result};

pub struct ProxyHandler {
    instance: Arc<ProxyInstance>,
}

impl ProxyHandler {
    pub fn new(instance: Arc<ProxyInstance>) -> Self {
        Self { instance }
    }

    /// Handle one client request. Every response carries `Proxy-Connection: close`.
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let mut response = if req.method() == Method::CONNECT {
            self.handle_connect(req).await
        } else {
            self.handle_http(req).await
        };
        response
            .headers_mut()
            .insert("proxy-connection", HeaderValue::from_static("close"));
        response
    }

    async fn handle_connect(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let (host, port) = match parse_authority(&req) {
            Ok(target) => target,
            Err(e) => return error_response(e.status_code(), &e.to_string()),
        };
        debug!(host = %host, port, "CONNECT request");

        // Nothing is promised to the client until the target is ready
        let target = match self.instance.connect(&host, port).await {
            Ok(target) => target,
            Err(e) => {
                warn!(host = %host, port, error = %e, "CONNECT failed");
                return error_response(
                    StatusCode::BAD_GATEWAY,
                    &format!("Failed to establish tunnel: {}", e),
                );
            }
        };

        let on_upgrade: OnUpgrade = hyper::upgrade::on(req);
        let instance = Arc::clone(&self.instance);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let client = TokioIo::new(upgraded);
                    match instance.stream(client, target).await {
                        Ok(()) => debug!(host = %host, port, "Tunnel closed"),
                        Err(e) => debug!(host = %host, port, error = %e, "Tunnel ended with error"),
                    }
                }
                Err(e) => {
                    debug!("CONNECT upgrade failed: {}", e);
                }
            }
        });

        info!("CONNECT tunnel established");
        let mut response = Response::new(Full::new(Bytes::new()));
        response
            .extensions_mut()
            .insert(ReasonPhrase::from_static(b"Connection Established"));
        response
    }

    async fn handle_http(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let url = match absolute_url(&req) {
            Ok(url) => url,
            Err(e) => return error_response(e.status_code(), &e.to_string()),
        };
        self.instance.forwarder().serve(req, url).await
    }
}

/// Target of a CONNECT request. Port defaults to 443.
fn parse_authority(req: &Request<Incoming>) -> Result<(String, u16)> {
    let authority = req
        .uri()
        .authority()
        .ok_or_else(|| ProxyError::InvalidRequest("CONNECT without host:port".to_string()))?;
    let host = authority
        .host()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    if host.is_empty() {
        return Err(ProxyError::InvalidRequest("CONNECT without host".to_string()));
    }
    Ok((host, authority.port_u16().unwrap_or(443)))
}

/// Proxied requests must use the absolute form `http://host/path`
fn absolute_url(req: &Request<Incoming>) -> Result<Url> {
    let uri = req.uri();
    if uri.scheme().is_none() || uri.authority().is_none() {
        return Err(ProxyError::InvalidRequest(format!(
            "expected an absolute URL, got {}",
            uri
        )));
    }
    Ok(Url::parse(&uri.to_string())?)
}
