//! Request fulfilment on remote functions

use std::sync::Arc;

use tracing::{debug, instrument};

use super::normalize_response;
use crate::error::Result;
use crate::models::{BodyLocation, ProxyRequest, ProxyResponse, WorkerRequest, WorkerResponse};
use crate::stats::ProxyStats;
use crate::transport::LargePayloadTransport;
use crate::workers::WorkerPool;

/// Ships each request to the worker pool and decodes the worker's reply,
/// resolving out-of-band bodies through the payload transport.
pub struct RemoteWorkerBackend {
    pool: Arc<WorkerPool>,
    transport: Arc<LargePayloadTransport>,
    stats: Arc<ProxyStats>,
}

impl RemoteWorkerBackend {
    pub fn new(
        pool: Arc<WorkerPool>,
        transport: Arc<LargePayloadTransport>,
        stats: Arc<ProxyStats>,
    ) -> Self {
        Self {
            pool,
            transport,
            stats,
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    #[instrument(skip(self, request), fields(method = %request.method(), url = %request.url()))]
    pub async fn fulfill(&self, request: ProxyRequest) -> Result<ProxyResponse> {
        let mut wire = WorkerRequest::from_request(&request);
        wire.headers
            .insert("connection".to_string(), "close".to_string());
        let payload = wire.to_bytes()?;

        self.stats.record_bytes_up(request.wire_size());
        let raw = self.pool.dispatch(payload).await?;

        let reply = WorkerResponse::from_slice(&raw)?;
        let body = match reply.body_location()? {
            BodyLocation::Inline(body) => body,
            BodyLocation::Reference(reference) => {
                debug!(kind = reference.kind(), "Resolving large payload");
                self.transport.resolve(&reference).await?
            }
        };

        let (status, headers, body) = reply.into_response(body)?.into_parts();
        let response = normalize_response(request.method(), status, headers, body);
        self.stats.record_bytes_down(response.wire_size());
        Ok(response)
    }
}
