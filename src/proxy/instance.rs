//! Composition of one request backend and one stream backend

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

use super::forward::Forwarder;
use super::headers::HeaderPolicy;
use crate::backend::{
    LocalRequestBackend, LocalStreamBackend, RemoteWorkerBackend, RequestBackend, StreamBackend,
    TunnelTarget,
};
use crate::config::Config;
use crate::error::Result;
use crate::mitm::{CertCache, CertificateAuthority, InterceptingStreamBackend};
use crate::stats::{StatsRecorder, PROXY_MODEL};
use crate::transport::LargePayloadTransport;
use crate::workers::{HttpInvoker, PoolMetrics, RemoteInvoker, WorkerPool};

/// The single object the proxy handler talks to
pub struct ProxyInstance {
    forwarder: Arc<Forwarder>,
    streams: StreamBackend,
}

impl ProxyInstance {
    pub fn new(forwarder: Arc<Forwarder>, streams: StreamBackend) -> Self {
        Self { forwarder, streams }
    }

    /// Build the backends selected by `config`
    pub fn from_config(config: &Config, stats: &StatsRecorder) -> Result<Self> {
        let proxy_stats = stats.proxy_model(PROXY_MODEL);

        let backend = if config.proxy.run_local {
            RequestBackend::Local(LocalRequestBackend::new(
                config.workers.invoke_timeout(),
                Arc::clone(&proxy_stats),
            )?)
        } else {
            let invoker: Arc<dyn RemoteInvoker> = Arc::new(HttpInvoker::new()?);
            let pool = Arc::new(WorkerPool::new(&config.workers, invoker, stats)?);
            let transport = Arc::new(LargePayloadTransport::from_config(&config.payload, stats)?);
            RequestBackend::Remote(RemoteWorkerBackend::new(
                pool,
                transport,
                Arc::clone(&proxy_stats),
            ))
        };

        let forwarder = Arc::new(Forwarder::new(
            Arc::new(backend),
            HeaderPolicy::new(config.proxy.override_user_agent),
            Arc::clone(&proxy_stats),
            config.proxy.verbose,
        ));

        let streams = if config.mitm.enabled {
            let ca = CertificateAuthority::load(&config.mitm.ca_cert_path, &config.mitm.ca_key_path)?;
            StreamBackend::Intercepting(InterceptingStreamBackend::new(
                CertCache::new(Arc::new(ca)),
                Arc::clone(&forwarder),
                Duration::from_secs(config.mitm.handshake_timeout.max(1)),
            ))
        } else {
            StreamBackend::Local(LocalStreamBackend::new(
                Duration::from_secs(config.proxy.connect_timeout.max(1)),
                Duration::from_secs(config.proxy.tunnel_idle_timeout.max(1)),
                proxy_stats,
            ))
        };

        info!(
            request_backend = forwarder.backend().name(),
            stream_backend = streams.name(),
            "Proxy instance ready"
        );
        Ok(Self { forwarder, streams })
    }

    pub fn forwarder(&self) -> &Arc<Forwarder> {
        &self.forwarder
    }

    /// Prepare a tunnel to `host:port`
    pub async fn connect(&self, host: &str, port: u16) -> Result<TunnelTarget> {
        self.streams.connect(host, port).await
    }

    /// Serve an established tunnel until either side closes
    pub async fn stream<C>(&self, client: C, target: TunnelTarget) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.streams.stream(client, target).await
    }

    pub fn request_backend_name(&self) -> &'static str {
        self.forwarder.backend().name()
    }

    pub fn stream_backend_name(&self) -> &'static str {
        self.streams.name()
    }

    /// Worker pool metrics when requests go to remote functions
    pub fn pool_metrics(&self) -> Option<PoolMetrics> {
        match self.forwarder.backend().as_ref() {
            RequestBackend::Remote(backend) => Some(backend.pool().metrics()),
            RequestBackend::Local(_) => None,
        }
    }
}
