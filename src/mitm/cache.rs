//! Per-host TLS server configurations
//!
//! At most one generation runs per host; concurrent requests for the same
//! uncached host wait for that result. A failed generation leaves the entry
//! empty so the next request tries again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tokio_rustls::rustls::ServerConfig;
use tracing::{debug, info};

use super::CertificateAuthority;
use crate::error::{ProxyError, Result};

pub struct CertCache {
    ca: Arc<CertificateAuthority>,
    entries: DashMap<String, Arc<OnceCell<Arc<ServerConfig>>>>,
    generated: AtomicU64,
}

impl CertCache {
    pub fn new(ca: Arc<CertificateAuthority>) -> Self {
        Self {
            ca,
            entries: DashMap::new(),
            generated: AtomicU64::new(0),
        }
    }

    pub async fn get(&self, host: &str) -> Result<Arc<ServerConfig>> {
        let host = host.to_ascii_lowercase();
        let cell = Arc::clone(self.entries.entry(host.clone()).or_default().value());

        cell.get_or_try_init(|| self.generate(host))
            .await
            .map(Arc::clone)
    }

    async fn generate(&self, host: String) -> Result<Arc<ServerConfig>> {
        let ca = Arc::clone(&self.ca);
        let config = tokio::task::spawn_blocking(move || {
            debug!(host = %host, "Issuing certificate");
            ca.server_config(&host).map(|config| (host, config))
        })
        .await
        .map_err(|e| ProxyError::Tls(format!("certificate generation aborted: {}", e)))?;

        let (host, config) = config?;
        let total = self.generated.fetch_add(1, Ordering::Relaxed) + 1;
        info!(host = %host, total_issued = total, "Issued certificate");
        Ok(config)
    }

    /// Number of certificates generated so far
    pub fn generated(&self) -> u64 {
        self.generated.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
