//! Process-wide counters
//!
//! A `StatsRecorder` is constructed once and handed to every subsystem that
//! reports. Subsystems register a named model and keep the returned `Arc`;
//! all updates are atomic so any number of connection tasks may record at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// Name of the model the request path reports to
pub const PROXY_MODEL: &str = "proxy";
/// Name of the model remote invocations report to
pub const LAMBDA_MODEL: &str = "lambda";
/// Name of the model the object-store transport reports to
pub const S3_MODEL: &str = "s3";
/// Name of the model the queue transport reports to
pub const SQS_MODEL: &str = "sqs";

/// Registry of named stats models
pub struct StatsRecorder {
    started_at: DateTime<Utc>,
    models: RwLock<Vec<(String, StatsModel)>>,
}

#[derive(Clone)]
enum StatsModel {
    Proxy(Arc<ProxyStats>),
    Invocation(Arc<InvocationStats>),
    Transfer(Arc<TransferStats>),
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            models: RwLock::new(Vec::new()),
        }
    }

    /// Get or register a request-path model
    pub fn proxy_model(&self, name: &str) -> Arc<ProxyStats> {
        self.get_or_register(
            name,
            |m| match m {
                StatsModel::Proxy(p) => Some(Arc::clone(p)),
                _ => None,
            },
            StatsModel::Proxy,
        )
    }

    /// Get or register a remote invocation model
    pub fn invocation_model(&self, name: &str) -> Arc<InvocationStats> {
        self.get_or_register(
            name,
            |m| match m {
                StatsModel::Invocation(i) => Some(Arc::clone(i)),
                _ => None,
            },
            StatsModel::Invocation,
        )
    }

    /// Get or register a payload transfer model
    pub fn transfer_model(&self, name: &str) -> Arc<TransferStats> {
        self.get_or_register(
            name,
            |m| match m {
                StatsModel::Transfer(t) => Some(Arc::clone(t)),
                _ => None,
            },
            StatsModel::Transfer,
        )
    }

    pub fn models(&self) -> Vec<String> {
        self.models.read().iter().map(|(n, _)| n.clone()).collect()
    }

    /// Point-in-time view of every registered model, in registration order
    pub fn snapshot(&self) -> StatsSnapshot {
        let models = self
            .models
            .read()
            .iter()
            .map(|(name, model)| ModelSnapshot {
                name: name.clone(),
                values: match model {
                    StatsModel::Proxy(m) => ModelValues::Proxy {
                        requests: m.total_requests(),
                        mean_delay_ms: m.mean_delay_ms(),
                        bytes_up: m.bytes_up(),
                        bytes_down: m.bytes_down(),
                    },
                    StatsModel::Invocation(m) => ModelValues::Invocation {
                        invocations: m.invocations(),
                        faults: m.faults(),
                        billed_ms: m.billed_ms(),
                    },
                    StatsModel::Transfer(m) => ModelValues::Transfer {
                        fetches: m.fetches(),
                        bytes_down: m.bytes_down(),
                    },
                },
            })
            .collect();

        StatsSnapshot {
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            models,
        }
    }

    // Names are scoped per model kind.
    fn get_or_register<T: Default>(
        &self,
        name: &str,
        extract: impl Fn(&StatsModel) -> Option<Arc<T>>,
        wrap: impl FnOnce(Arc<T>) -> StatsModel,
    ) -> Arc<T> {
        let find = |models: &[(String, StatsModel)]| {
            models
                .iter()
                .filter(|(n, _)| n == name)
                .find_map(|(_, m)| extract(m))
        };

        if let Some(model) = find(self.models.read().as_slice()) {
            return model;
        }
        let mut models = self.models.write();
        if let Some(model) = find(models.as_slice()) {
            return model;
        }
        let model = Arc::new(T::default());
        models.push((name.to_string(), wrap(Arc::clone(&model))));
        model
    }
}

impl Default for StatsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Request count, delay and bytes moved through the proxy
#[derive(Debug, Default)]
pub struct ProxyStats {
    requests: AtomicU64,
    total_delay_us: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

impl ProxyStats {
    /// Start timing a request. The delay is recorded when the timer drops.
    pub fn record_delay(self: &Arc<Self>) -> DelayTimer {
        DelayTimer {
            model: Arc::clone(self),
            started: Instant::now(),
        }
    }

    pub fn record_bytes_up(&self, n: u64) {
        self.bytes_up.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_bytes_down(&self, n: u64) {
        self.bytes_down.fetch_add(n, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn mean_delay_ms(&self) -> f64 {
        let requests = self.total_requests();
        if requests == 0 {
            return 0.0;
        }
        self.total_delay_us.load(Ordering::Relaxed) as f64 / 1000.0 / requests as f64
    }

    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }
}

/// Scoped request timer
pub struct DelayTimer {
    model: Arc<ProxyStats>,
    started: Instant,
}

impl Drop for DelayTimer {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed().as_micros() as u64;
        self.model.total_delay_us.fetch_add(elapsed, Ordering::Relaxed);
        self.model.requests.fetch_add(1, Ordering::Relaxed);
    }
}

/// Remote invocation count and estimated billed time
#[derive(Debug, Default)]
pub struct InvocationStats {
    invocations: AtomicU64,
    faults: AtomicU64,
    billed_ms: AtomicU64,
}

impl InvocationStats {
    /// Time one invocation. Billing is rounded up to the next 100ms.
    pub fn record(self: &Arc<Self>) -> InvocationTimer {
        InvocationTimer {
            model: Arc::clone(self),
            started: Instant::now(),
        }
    }

    pub fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    pub fn billed_ms(&self) -> u64 {
        self.billed_ms.load(Ordering::Relaxed)
    }
}

pub struct InvocationTimer {
    model: Arc<InvocationStats>,
    started: Instant,
}

impl Drop for InvocationTimer {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        let billed = elapsed.div_ceil(100).max(1) * 100;
        self.model.billed_ms.fetch_add(billed, Ordering::Relaxed);
        self.model.invocations.fetch_add(1, Ordering::Relaxed);
    }
}

/// Out-of-band payload fetches
#[derive(Debug, Default)]
pub struct TransferStats {
    fetches: AtomicU64,
    bytes_down: AtomicU64,
}

impl TransferStats {
    pub fn record_fetch(&self, size: u64) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.bytes_down.fetch_add(size, Ordering::Relaxed);
    }

    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub models: Vec<ModelSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelSnapshot {
    pub name: String,
    #[serde(flatten)]
    pub values: ModelValues,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelValues {
    Proxy {
        requests: u64,
        mean_delay_ms: f64,
        bytes_up: u64,
        bytes_down: u64,
    },
    Invocation {
        invocations: u64,
        faults: u64,
        billed_ms: u64,
    },
    Transfer {
        fetches: u64,
        bytes_down: u64,
    },
}
