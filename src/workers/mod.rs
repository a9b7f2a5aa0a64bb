//! Bounded pool of remote function invocations
//!
//! This module provides the dispatch strategies used to fulfil requests on
//! remote functions without exceeding the configured concurrency ceiling.

mod hybrid;
mod invoker;
mod long_lived;
mod selection;
mod short_lived;
mod slot;

pub use hybrid::HybridDispatcher;
pub use invoker::{FunctionRef, HttpInvoker, InvokeError, RemoteInvoker, FUNCTION_ERROR_HEADER};
pub use long_lived::LongLivedDispatcher;
pub use selection::FunctionSelector;
pub use short_lived::ShortLivedDispatcher;
pub use slot::{Capacity, WorkerSlot};

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tracing::info;

use crate::config::{DispatchStrategy, WorkerConfig};
use crate::error::Result;
use crate::stats::{StatsRecorder, LAMBDA_MODEL};

enum Dispatcher {
    ShortLived(ShortLivedDispatcher),
    LongLived(LongLivedDispatcher),
    Hybrid(HybridDispatcher),
}

/// Remote invocations across the configured functions, never more than
/// `max_workers` active at once
pub struct WorkerPool {
    strategy: DispatchStrategy,
    capacity: Capacity,
    dispatcher: Dispatcher,
}

impl WorkerPool {
    /// Build the pool. Long-lived and hybrid strategies start their
    /// persistent workers here, so this must run inside a runtime.
    pub fn new(
        config: &WorkerConfig,
        invoker: Arc<dyn RemoteInvoker>,
        stats: &StatsRecorder,
    ) -> Result<Self> {
        let functions = config
            .functions
            .iter()
            .map(|f| FunctionRef::resolve(f, &config.invoke_endpoint))
            .collect::<Result<Vec<_>>>()?;
        let selector = Arc::new(FunctionSelector::new(functions)?);
        let capacity = Capacity::new(config.max_workers);
        let invocations = stats.invocation_model(LAMBDA_MODEL);

        let dispatcher = match config.strategy {
            DispatchStrategy::ShortLived => Dispatcher::ShortLived(ShortLivedDispatcher::new(
                selector,
                invoker,
                capacity.clone(),
                config.invoke_timeout(),
                invocations,
            )),
            DispatchStrategy::LongLived => Dispatcher::LongLived(LongLivedDispatcher::new(
                config.max_workers,
                &selector,
                invoker,
                capacity.clone(),
                config.invoke_timeout(),
                config.queue_timeout(),
                invocations,
            )),
            DispatchStrategy::Hybrid => {
                let persistent = LongLivedDispatcher::new(
                    config.persistent_workers.min(config.max_workers),
                    &selector,
                    Arc::clone(&invoker),
                    capacity.clone(),
                    config.invoke_timeout(),
                    config.queue_timeout(),
                    Arc::clone(&invocations),
                );
                let overflow = ShortLivedDispatcher::new(
                    selector,
                    invoker,
                    capacity.clone(),
                    config.invoke_timeout(),
                    invocations,
                );
                Dispatcher::Hybrid(HybridDispatcher::new(
                    persistent,
                    overflow,
                    capacity.clone(),
                    config.overflow_threshold,
                ))
            }
        };

        info!(
            strategy = config.strategy.as_str(),
            functions = config.functions.len(),
            max_workers = config.max_workers,
            "Worker pool ready"
        );

        Ok(Self {
            strategy: config.strategy,
            capacity,
            dispatcher,
        })
    }

    /// Run one serialized request on a remote function and return its raw result
    pub async fn dispatch(&self, payload: Bytes) -> Result<Bytes> {
        match &self.dispatcher {
            Dispatcher::ShortLived(d) => d.dispatch(payload).await,
            Dispatcher::LongLived(d) => d.dispatch(payload).await,
            Dispatcher::Hybrid(d) => d.dispatch(payload).await,
        }
    }

    pub fn strategy(&self) -> DispatchStrategy {
        self.strategy
    }

    pub fn metrics(&self) -> PoolMetrics {
        let persistent = match &self.dispatcher {
            Dispatcher::ShortLived(_) => None,
            Dispatcher::LongLived(d) => Some(d),
            Dispatcher::Hybrid(d) => Some(d.persistent()),
        };

        PoolMetrics {
            strategy: self.strategy.as_str(),
            max_workers: self.capacity.max(),
            active: self.capacity.active(),
            peak: self.capacity.peak(),
            acquired: self.capacity.acquired(),
            released: self.capacity.released(),
            persistent_workers: persistent.map_or(0, |d| d.worker_count()),
            idle_workers: persistent.map_or(0, |d| d.idle_workers()),
            queue_depth: persistent.map_or(0, |d| d.queue_depth()),
            restarted: persistent.map_or(0, |d| d.restarted()),
            overflowed: match &self.dispatcher {
                Dispatcher::Hybrid(d) => d.overflowed(),
                _ => 0,
            },
        }
    }
}

/// Point-in-time view of pool occupancy
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub strategy: &'static str,
    pub max_workers: usize,
    pub active: usize,
    pub peak: usize,
    pub acquired: u64,
    pub released: u64,
    pub persistent_workers: usize,
    pub idle_workers: usize,
    pub queue_depth: usize,
    pub restarted: u64,
    pub overflowed: u64,
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::{FunctionRef, InvokeError, RemoteInvoker};

    type Respond = Box<dyn Fn(&Bytes) -> Result<Bytes, InvokeError> + Send + Sync>;

    /// Invoker double that records calls and peak concurrency.
    ///
    /// A payload of `panic` makes the invocation panic.
    pub(crate) struct ScriptedInvoker {
        delay: Duration,
        respond: Respond,
        calls: Mutex<Vec<String>>,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedInvoker {
        pub(crate) fn echo() -> Self {
            Self::with(|payload| Ok(payload.clone()))
        }

        pub(crate) fn with(
            respond: impl Fn(&Bytes) -> Result<Bytes, InvokeError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                delay: Duration::ZERO,
                respond: Box::new(respond),
                calls: Mutex::new(Vec::new()),
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        pub(crate) fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        pub(crate) fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    struct InFlight<'a>(&'a AtomicUsize);

    impl Drop for InFlight<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RemoteInvoker for ScriptedInvoker {
        async fn invoke(
            &self,
            function: &FunctionRef,
            payload: Bytes,
        ) -> Result<Bytes, InvokeError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            let _in_flight = InFlight(&self.current);
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.lock().push(function.name().to_string());

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if payload.as_ref() == b"panic" {
                panic!("scripted worker crash");
            }
            (self.respond)(&payload)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedInvoker;
    use super::*;
    use crate::error::ProxyError;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};
    use url::Url;

    fn worker_config(strategy: DispatchStrategy, functions: &[&str], max: usize) -> WorkerConfig {
        WorkerConfig {
            functions: functions.iter().map(|f| f.to_string()).collect(),
            invoke_endpoint: Url::parse("http://127.0.0.1:9001").unwrap(),
            strategy,
            max_workers: max,
            persistent_workers: 1,
            overflow_threshold: 0,
            invoke_timeout: 1,
            queue_timeout: 5,
        }
    }

    fn pool(config: &WorkerConfig, invoker: &Arc<ScriptedInvoker>) -> Arc<WorkerPool> {
        let invoker: Arc<dyn RemoteInvoker> = invoker.clone();
        Arc::new(WorkerPool::new(config, invoker, &StatsRecorder::new()).unwrap())
    }

    async fn burst(pool: &Arc<WorkerPool>, payloads: Vec<&'static str>) -> Vec<Result<Bytes>> {
        let handles: Vec<_> = payloads
            .into_iter()
            .map(|p| {
                let pool = Arc::clone(pool);
                tokio::spawn(async move { pool.dispatch(Bytes::from_static(p.as_bytes())).await })
            })
            .collect();
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    }

    #[tokio::test]
    async fn test_round_robin_assignment() {
        let invoker = Arc::new(ScriptedInvoker::echo());
        let config = worker_config(DispatchStrategy::ShortLived, &["a", "b", "c"], 2);
        let pool = pool(&config, &invoker);

        for _ in 0..9 {
            assert_ok!(pool.dispatch(Bytes::from_static(b"{}")).await);
        }

        assert_eq!(
            invoker.calls(),
            vec!["a", "b", "c", "a", "b", "c", "a", "b", "c"]
        );
    }

    #[tokio::test]
    async fn test_short_lived_never_exceeds_ceiling() {
        let invoker = Arc::new(ScriptedInvoker::echo().delayed(Duration::from_millis(30)));
        let config = worker_config(DispatchStrategy::ShortLived, &["a", "b"], 3);
        let pool = pool(&config, &invoker);

        let results = burst(&pool, vec!["{}"; 20]).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(invoker.peak() <= 3);
        assert_eq!(pool.metrics().peak, 3);
    }

    #[tokio::test]
    async fn test_slots_balance_after_mixed_outcomes() {
        let invoker = Arc::new(
            ScriptedInvoker::with(|payload| match payload.as_ref() {
                b"fail" => Err(InvokeError::Fault("Unhandled".to_string())),
                _ => Ok(payload.clone()),
            })
            .delayed(Duration::from_millis(10)),
        );
        let config = worker_config(DispatchStrategy::ShortLived, &["a"], 2);
        let pool = pool(&config, &invoker);

        let results = burst(&pool, vec!["ok", "fail", "ok", "fail", "ok"]).await;
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 2);
        assert!(matches!(results[1], Err(ProxyError::Upstream(_))));

        let metrics = pool.metrics();
        assert_eq!(metrics.acquired, 5);
        assert_eq!(metrics.acquired, metrics.released);
        assert_eq!(metrics.active, 0);
    }

    #[tokio::test]
    async fn test_invocation_timeout_releases_slot() {
        let invoker = Arc::new(ScriptedInvoker::echo().delayed(Duration::from_secs(3)));
        let config = worker_config(DispatchStrategy::ShortLived, &["slow"], 1);
        let pool = pool(&config, &invoker);

        let err = assert_err!(pool.dispatch(Bytes::from_static(b"{}")).await);
        assert!(err.is_timeout());
        assert_eq!(pool.metrics().released, 1);
    }

    #[tokio::test]
    async fn test_abandoned_request_still_releases_slot() {
        let invoker = Arc::new(ScriptedInvoker::echo().delayed(Duration::from_millis(100)));
        let config = worker_config(DispatchStrategy::ShortLived, &["a"], 1);
        let pool = pool(&config, &invoker);

        // Caller gives up while the invocation is in flight
        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), pool.dispatch(Bytes::new())).await;
        assert!(abandoned.is_err());
        assert_eq!(pool.metrics().active, 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let metrics = pool.metrics();
        assert_eq!(metrics.active, 0);
        assert_eq!(metrics.acquired, metrics.released);
    }

    #[tokio::test]
    async fn test_long_lived_bounds_workers() {
        let invoker = Arc::new(ScriptedInvoker::echo().delayed(Duration::from_millis(20)));
        let config = worker_config(DispatchStrategy::LongLived, &["a", "b"], 3);
        let pool = pool(&config, &invoker);

        let results = burst(&pool, vec!["{}"; 12]).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(invoker.peak() <= 3);

        let metrics = pool.metrics();
        assert_eq!(metrics.persistent_workers, 3);
        assert_eq!(metrics.acquired, 12);
        assert_eq!(metrics.queue_depth, 0);
    }

    #[tokio::test]
    async fn test_long_lived_replaces_crashed_worker() {
        let invoker = Arc::new(ScriptedInvoker::echo());
        let config = worker_config(DispatchStrategy::LongLived, &["a"], 1);
        let pool = pool(&config, &invoker);

        let err = assert_err!(pool.dispatch(Bytes::from_static(b"panic")).await);
        assert!(matches!(err, ProxyError::Upstream(_)));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The next submission replaces the dead worker and succeeds
        let body = assert_ok!(pool.dispatch(Bytes::from_static(b"after")).await);
        assert_eq!(body.as_ref(), b"after");

        let metrics = pool.metrics();
        assert_eq!(metrics.restarted, 1);
        assert_eq!(metrics.acquired, metrics.released);
    }

    #[tokio::test]
    async fn test_hybrid_overflows_within_shared_ceiling() {
        let invoker = Arc::new(ScriptedInvoker::echo().delayed(Duration::from_millis(200)));
        let config = worker_config(DispatchStrategy::Hybrid, &["a"], 3);
        let pool = pool(&config, &invoker);

        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                pool.dispatch(Bytes::from_static(b"{}")).await
            }));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        for handle in handles {
            assert_ok!(handle.await.unwrap());
        }

        let metrics = pool.metrics();
        assert_eq!(metrics.persistent_workers, 1);
        assert!(metrics.overflowed >= 1);
        assert!(invoker.peak() <= 3);
        assert!(metrics.peak <= 3);
        assert_eq!(metrics.acquired, 6);
        assert_eq!(metrics.acquired, metrics.released);
    }

    #[tokio::test]
    async fn test_pool_rejects_empty_function_list() {
        let config = worker_config(DispatchStrategy::ShortLived, &[], 1);
        let invoker: Arc<dyn RemoteInvoker> = Arc::new(ScriptedInvoker::echo());
        assert!(WorkerPool::new(&config, invoker, &StatsRecorder::new()).is_err());
    }
}
