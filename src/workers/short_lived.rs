//! One remote invocation per request

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::slot::{Capacity, WorkerSlot};
use super::{FunctionRef, FunctionSelector, RemoteInvoker};
use crate::error::{ProxyError, Result};
use crate::stats::InvocationStats;

pub struct ShortLivedDispatcher {
    selector: Arc<FunctionSelector>,
    invoker: Arc<dyn RemoteInvoker>,
    capacity: Capacity,
    invoke_timeout: Duration,
    stats: Arc<InvocationStats>,
}

impl ShortLivedDispatcher {
    pub fn new(
        selector: Arc<FunctionSelector>,
        invoker: Arc<dyn RemoteInvoker>,
        capacity: Capacity,
        invoke_timeout: Duration,
        stats: Arc<InvocationStats>,
    ) -> Self {
        Self {
            selector,
            invoker,
            capacity,
            invoke_timeout,
            stats,
        }
    }

    /// Wait for a slot, then invoke the next function in rotation
    pub async fn dispatch(&self, payload: Bytes) -> Result<Bytes> {
        let slot = self.capacity.acquire().await?;
        self.dispatch_with(slot, payload).await
    }

    /// Invoke with a slot the caller already holds.
    ///
    /// The invocation runs on its own task which owns the slot, so a caller
    /// that goes away leaves the slot to be released when the call finishes
    /// or times out.
    pub async fn dispatch_with(&self, slot: WorkerSlot, payload: Bytes) -> Result<Bytes> {
        let function = self.selector.select();
        debug!(function = %function, "Dispatching short-lived invocation");

        let invoker = Arc::clone(&self.invoker);
        let stats = Arc::clone(&self.stats);
        let limit = self.invoke_timeout;
        let task = tokio::spawn(async move {
            let _slot = slot;
            invoke_once(invoker.as_ref(), &function, payload, limit, &stats).await
        });

        task.await
            .map_err(|e| ProxyError::Upstream(format!("remote invocation aborted: {}", e)))?
    }
}

/// Run one bounded invocation and record it
pub(super) async fn invoke_once(
    invoker: &dyn RemoteInvoker,
    function: &FunctionRef,
    payload: Bytes,
    limit: Duration,
    stats: &Arc<InvocationStats>,
) -> Result<Bytes> {
    let _timer = stats.record();
    match timeout(limit, invoker.invoke(function, payload)).await {
        Ok(Ok(body)) => Ok(body),
        Ok(Err(e)) => {
            stats.record_fault();
            warn!(function = %function, error = %e, "Remote invocation failed");
            Err(e.into())
        }
        Err(_) => {
            stats.record_fault();
            warn!(function = %function, timeout_secs = limit.as_secs(), "Remote invocation timed out");
            Err(ProxyError::Timeout("remote invocation"))
        }
    }
}
