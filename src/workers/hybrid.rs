//! Persistent workers with short-lived overflow
//!
//! A request overflows to a short-lived invocation when no persistent worker
//! is idle, more than `threshold` requests are already queued, and the shared
//! capacity still has a free slot. Otherwise it joins the queue.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tracing::debug;

use super::long_lived::LongLivedDispatcher;
use super::short_lived::ShortLivedDispatcher;
use super::slot::Capacity;
use crate::error::Result;

pub struct HybridDispatcher {
    persistent: LongLivedDispatcher,
    overflow: ShortLivedDispatcher,
    capacity: Capacity,
    threshold: usize,
    overflowed: AtomicU64,
}

impl HybridDispatcher {
    /// Both dispatchers must share `capacity`
    pub fn new(
        persistent: LongLivedDispatcher,
        overflow: ShortLivedDispatcher,
        capacity: Capacity,
        threshold: usize,
    ) -> Self {
        Self {
            persistent,
            overflow,
            capacity,
            threshold,
            overflowed: AtomicU64::new(0),
        }
    }

    pub async fn dispatch(&self, payload: Bytes) -> Result<Bytes> {
        if self.saturated() {
            if let Some(slot) = self.capacity.try_acquire() {
                self.overflowed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    queue_depth = self.persistent.queue_depth(),
                    "Persistent workers saturated, overflowing"
                );
                return self.overflow.dispatch_with(slot, payload).await;
            }
        }
        self.persistent.dispatch(payload).await
    }

    fn saturated(&self) -> bool {
        self.persistent.idle_workers() == 0 && self.persistent.queue_depth() > self.threshold
    }

    pub fn persistent(&self) -> &LongLivedDispatcher {
        &self.persistent
    }

    pub fn overflowed(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }
}
