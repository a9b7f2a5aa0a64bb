//! Concurrency ceiling shared by every kind of remote invocation

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::error::{ProxyError, Result};

#[derive(Debug, Default)]
struct SlotCounters {
    acquired: AtomicU64,
    released: AtomicU64,
    active: AtomicUsize,
    peak: AtomicUsize,
}

/// Counting semaphore of `max` worker slots
#[derive(Clone)]
pub struct Capacity {
    semaphore: Arc<Semaphore>,
    max: usize,
    counters: Arc<SlotCounters>,
}

impl Capacity {
    pub fn new(max: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
            counters: Arc::new(SlotCounters::default()),
        }
    }

    /// Wait for a free slot. Dropping the future abandons the wait without
    /// taking a slot.
    pub async fn acquire(&self) -> Result<WorkerSlot> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ProxyError::Internal("worker pool closed".to_string()))?;
        Ok(self.issue(permit))
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Option<WorkerSlot> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Some(self.issue(permit)),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => None,
        }
    }

    fn issue(&self, permit: OwnedSemaphorePermit) -> WorkerSlot {
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(active, Ordering::SeqCst);
        WorkerSlot {
            _permit: permit,
            counters: Arc::clone(&self.counters),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn active(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    pub fn acquired(&self) -> u64 {
        self.counters.acquired.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> u64 {
        self.counters.released.load(Ordering::Relaxed)
    }
}

/// One reserved unit of capacity. Released exactly once, when dropped.
pub struct WorkerSlot {
    _permit: OwnedSemaphorePermit,
    counters: Arc<SlotCounters>,
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
        self.counters.released.fetch_add(1, Ordering::Relaxed);
    }
}
