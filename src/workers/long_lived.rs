//! Persistent workers draining a shared work queue
//!
//! Each worker is bound to one function and handles one queued request at a
//! time. Requests wait on their own reply channel. The queue itself is
//! unbounded; a request gives up after the queue timeout.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::short_lived::invoke_once;
use super::slot::Capacity;
use super::{FunctionRef, FunctionSelector, RemoteInvoker};
use crate::error::{ProxyError, Result};
use crate::stats::InvocationStats;

struct Job {
    payload: Bytes,
    reply: oneshot::Sender<Result<Bytes>>,
}

struct Shared {
    invoker: Arc<dyn RemoteInvoker>,
    capacity: Capacity,
    invoke_timeout: Duration,
    stats: Arc<InvocationStats>,
    queue: AsyncMutex<mpsc::UnboundedReceiver<Job>>,
    idle: AtomicUsize,
    depth: AtomicUsize,
}

struct WorkerHandle {
    id: usize,
    function: Arc<FunctionRef>,
    task: JoinHandle<()>,
}

pub struct LongLivedDispatcher {
    shared: Arc<Shared>,
    sender: mpsc::UnboundedSender<Job>,
    workers: Mutex<Vec<WorkerHandle>>,
    queue_timeout: Duration,
    restarted: AtomicU64,
}

impl LongLivedDispatcher {
    /// Start `count` persistent workers. Must be called inside a runtime.
    pub fn new(
        count: usize,
        selector: &FunctionSelector,
        invoker: Arc<dyn RemoteInvoker>,
        capacity: Capacity,
        invoke_timeout: Duration,
        queue_timeout: Duration,
        stats: Arc<InvocationStats>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            invoker,
            capacity,
            invoke_timeout,
            stats,
            queue: AsyncMutex::new(receiver),
            idle: AtomicUsize::new(0),
            depth: AtomicUsize::new(0),
        });

        let workers = (0..count)
            .map(|id| {
                let function = selector.function_at(id);
                let task = spawn_worker(Arc::clone(&shared), id, Arc::clone(&function));
                WorkerHandle { id, function, task }
            })
            .collect();

        Self {
            shared,
            sender,
            workers: Mutex::new(workers),
            queue_timeout,
            restarted: AtomicU64::new(0),
        }
    }

    /// Queue a request and wait for the worker that picks it up
    pub async fn dispatch(&self, payload: Bytes) -> Result<Bytes> {
        self.ensure_workers();

        let (reply, result) = oneshot::channel();
        self.shared.depth.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(Job { payload, reply }).is_err() {
            self.shared.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(ProxyError::Internal("work queue closed".to_string()));
        }

        match timeout(self.queue_timeout, result).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProxyError::Upstream("persistent worker lost".to_string())),
            Err(_) => Err(ProxyError::Timeout("queued request")),
        }
    }

    /// Replace workers whose task has ended
    fn ensure_workers(&self) {
        let mut workers = self.workers.lock();
        for worker in workers.iter_mut().filter(|w| w.task.is_finished()) {
            warn!(
                worker = worker.id,
                function = %worker.function,
                "Persistent worker ended unexpectedly, replacing"
            );
            worker.task = spawn_worker(
                Arc::clone(&self.shared),
                worker.id,
                Arc::clone(&worker.function),
            );
            self.restarted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn idle_workers(&self) -> usize {
        self.shared.idle.load(Ordering::SeqCst)
    }

    /// Requests queued but not yet picked up by a worker
    pub fn queue_depth(&self) -> usize {
        self.shared.depth.load(Ordering::SeqCst)
    }

    pub fn restarted(&self) -> u64 {
        self.restarted.load(Ordering::Relaxed)
    }
}

impl Drop for LongLivedDispatcher {
    fn drop(&mut self) {
        for worker in self.workers.lock().iter() {
            worker.task.abort();
        }
    }
}

fn spawn_worker(shared: Arc<Shared>, id: usize, function: Arc<FunctionRef>) -> JoinHandle<()> {
    tokio::spawn(run_worker(shared, id, function))
}

async fn run_worker(shared: Arc<Shared>, id: usize, function: Arc<FunctionRef>) {
    let started = Instant::now();
    let mut proxied: u64 = 0;
    info!(worker = id, function = %function, "Persistent worker started");

    loop {
        let job = {
            let _idle = IdleGuard::enter(&shared.idle);
            let mut queue = shared.queue.lock().await;
            queue.recv().await
        };
        let Some(job) = job else {
            break;
        };
        shared.depth.fetch_sub(1, Ordering::SeqCst);

        if job.reply.is_closed() {
            debug!(worker = id, "Skipping abandoned request");
            continue;
        }

        let slot = match shared.capacity.acquire().await {
            Ok(slot) => slot,
            Err(e) => {
                let _ = job.reply.send(Err(e));
                break;
            }
        };
        let result = invoke_once(
            shared.invoker.as_ref(),
            &function,
            job.payload,
            shared.invoke_timeout,
            &shared.stats,
        )
        .await;
        drop(slot);

        proxied += 1;
        let _ = job.reply.send(result);
    }

    info!(
        worker = id,
        function = %function,
        lifetime_secs = started.elapsed().as_secs(),
        requests_proxied = proxied,
        "Persistent worker exited"
    );
}

/// Counts a worker as idle while it waits for work
struct IdleGuard<'a> {
    idle: &'a AtomicUsize,
}

impl<'a> IdleGuard<'a> {
    fn enter(idle: &'a AtomicUsize) -> Self {
        idle.fetch_add(1, Ordering::SeqCst);
        Self { idle }
    }
}

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        self.idle.fetch_sub(1, Ordering::SeqCst);
    }
}
