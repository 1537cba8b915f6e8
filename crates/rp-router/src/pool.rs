//! SendWorkerPool - fixed set of workers draining the delay queue
//!
//! Each worker blocks in `MessageQueue::take` and hands ready units to the
//! router. Workers exit when the queue shuts down.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rp_common::DelayableMessage;
use rp_queue::MessageQueue;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct SendWorkerPool {
    concurrency: usize,

    /// Running state
    running: AtomicBool,

    /// Workers currently handling a unit
    active_workers: Arc<AtomicU32>,

    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl SendWorkerPool {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            running: AtomicBool::new(false),
            active_workers: Arc::new(AtomicU32::new(0)),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the workers. A second call is a no-op.
    pub fn start<H, Fut>(&self, queue: Arc<MessageQueue>, handler: H)
    where
        H: Fn(DelayableMessage) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(concurrency = self.concurrency, queue_id = %queue.queue_id(), "Starting send workers");

        let mut handles = self.handles.lock();
        for worker_id in 0..self.concurrency {
            let queue = queue.clone();
            let handler = handler.clone();
            let active_workers = self.active_workers.clone();

            handles.push(tokio::spawn(async move {
                Self::run_worker(worker_id, queue, handler, active_workers).await;
            }));
        }
    }

    async fn run_worker<H, Fut>(
        worker_id: usize,
        queue: Arc<MessageQueue>,
        handler: H,
        active_workers: Arc<AtomicU32>,
    ) where
        H: Fn(DelayableMessage) -> Fut,
        Fut: Future<Output = ()>,
    {
        debug!(worker_id, "Send worker started");

        while let Some(unit) = queue.take().await {
            active_workers.fetch_add(1, Ordering::SeqCst);
            handler(unit).await;
            active_workers.fetch_sub(1, Ordering::SeqCst);
        }

        debug!(worker_id, "Send worker exited");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> u32 {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Waits up to `timeout` for workers to exit, then aborts the rest.
    /// The queue must already be shut down.
    pub async fn shutdown(&self, timeout: Duration) {
        self.running.store(false, Ordering::SeqCst);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        let start = Instant::now();

        for mut handle in handles {
            let remaining = timeout.saturating_sub(start.elapsed());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                warn!("Send worker did not exit in time, aborting");
                handle.abort();
                // the aborted worker has released its unit once this resolves
                let _ = handle.await;
            }
        }

        info!("Send workers stopped");
    }
}
