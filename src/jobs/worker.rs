//! Job worker pool
//!
//! A fixed number of worker tasks share one job queue. Each worker runs one
//! pass of one job at a time; a job that has to wait is requeued rather than
//! held, and distinct jobs run concurrently across workers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::orchestrator::JobOrchestrator;

/// Live worker counters, shared with the statistics rollup
#[derive(Debug, Default)]
pub struct WorkerCounters {
    total: AtomicUsize,
    busy: AtomicUsize,
}

impl WorkerCounters {
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::Relaxed)
    }
}

/// Handle to the running workers
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    counters: Arc<WorkerCounters>,
}

impl WorkerPool {
    pub(crate) fn start(
        orchestrator: Arc<JobOrchestrator>,
        queue: mpsc::Receiver<String>,
        worker_count: usize,
        counters: Arc<WorkerCounters>,
    ) -> Self {
        let queue = Arc::new(Mutex::new(queue));
        info!("Starting job worker pool with {} workers", worker_count);

        let handles = (0..worker_count)
            .map(|i| {
                let orchestrator = Arc::clone(&orchestrator);
                let queue = Arc::clone(&queue);
                let counters = Arc::clone(&counters);
                tokio::spawn(async move {
                    worker_task(i, orchestrator, queue, counters).await;
                })
            })
            .collect();

        Self { handles, counters }
    }

    pub fn worker_count(&self) -> usize {
        self.counters.total()
    }

    pub fn busy_count(&self) -> usize {
        self.counters.busy()
    }

    /// Abort every worker; jobs resume from their persisted cursor on restart
    pub fn shutdown(self) {
        for handle in &self.handles {
            handle.abort();
        }
        info!("Job worker pool stopped");
    }
}

async fn worker_task(
    worker_id: usize,
    orchestrator: Arc<JobOrchestrator>,
    queue: Arc<Mutex<mpsc::Receiver<String>>>,
    counters: Arc<WorkerCounters>,
) {
    counters.total.fetch_add(1, Ordering::Relaxed);
    debug!("Worker {} ready", worker_id);

    loop {
        let job_id = {
            let mut rx = queue.lock().await;
            match rx.recv().await {
                Some(id) => id,
                None => {
                    counters.total.fetch_sub(1, Ordering::Relaxed);
                    info!("Worker {} shutting down (queue closed)", worker_id);
                    return;
                }
            }
        };

        counters.busy.fetch_add(1, Ordering::Relaxed);
        debug!(worker = worker_id, job_id = %job_id, "Worker claimed job");

        // failed passes are requeued or logged by the orchestrator
        if let Err(e) = orchestrator.run_job(&job_id).await {
            warn!(worker = worker_id, job_id = %job_id, error = %e, "Job pass failed");
        }

        counters.busy.fetch_sub(1, Ordering::Relaxed);
    }
}
