//! Supervised pool of delivery worker tasks.
//!
//! Each task pulls from the shared in-process queue, runs one attempt, and
//! forwards retry signals to the scheduler. Cancellation is only observed
//! between attempts, so an in-flight request always runs to completion.

use std::{sync::Arc, time::Duration};

use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    engine::EngineStats,
    error::{DeliveryError, ErrorCategory, Result},
    queue::{DeliveryTask, InProcessQueue},
    scheduler::RetryScheduler,
    worker::DeliveryWorker,
};

/// Worker pool managing delivery worker tasks.
pub struct WorkerPool {
    worker_count: usize,
    queue: Arc<InProcessQueue>,
    worker: Arc<DeliveryWorker>,
    scheduler: Arc<RetryScheduler>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Creates a pool that has not spawned anything yet.
    pub fn new(
        worker_count: usize,
        queue: Arc<InProcessQueue>,
        worker: Arc<DeliveryWorker>,
        scheduler: Arc<RetryScheduler>,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            worker_count,
            queue,
            worker,
            scheduler,
            stats,
            cancellation_token,
            worker_handles: Vec::new(),
        }
    }

    /// Spawns every worker task and returns immediately.
    pub async fn spawn_workers(&mut self) {
        info!(worker_count = self.worker_count, "spawning delivery workers");

        self.stats.write().await.active_workers = self.worker_count;

        for worker_id in 0..self.worker_count {
            let queue = self.queue.clone();
            let worker = self.worker.clone();
            let scheduler = self.scheduler.clone();
            let token = self.cancellation_token.clone();

            self.worker_handles.push(tokio::spawn(async move {
                debug!(worker_id, "delivery worker starting");
                run_worker(worker_id, &queue, &worker, &scheduler, &token).await;
                debug!(worker_id, "delivery worker stopped");
            }));
        }
    }

    /// Signals every worker to stop and waits up to `timeout` for in-flight
    /// attempts to finish.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers are still busy after `timeout`,
    /// or `WorkerPanic` for the first worker that panicked.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();
        let handles = std::mem::take(&mut self.worker_handles);

        let joined = tokio::time::timeout(timeout, async {
            let mut first_panic = None;
            for (worker_id, handle) in handles.into_iter().enumerate() {
                if let Err(join_error) = handle.await {
                    error!(worker_id, error = %join_error, "worker task panicked");
                    first_panic.get_or_insert(DeliveryError::WorkerPanic {
                        worker_id,
                        message: join_error.to_string(),
                    });
                }
            }
            first_panic
        })
        .await;

        self.stats.write().await.active_workers = 0;

        match joined {
            Ok(None) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Ok(Some(panic)) => Err(panic),
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, in-flight attempts abandoned"
                );
                Err(DeliveryError::ShutdownTimeout { timeout_seconds: timeout.as_secs() })
            },
        }
    }

    /// Whether any worker task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.worker_handles.iter().filter(|h| !h.is_finished()).count();
        if active > 0 && !self.cancellation_token.is_cancelled() {
            warn!(active_workers = active, "worker pool dropped without shutdown, cancelling");
            self.cancellation_token.cancel();
        }
    }
}

async fn run_worker(
    worker_id: usize,
    queue: &InProcessQueue,
    worker: &DeliveryWorker,
    scheduler: &RetryScheduler,
    token: &CancellationToken,
) {
    loop {
        let task = tokio::select! {
            biased;
            () = token.cancelled() => break,
            task = queue.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        process_task(worker_id, task, worker, scheduler).await;
    }
}

async fn process_task(
    worker_id: usize,
    task: DeliveryTask,
    worker: &DeliveryWorker,
    scheduler: &RetryScheduler,
) {
    let wants_retry = match worker.attempt(task).await {
        Ok(outcome) => {
            debug!(
                worker_id,
                record_id = %task.record_id,
                attempt = task.attempt_number,
                outcome = %outcome,
                "attempt finished"
            );
            outcome.wants_retry()
        },
        Err(error) => {
            error!(
                worker_id,
                record_id = %task.record_id,
                attempt = task.attempt_number,
                category = %ErrorCategory::from(&error),
                error = %error,
                "attempt failed"
            );
            error.is_retryable()
        },
    };

    if wants_retry {
        if let Err(error) = scheduler.on_retry_signal(task).await {
            warn!(
                worker_id,
                record_id = %task.record_id,
                error = %error,
                "retry could not be scheduled"
            );
        }
    }
}
