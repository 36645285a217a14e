//! Delivery task queue.
//!
//! A task names a delivery record and the attempt number to run. The
//! in-process queue is a bounded tokio channel; delayed tasks wait on the
//! [`Clock`] in a spawned task and are dropped if the queue is closed before
//! they fire. Records keep their last response either way, and records never
//! attempted are picked up again by startup recovery.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use hookrelay_core::{Clock, DeliveryRecordId};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{DeliveryError, Result};

/// One unit of work for a delivery worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryTask {
    /// Record to deliver.
    pub record_id: DeliveryRecordId,
    /// 1-based attempt number.
    pub attempt_number: u32,
}

impl DeliveryTask {
    /// First attempt for a record.
    pub fn first(record_id: DeliveryRecordId) -> Self {
        Self { record_id, attempt_number: 1 }
    }

    /// The task for the following attempt.
    pub fn next(&self) -> Self {
        Self { record_id: self.record_id, attempt_number: self.attempt_number.saturating_add(1) }
    }
}

/// Boxed future returned by queue operations.
pub type QueueFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Destination for delivery tasks.
pub trait TaskQueue: Send + Sync + 'static {
    /// Makes `task` available to workers after `delay`.
    fn enqueue(&self, task: DeliveryTask, delay: Duration) -> QueueFuture<'_>;
}

/// Bounded in-process queue shared by the dispatcher, scheduler and
/// workers.
#[derive(Debug)]
pub struct InProcessQueue {
    sender: mpsc::Sender<DeliveryTask>,
    receiver: Mutex<mpsc::Receiver<DeliveryTask>>,
    clock: Arc<dyn Clock>,
    closed: CancellationToken,
    delayed: Arc<AtomicUsize>,
}

impl InProcessQueue {
    /// Creates a queue holding at most `capacity` ready tasks.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if `capacity` is zero.
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Result<Self> {
        if capacity == 0 {
            return Err(DeliveryError::configuration("queue capacity must be positive"));
        }

        let (sender, receiver) = mpsc::channel(capacity);
        Ok(Self {
            sender,
            receiver: Mutex::new(receiver),
            clock,
            closed: CancellationToken::new(),
            delayed: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Waits for the next ready task. `None` once the queue is closed.
    pub async fn recv(&self) -> Option<DeliveryTask> {
        let mut receiver = self.receiver.lock().await;
        tokio::select! {
            biased;
            () = self.closed.cancelled() => None,
            task = receiver.recv() => task,
        }
    }

    /// Stops accepting tasks and drops pending delayed ones.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Number of delayed tasks still waiting to become ready.
    pub fn pending_delayed(&self) -> usize {
        self.delayed.load(Ordering::Acquire)
    }

    fn spawn_delayed(&self, task: DeliveryTask, delay: Duration) {
        let sender = self.sender.clone();
        let clock = self.clock.clone();
        let closed = self.closed.clone();
        let delayed = self.delayed.clone();

        delayed.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            tokio::select! {
                () = closed.cancelled() => {
                    debug!(
                        record_id = %task.record_id,
                        attempt = task.attempt_number,
                        "dropping delayed task on close"
                    );
                },
                () = clock.sleep(delay) => {
                    if sender.send(task).await.is_err() {
                        warn!(
                            record_id = %task.record_id,
                            "queue receiver gone, delayed task lost"
                        );
                    }
                },
            }
            delayed.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

impl TaskQueue for InProcessQueue {
    fn enqueue(&self, task: DeliveryTask, delay: Duration) -> QueueFuture<'_> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(DeliveryError::queue("queue is closed"));
            }

            if delay.is_zero() {
                self.sender.send(task).await.map_err(|e| DeliveryError::queue(e.to_string()))
            } else {
                self.spawn_delayed(task, delay);
                Ok(())
            }
        })
    }
}

/// Test doubles for the task queue.
pub mod mock {
    use std::sync::Mutex as StdMutex;

    use super::*;

    /// Records every enqueue without running anything.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingQueue {
        enqueued: Arc<StdMutex<Vec<(DeliveryTask, Duration)>>>,
    }

    impl RecordingQueue {
        /// Creates an empty recording queue.
        pub fn new() -> Self {
            Self::default()
        }

        /// Every `(task, delay)` pair in enqueue order.
        pub fn enqueued(&self) -> Vec<(DeliveryTask, Duration)> {
            self.enqueued.lock().map(|tasks| tasks.clone()).unwrap_or_default()
        }

        /// Number of enqueued tasks.
        pub fn len(&self) -> usize {
            self.enqueued.lock().map(|tasks| tasks.len()).unwrap_or(0)
        }

        /// Whether nothing was enqueued.
        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    impl TaskQueue for RecordingQueue {
        fn enqueue(&self, task: DeliveryTask, delay: Duration) -> QueueFuture<'_> {
            Box::pin(async move {
                self.enqueued
                    .lock()
                    .map_err(|e| DeliveryError::queue(e.to_string()))?
                    .push((task, delay));
                Ok(())
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use hookrelay_core::TestClock;

    use super::*;

    fn queue(clock: TestClock) -> InProcessQueue {
        InProcessQueue::new(8, Arc::new(clock)).unwrap()
    }

    #[tokio::test]
    async fn immediate_tasks_are_received_in_order() {
        let queue = queue(TestClock::new());
        let first = DeliveryTask::first(DeliveryRecordId::new());
        let second = DeliveryTask::first(DeliveryRecordId::new());

        queue.enqueue(first, Duration::ZERO).await.unwrap();
        queue.enqueue(second, Duration::ZERO).await.unwrap();

        assert_eq!(queue.recv().await, Some(first));
        assert_eq!(queue.recv().await, Some(second));
    }

    #[tokio::test]
    async fn delayed_task_waits_on_clock() {
        let clock = TestClock::new();
        let queue = queue(clock.clone());
        let task = DeliveryTask::first(DeliveryRecordId::new()).next();

        queue.enqueue(task, Duration::from_secs(31)).await.unwrap();

        assert_eq!(queue.recv().await, Some(task));
        assert_eq!(clock.recorded_sleeps(), vec![Duration::from_secs(31)]);
    }

    #[tokio::test]
    async fn closed_queue_rejects_and_stops_receiving() {
        let queue = queue(TestClock::new());
        queue.close();

        let task = DeliveryTask::first(DeliveryRecordId::new());
        assert!(queue.enqueue(task, Duration::ZERO).await.is_err());
        assert_eq!(queue.recv().await, None);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(InProcessQueue::new(0, Arc::new(TestClock::new())).is_err());
    }

    #[test]
    fn next_task_increments_attempt() {
        let task = DeliveryTask::first(DeliveryRecordId::new());
        assert_eq!(task.attempt_number, 1);
        assert_eq!(task.next().attempt_number, 2);
        assert_eq!(task.next().record_id, task.record_id);
    }

    #[tokio::test]
    async fn recording_queue_keeps_delays() {
        let queue = mock::RecordingQueue::new();
        let task = DeliveryTask::first(DeliveryRecordId::new());

        queue.enqueue(task, Duration::from_secs(45)).await.unwrap();

        assert_eq!(queue.enqueued(), vec![(task, Duration::from_secs(45))]);
    }
}
