//! Delivery engine wiring.
//!
//! Owns the in-process queue, the dispatcher, the worker and scheduler, and
//! the worker pool, and exposes the entry points producers and the binary
//! use: endpoint registration, `dispatch`, `start`, startup recovery and
//! `shutdown`.

use std::{sync::Arc, time::Duration};

use hookrelay_core::{
    Clock, DeliveryRecordId, Endpoint, EndpointId, EndpointUpdate, EventHandler, NewEndpoint,
    TracingEventHandler,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    classify::{Classifier, TunnelRecognizer},
    client::{ClientConfig, DeliveryClient},
    dispatcher::Dispatcher,
    error::{DeliveryError, Result},
    queue::{DeliveryTask, InProcessQueue, TaskQueue},
    retry::RetryPolicy,
    scheduler::RetryScheduler,
    storage::DeliveryStorage,
    worker::{AttemptOutcome, DeliveryWorker},
    worker_pool::WorkerPool,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// Ready tasks the queue holds before producers wait.
    pub queue_capacity: usize,

    /// How long shutdown waits for in-flight attempts.
    pub shutdown_timeout: Duration,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Retry policy applied to every record.
    pub retry_policy: RetryPolicy,

    /// Host suffixes treated as development tunnels.
    pub tunnel_host_suffixes: Vec<String>,

    /// Maximum records re-enqueued by one recovery pass.
    pub recovery_batch_size: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            queue_capacity: crate::DEFAULT_QUEUE_CAPACITY,
            shutdown_timeout: Duration::from_secs(30),
            client_config: ClientConfig::default(),
            retry_policy: RetryPolicy::default(),
            tunnel_host_suffixes: crate::DEFAULT_TUNNEL_HOST_SUFFIXES
                .iter()
                .map(ToString::to_string)
                .collect(),
            recovery_batch_size: 1_000,
        }
    }
}

impl DeliveryConfig {
    /// Rejects configurations the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(DeliveryError::configuration("worker_count must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(DeliveryError::configuration("queue_capacity must be at least 1"));
        }
        if self.client_config.timeout.is_zero() {
            return Err(DeliveryError::configuration("delivery timeout must be positive"));
        }
        self.retry_policy.validate()
    }
}

/// Counters describing engine activity since creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Running worker tasks.
    pub active_workers: usize,
    /// Attempts that reached the HTTP call.
    pub attempts_started: u64,
    /// Attempts currently waiting on HTTP or storage.
    pub in_flight_attempts: u64,
    /// 2xx responses.
    pub delivered: u64,
    /// Follow-up attempts enqueued by the scheduler.
    pub retries_scheduled: u64,
    /// Records whose retry budget ran out.
    pub gave_up: u64,
    /// Terminal failures that left the endpoint untouched.
    pub abandoned: u64,
    /// Endpoints disabled by the worker.
    pub endpoints_disabled: u64,
    /// Endpoints deleted by the worker.
    pub endpoints_deleted: u64,
    /// Attempts that ended before sending.
    pub skipped: u64,
}

impl EngineStats {
    pub(crate) fn record_outcome(&mut self, outcome: AttemptOutcome) {
        match outcome {
            AttemptOutcome::Skipped(_) => self.skipped += 1,
            AttemptOutcome::Delivered => self.delivered += 1,
            AttemptOutcome::EndpointDeleted => self.endpoints_deleted += 1,
            AttemptOutcome::EndpointDisabled => self.endpoints_disabled += 1,
            AttemptOutcome::Abandoned => self.abandoned += 1,
            AttemptOutcome::RetryRequested => {},
        }
    }
}

/// Main delivery engine.
pub struct DeliveryEngine {
    storage: Arc<dyn DeliveryStorage>,
    config: DeliveryConfig,
    queue: Arc<InProcessQueue>,
    dispatcher: Dispatcher,
    worker: Arc<DeliveryWorker>,
    scheduler: Arc<RetryScheduler>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
    clock: Arc<dyn Clock>,
}

impl DeliveryEngine {
    /// Creates an engine that logs delivery events through tracing.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the configuration is invalid
    /// or the HTTP client cannot be built.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::with_event_handler(storage, config, clock, Arc::new(TracingEventHandler))
    }

    /// Creates an engine publishing delivery events to `event_handler`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the configuration is invalid
    /// or the HTTP client cannot be built.
    pub fn with_event_handler(
        storage: Arc<dyn DeliveryStorage>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
        event_handler: Arc<dyn EventHandler>,
    ) -> Result<Self> {
        config.validate()?;

        let client = DeliveryClient::new(config.client_config.clone())?.with_clock(clock.clone());
        let stats = Arc::new(RwLock::new(EngineStats::default()));
        let queue = Arc::new(InProcessQueue::new(config.queue_capacity, clock.clone())?);
        let task_queue: Arc<dyn TaskQueue> = queue.clone();

        let classifier =
            Classifier::new(TunnelRecognizer::new(config.tunnel_host_suffixes.iter().cloned()));
        let worker = Arc::new(DeliveryWorker::new(
            storage.clone(),
            client,
            classifier,
            event_handler.clone(),
            clock.clone(),
            stats.clone(),
        ));
        let scheduler = Arc::new(RetryScheduler::new(
            config.retry_policy.clone(),
            storage.clone(),
            task_queue.clone(),
            event_handler,
            clock.clone(),
            stats.clone(),
        ));
        let dispatcher = Dispatcher::new(storage.clone(), task_queue, clock.clone());

        Ok(Self {
            storage,
            config,
            queue,
            dispatcher,
            worker,
            scheduler,
            stats,
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
            clock,
        })
    }

    /// Validates and persists a new endpoint.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Validation` for a rejected registration or
    /// `DeliveryError::Database` if it cannot be stored.
    pub async fn register_endpoint(&self, new_endpoint: NewEndpoint) -> Result<Endpoint> {
        new_endpoint.validate()?;

        let endpoint = new_endpoint.into_endpoint(self.clock.now_utc());
        self.storage.create_endpoint(endpoint.clone()).await?;

        info!(endpoint_id = %endpoint.id, url = %endpoint.url, "endpoint registered");
        Ok(endpoint)
    }

    /// Validates and applies a partial endpoint update. `None` if the
    /// endpoint no longer exists.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Validation` for rejected fields or
    /// `DeliveryError::Database` if the update cannot be stored.
    pub async fn update_endpoint(
        &self,
        id: EndpointId,
        update: EndpointUpdate,
    ) -> Result<Option<Endpoint>> {
        update.validate()?;
        Ok(self.storage.update_endpoint(id, update, self.clock.now_utc()).await?)
    }

    /// Fans an event out to subscribed endpoints.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::dispatch`].
    pub async fn dispatch(
        &self,
        event_type: &str,
        payload: Value,
    ) -> Result<Vec<DeliveryRecordId>> {
        self.dispatcher.dispatch(event_type, payload).await
    }

    /// The dispatcher, for producers that only need fan-out.
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    /// Spawns the worker pool.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::AlreadyRunning` if called twice.
    pub async fn start(&mut self) -> Result<()> {
        if self.worker_pool.is_some() {
            return Err(DeliveryError::AlreadyRunning);
        }

        info!(
            worker_count = self.config.worker_count,
            max_attempts = self.config.retry_policy.max_attempts,
            "starting delivery engine"
        );

        let mut worker_pool = WorkerPool::new(
            self.config.worker_count,
            self.queue.clone(),
            self.worker.clone(),
            self.scheduler.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
        );
        worker_pool.spawn_workers().await;
        self.worker_pool = Some(worker_pool);

        info!("delivery engine started");
        Ok(())
    }

    /// Re-enqueues every attempt still owed according to the record store.
    ///
    /// The queue is in-process, so tasks waiting in it or waiting out a retry
    /// delay are lost on a crash or restart. Their records keep the attempt
    /// number and due time, and each is enqueued again with whatever part of
    /// its delay is left. Returns the number of tasks enqueued.
    ///
    /// Meant to run once at startup: records whose tasks are already queued
    /// in this process would be attempted twice.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Database` if records cannot be listed.
    pub async fn recover_pending(&self) -> Result<usize> {
        let records = self.storage.find_pending_records(self.config.recovery_batch_size).await?;
        let now = self.clock.now_utc();

        let mut enqueued = 0;
        let mut retries = 0;
        for record in &records {
            let task = DeliveryTask { record_id: record.id, attempt_number: record.attempt_number };
            let delay = record.remaining_delay(now).unwrap_or(Duration::ZERO);
            match self.queue.enqueue(task, delay).await {
                Ok(()) => {
                    enqueued += 1;
                    if record.attempt_number > 1 {
                        retries += 1;
                    }
                },
                Err(error) => {
                    warn!(record_id = %record.id, error = %error, "failed to recover record");
                },
            }
        }

        info!(found = records.len(), enqueued, retries, "recovered pending delivery records");
        Ok(enqueued)
    }

    /// Current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Delayed retries that have not fired yet.
    pub fn pending_retries(&self) -> usize {
        self.queue.pending_delayed()
    }

    /// Stops accepting work and waits for in-flight attempts within the
    /// configured shutdown timeout. Delayed retries still waiting are dropped
    /// from memory; their records keep them for [`Self::recover_pending`].
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` or `WorkerPanic` from the worker pool.
    pub async fn shutdown(mut self) -> Result<()> {
        info!(pending_retries = self.queue.pending_delayed(), "shutting down delivery engine");

        self.queue.close();

        match self.worker_pool.take() {
            Some(worker_pool) => worker_pool.shutdown_graceful(self.config.shutdown_timeout).await,
            None => {
                info!("delivery engine was not started, shutdown completed immediately");
                Ok(())
            },
        }
    }
}
