//! Test environment wiring a real delivery engine to in-memory storage.
//!
//! The engine, worker pool, classifier and HTTP client are the production
//! types. Storage is [`MockDeliveryStorage`], the clock is a [`TestClock`]
//! and every endpoint a test registers against [`TestEnv::url`] points at
//! one wiremock server.

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use hookrelay_core::{
    Clock, DeliveryRecord, DeliveryRecordId, Endpoint, EndpointId, EventHandler, TestClock,
};
use hookrelay_delivery::{
    storage::mock::MockDeliveryStorage, ClientConfig, DeliveryConfig, DeliveryEngine,
    EngineStats, RetryPolicy,
};
use serde_json::Value;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

use crate::{events::RecordingEventHandler, fixtures::EndpointBuilder};

/// Host suffix that makes `127.0.0.1` count as a development tunnel.
pub const LOCAL_TUNNEL_SUFFIX: &str = "0.0.1";

const DEFAULT_WAIT: Duration = Duration::from_secs(10);

/// Builder for [`TestEnv`].
#[derive(Debug, Clone)]
pub struct TestEnvBuilder {
    worker_count: usize,
    shutdown_timeout: Duration,
    request_timeout: Duration,
    max_attempts: u32,
    tunnel_host_suffixes: Vec<String>,
    start_engine: bool,
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        Self {
            worker_count: 2,
            shutdown_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            max_attempts: RetryPolicy::default().max_attempts,
            tunnel_host_suffixes: vec!["ngrok.io".to_string()],
            start_engine: true,
        }
    }
}

impl TestEnvBuilder {
    /// Sets the number of delivery workers.
    #[must_use]
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Sets how long shutdown waits for in-flight attempts.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the per-request HTTP timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the total attempt budget per record.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Treats the local wiremock server as a development tunnel host.
    #[must_use]
    pub fn local_server_as_tunnel(mut self) -> Self {
        self.tunnel_host_suffixes.push(LOCAL_TUNNEL_SUFFIX.to_string());
        self
    }

    /// Leaves the worker pool stopped until [`TestEnv::start`].
    #[must_use]
    pub fn without_workers(mut self) -> Self {
        self.start_engine = false;
        self
    }

    /// Builds the environment and, unless disabled, starts the workers.
    ///
    /// # Errors
    ///
    /// Fails if the engine rejects the configuration.
    pub async fn build(self) -> Result<TestEnv> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
            )
            .with_test_writer()
            .try_init();

        let http_mock = MockServer::start().await;
        let clock = TestClock::new();
        let storage = MockDeliveryStorage::new();
        let events = RecordingEventHandler::new();

        let config = DeliveryConfig {
            worker_count: self.worker_count,
            shutdown_timeout: self.shutdown_timeout,
            client_config: ClientConfig {
                timeout: self.request_timeout,
                ..ClientConfig::default()
            },
            retry_policy: RetryPolicy { max_attempts: self.max_attempts, ..RetryPolicy::default() },
            tunnel_host_suffixes: self.tunnel_host_suffixes,
            ..DeliveryConfig::default()
        };

        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let event_handler: Arc<dyn EventHandler> = Arc::new(events.clone());
        let mut engine = DeliveryEngine::with_event_handler(
            Arc::new(storage.clone()),
            config,
            clock_arc,
            event_handler,
        )
        .context("failed to create delivery engine")?;

        if self.start_engine {
            engine.start().await.context("failed to start delivery engine")?;
        }

        Ok(TestEnv { http_mock, clock, storage, events, engine })
    }
}

/// A running delivery engine plus the doubles around it.
pub struct TestEnv {
    /// Mock HTTP server standing in for every registered endpoint.
    pub http_mock: MockServer,
    /// Virtual clock driving retry delays.
    pub clock: TestClock,
    /// In-memory endpoint and record store.
    pub storage: MockDeliveryStorage,
    /// Every delivery event the engine published.
    pub events: RecordingEventHandler,
    engine: DeliveryEngine,
}

impl TestEnv {
    /// Environment with default settings and running workers.
    ///
    /// # Errors
    ///
    /// See [`TestEnvBuilder::build`].
    pub async fn new() -> Result<Self> {
        Self::builder().build().await
    }

    /// Starts a builder.
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::default()
    }

    /// The engine under test.
    pub fn engine(&self) -> &DeliveryEngine {
        &self.engine
    }

    /// Starts workers for an environment built with
    /// [`TestEnvBuilder::without_workers`].
    ///
    /// # Errors
    ///
    /// Fails if the engine is already running.
    pub async fn start(&mut self) -> Result<()> {
        self.engine.start().await.context("failed to start delivery engine")
    }

    /// URL on the mock server.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.http_mock.uri(), path)
    }

    /// Answers every POST with `status`.
    pub async fn respond_with_status(&self, status: u16) {
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.http_mock)
            .await;
    }

    /// Registers an endpoint through the engine.
    ///
    /// # Errors
    ///
    /// Fails if validation or storage rejects it.
    pub async fn register(&self, endpoint: EndpointBuilder) -> Result<Endpoint> {
        self.engine.register_endpoint(endpoint.build()).await.context("failed to register endpoint")
    }

    /// Registers an endpoint at `path` on the mock server.
    ///
    /// # Errors
    ///
    /// Fails if validation or storage rejects it.
    pub async fn register_local<I, S>(&self, path: &str, subscriptions: I) -> Result<Endpoint>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.register(EndpointBuilder::new().url(self.url(path)).subscriptions(subscriptions)).await
    }

    /// Dispatches an event through the engine.
    ///
    /// # Errors
    ///
    /// Fails on validation or storage errors.
    pub async fn dispatch(
        &self,
        event_type: &str,
        payload: Value,
    ) -> Result<Vec<DeliveryRecordId>> {
        self.engine.dispatch(event_type, payload).await.context("dispatch failed")
    }

    /// Current state of a record.
    ///
    /// # Errors
    ///
    /// Fails if the record does not exist.
    pub async fn record(&self, id: DeliveryRecordId) -> Result<DeliveryRecord> {
        self.storage.delivery_record(id).await.with_context(|| format!("record {id} not found"))
    }

    /// Current state of an endpoint, `None` once deleted.
    pub async fn endpoint(&self, id: EndpointId) -> Option<Endpoint> {
        self.storage.endpoint(id).await
    }

    /// Engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.engine.stats().await
    }

    /// Number of requests the mock server has seen.
    pub async fn requests_received(&self) -> usize {
        self.http_mock.received_requests().await.map_or(0, |requests| requests.len())
    }

    /// Polls engine statistics until `condition` holds.
    ///
    /// # Errors
    ///
    /// Fails if the condition is still false after ten seconds.
    pub async fn wait_for_stats(
        &self,
        condition: impl Fn(&EngineStats) -> bool,
    ) -> Result<EngineStats> {
        let deadline = tokio::time::Instant::now() + DEFAULT_WAIT;
        loop {
            let stats = self.engine.stats().await;
            if condition(&stats) {
                return Ok(stats);
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("engine stats never reached the expected state: {stats:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Waits until no attempt is in flight and no retry is pending.
    ///
    /// # Errors
    ///
    /// Fails if work is still outstanding after ten seconds.
    pub async fn wait_until_idle(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + DEFAULT_WAIT;
        let mut quiet_polls = 0;
        while quiet_polls < 3 {
            let stats = self.engine.stats().await;
            if stats.in_flight_attempts == 0 && self.engine.pending_retries() == 0 {
                quiet_polls += 1;
            } else {
                quiet_polls = 0;
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("engine still busy: {stats:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    /// Shuts the engine down.
    ///
    /// # Errors
    ///
    /// Fails if workers do not stop within the shutdown timeout.
    pub async fn shutdown(self) -> Result<()> {
        self.engine.shutdown().await.context("engine shutdown failed")
    }
}
