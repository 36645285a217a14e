//! Webhook fan-out, delivery and retry.
//!
//! This crate turns application events into HTTP POSTs against registered
//! endpoints and manages what happens when those POSTs fail.
//!
//! # Architecture
//!
//! ```text
//! dispatch(event_type, payload)
//!        │ validate, match, create records
//!        ▼
//!  ┌────────────┐   DeliveryTask    ┌──────────────┐  RetryRequested  ┌────────────────┐
//!  │ Dispatcher │ ────────────────▶ │ WorkerPool   │ ───────────────▶ │ RetryScheduler │
//!  └────────────┘   (queue)         │ DeliveryWorker│                 └────────────────┘
//!                        ▲          └──────────────┘                          │
//!                        └──────────────── delayed DeliveryTask ──────────────┘
//! ```
//!
//! 1. **Dispatch** - one record and one task per enabled, subscribed endpoint
//! 2. **Attempt** - reload, re-check the endpoint, POST, persist the response
//! 3. **Classify** - ordered rules pick delivered, retry, disable, delete or
//!    abandon
//! 4. **Retry** - `n^5` seconds plus 30-600 s jitter, ten attempts in total
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hookrelay_core::{NewEndpoint, RealClock};
//! use hookrelay_delivery::{
//!     storage::mock::MockDeliveryStorage, DeliveryConfig, DeliveryEngine, DeliveryError,
//! };
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), DeliveryError> {
//! let storage = Arc::new(MockDeliveryStorage::new());
//! let mut engine = DeliveryEngine::new(storage, DeliveryConfig::default(), Arc::new(RealClock))?;
//!
//! engine
//!     .register_endpoint(NewEndpoint::new("https://good.example/hook", ["order.created"]))
//!     .await?;
//! engine.start().await?;
//! engine.dispatch("order.created", json!({"id": 1})).await?;
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod classify;
pub mod client;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod worker;
mod worker_pool;

pub use classify::{Classification, Classifier, TunnelRecognizer, Verdict};
pub use client::{ClientConfig, DeliveryClient, HttpResponse, TransportFailure};
pub use dispatcher::Dispatcher;
pub use engine::{DeliveryConfig, DeliveryEngine, EngineStats};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use queue::{DeliveryTask, InProcessQueue, TaskQueue};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::RetryScheduler;
pub use storage::{DeliveryStorage, PostgresDeliveryStorage};
pub use worker::{AttemptOutcome, DeliveryWorker, SkipReason};

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default number of ready tasks the queue holds.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Default `User-Agent` sent with every delivery.
pub const DEFAULT_USER_AGENT: &str = "hookrelay/1.0";

/// Default development tunnel host suffixes.
pub const DEFAULT_TUNNEL_HOST_SUFFIXES: &[&str] = &["ngrok.io"];
