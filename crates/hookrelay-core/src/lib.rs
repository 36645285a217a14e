//! Core domain models, validation and persistence for webhook delivery.
//!
//! Provides strongly-typed endpoint and delivery record models, the
//! subscription match rule, input validation, PostgreSQL repositories, the
//! clock abstraction and the delivery event stream. The delivery crate builds
//! its dispatcher, worker and retry scheduler on top of these.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod storage;
pub mod subscription;
pub mod time;
pub mod validation;

pub use error::{CoreError, Result, ValidationError};
pub use events::{
    AttemptResolvedEvent, AttemptStartedEvent, DeliveryEvent, EventHandler, GaveUpEvent,
    MulticastEventHandler, NoOpEventHandler, Resolution, RetryScheduledEvent, TracingEventHandler,
};
pub use models::{
    DeliveryRecord, DeliveryRecordId, Endpoint, EndpointId, EndpointUpdate, NewDeliveryRecord,
    NewEndpoint, RecordedResponse, TransportErrorCode,
};
pub use storage::Storage;
pub use time::{Clock, RealClock, TestClock};
