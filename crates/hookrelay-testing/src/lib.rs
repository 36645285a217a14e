//! Test infrastructure for hookrelay.
//!
//! [`TestEnv`] wires a real [`DeliveryEngine`](hookrelay_delivery::DeliveryEngine)
//! to in-memory storage, a virtual clock and a wiremock server, so a test
//! can register endpoints, dispatch events and watch every attempt without a
//! database or real waits. Retry delays run through the [`TestClock`], which
//! means a full ten-attempt cycle completes in milliseconds.
//!
//! [`TestDatabase`] is the exception: repository tests that must run real SQL
//! connect through it when `DATABASE_URL` is set.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod database;
pub mod env;
pub mod events;
pub mod fixtures;

pub use database::TestDatabase;
pub use env::{TestEnv, TestEnvBuilder};
pub use events::RecordingEventHandler;
pub use fixtures::EndpointBuilder;
pub use hookrelay_core::TestClock;
pub use wiremock as http;
