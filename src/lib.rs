//! hookrelay service library.
//!
//! The binary in `main.rs` loads [`Config`], connects to PostgreSQL and runs
//! a [`DeliveryEngine`](hookrelay_delivery::DeliveryEngine) until it receives
//! a shutdown signal. Embedding applications use the core and delivery
//! crates directly.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;

pub use config::{Config, LogFormat};
