//! HTTP client for webhook delivery.
//!
//! Sends a single JSON POST and reports either the response (any status) or
//! the kind of transport failure that prevented one. Status interpretation
//! belongs to the classifier.

use std::{collections::HashMap, error::Error as StdError, io, sync::Arc, time::Duration};

use hookrelay_core::{Clock, RealClock, RecordedResponse, TransportErrorCode};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info_span, warn, Instrument};

use crate::error::{DeliveryError, Result};

/// Largest response body kept on the delivery record.
const MAX_RECORDED_BODY_BYTES: usize = 64 * 1024;

/// Marker appended to truncated bodies.
const TRUNCATION_SUFFIX: &str = "... (truncated)";

/// Configuration for the delivery client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Whole-request timeout.
    pub timeout: Duration,
    /// Fixed client identifier sent as `User-Agent`.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: crate::DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Response received from an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers with lowercase names.
    pub headers: HashMap<String, String>,
    /// Response body, lossily decoded and capped.
    pub body: String,
    /// Time from send to fully read body.
    pub duration: Duration,
}

impl HttpResponse {
    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Persisted `{headers, code, body}` form.
    pub fn to_recorded(&self) -> RecordedResponse {
        RecordedResponse::Http {
            headers: self.headers.clone(),
            code: self.status,
            body: self.body.clone(),
        }
    }
}

/// Failure before any HTTP response was received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    /// Failure kind.
    pub code: TransportErrorCode,
    /// Underlying error text for logs.
    pub message: String,
    /// Time until the failure surfaced.
    pub duration: Duration,
}

impl TransportFailure {
    /// Persisted `{error}` form.
    pub fn to_recorded(&self) -> RecordedResponse {
        RecordedResponse::Transport { error: self.code }
    }
}

/// Either side of a single POST.
pub type PostResult = std::result::Result<HttpResponse, TransportFailure>;

/// HTTP client for webhook delivery.
///
/// Clones share one connection pool. Attempt durations are measured on the
/// client's [`Clock`].
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
    clock: Arc<dyn Clock>,
}

impl DeliveryClient {
    /// Creates a client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.timeout.is_zero() {
            return Err(DeliveryError::configuration("delivery timeout must be positive"));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config, clock: Arc::new(RealClock::new()) })
    }

    /// Measures attempt durations on `clock` instead of the OS clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Creates a client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Configuration in use.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// POSTs `body` as JSON to `url`.
    ///
    /// Any HTTP status is a successful exchange. Only failures that leave no
    /// response are returned as `Err`.
    pub async fn post_json(&self, url: &str, body: &Value) -> PostResult {
        let span = info_span!("webhook_post", url = %url);

        async move {
            let start = self.clock.now();
            let elapsed = || self.clock.now().saturating_duration_since(start);

            let response = match self.client.post(url).json(body).send().await {
                Ok(response) => response,
                Err(e) => {
                    let e = e.without_url();
                    let failure =
                        failure_from_parts(e.is_timeout(), e.is_connect(), &e, elapsed());
                    warn!(
                        error_code = %failure.code,
                        duration_ms = failure.duration.as_millis(),
                        "request failed: {}",
                        failure.message
                    );
                    return Err(failure);
                },
            };

            let status = response.status().as_u16();
            let headers = extract_headers(response.headers());

            let body = match response.bytes().await {
                Ok(bytes) => decode_body(&bytes),
                Err(e) if e.is_timeout() => {
                    return Err(failure_from_parts(true, false, &e.without_url(), elapsed()));
                },
                Err(e) => {
                    warn!("failed to read response body: {}", e);
                    String::new()
                },
            };

            let duration = elapsed();
            debug!(status, duration_ms = duration.as_millis(), "received response");

            Ok(HttpResponse { status, headers, body, duration })
        }
        .instrument(span)
        .await
    }
}

/// Maps a request error to a transport failure kind.
///
/// Timeouts win. A `rustls::Error` anywhere in the source chain makes it a
/// TLS failure, even though handshake failures also surface as connect
/// errors. Anything else that prevented a response counts as a connection
/// failure. Only the error types decide the kind, never the message text.
pub fn failure_from_parts(
    is_timeout: bool,
    is_connect: bool,
    error: &(dyn StdError + 'static),
    duration: Duration,
) -> TransportFailure {
    let message = error_chain(error);

    let code = if is_timeout {
        TransportErrorCode::Timeout
    } else if is_tls_error(error) {
        TransportErrorCode::Tls
    } else {
        if !is_connect {
            debug!(error = %message, "non-connect request failure treated as connection error");
        }
        TransportErrorCode::Connection
    };

    TransportFailure { code, message, duration }
}

fn error_chain(error: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![error.to_string()];
    let mut source = error.source();
    while let Some(err) = source {
        parts.push(err.to_string());
        source = err.source();
    }
    parts.join(": ")
}

/// Walks the source chain looking for a rustls error.
///
/// The TLS stream reports rustls failures as an `io::Error` wrapping the
/// `rustls::Error`, and `io::Error::source` skips that wrapped value, so
/// custom io errors are unwrapped through `get_ref` instead.
fn is_tls_error(error: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(err) = current {
        if err.is::<rustls::Error>() {
            return true;
        }
        current = match err.downcast_ref::<io::Error>().and_then(io::Error::get_ref) {
            Some(inner) => Some(inner as &(dyn StdError + 'static)),
            None => err.source(),
        };
    }
    false
}

fn decode_body(bytes: &[u8]) -> String {
    if bytes.len() <= MAX_RECORDED_BODY_BYTES {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let kept = MAX_RECORDED_BODY_BYTES - TRUNCATION_SUFFIX.len();
    format!("{}{TRUNCATION_SUFFIX}", String::from_utf8_lossy(&bytes[..kept]))
}

/// Extracts headers from a reqwest `HeaderMap`, skipping non-UTF-8 values.
///
/// Repeated headers are joined with `", "` in arrival order.
fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    let mut headers: HashMap<String, String> = HashMap::with_capacity(header_map.keys_len());
    for (key, value) in header_map {
        let Ok(value) = value.to_str() else {
            continue;
        };
        headers
            .entry(key.to_string())
            .and_modify(|joined| {
                joined.push_str(", ");
                joined.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    headers
}
