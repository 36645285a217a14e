//! Core domain models and strongly-typed identifiers.
//!
//! Defines webhook endpoints, delivery records and the persisted response
//! shapes, plus newtype ID wrappers for compile-time type safety. Includes
//! database serialization traits for the PostgreSQL repositories.

use std::{collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{postgres::PgRow, Row};
use uuid::Uuid;

use crate::subscription;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed endpoint identifier.
///
/// Each endpoint is a registered destination URL with its own subscription
/// filter and enabled flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointId(pub Uuid);

impl EndpointId {
    /// Creates a new random endpoint ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EndpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EndpointId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for EndpointId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EndpointId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for EndpointId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed delivery record identifier.
///
/// One delivery record exists per (event, endpoint) pair produced by a
/// fan-out. Every attempt and retry for that pair carries this ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryRecordId(pub Uuid);

impl DeliveryRecordId {
    /// Creates a new random delivery record ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryRecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryRecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for DeliveryRecordId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for DeliveryRecordId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryRecordId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for DeliveryRecordId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Registered webhook destination.
///
/// Endpoints are created through registration, disabled by the delivery
/// worker when the destination looks unreachable, and deleted by the
/// delivery worker when a tunnel host reports that it no longer exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Unique identifier for this endpoint.
    pub id: EndpointId,

    /// Destination for the HTTP POST.
    pub url: String,

    /// Event types this endpoint wants. `*` matches every event type.
    pub subscriptions: Vec<String>,

    /// Disabled endpoints are skipped at fan-out and at delivery time.
    pub enabled: bool,

    /// When this endpoint was registered.
    pub created_at: DateTime<Utc>,

    /// When this endpoint was last modified.
    pub updated_at: DateTime<Utc>,
}

impl Endpoint {
    /// Returns whether this endpoint subscribes to `event_type`.
    pub fn is_subscribed(&self, event_type: &str) -> bool {
        subscription::matches(self, event_type)
    }

    /// Returns whether a delivery of `event_type` may be sent right now.
    ///
    /// This is the guard evaluated at fan-out and again before every attempt.
    pub fn accepts(&self, event_type: &str) -> bool {
        self.enabled && self.is_subscribed(event_type)
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Endpoint {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let subscriptions: sqlx::types::Json<Vec<String>> = row.try_get("subscriptions")?;

        Ok(Self {
            id: row.try_get("id")?,
            url: row.try_get("url")?,
            subscriptions: subscriptions.0,
            enabled: row.try_get("enabled")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Registration request for a new endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEndpoint {
    /// Destination URL.
    pub url: String,
    /// Subscribed event types.
    pub subscriptions: Vec<String>,
    /// Initial enabled flag.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl NewEndpoint {
    /// Creates an enabled endpoint registration.
    pub fn new<S: Into<String>>(
        url: impl Into<String>,
        subscriptions: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            url: url.into(),
            subscriptions: subscriptions.into_iter().map(Into::into).collect(),
            enabled: true,
        }
    }

    /// Builds the persisted endpoint, assigning an ID and timestamps.
    pub fn into_endpoint(self, now: DateTime<Utc>) -> Endpoint {
        Endpoint {
            id: EndpointId::new(),
            url: self.url,
            subscriptions: self.subscriptions,
            enabled: self.enabled,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update of an endpoint. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointUpdate {
    /// New destination URL.
    pub url: Option<String>,
    /// Replacement subscription list.
    pub subscriptions: Option<Vec<String>>,
    /// New enabled flag.
    pub enabled: Option<bool>,
}

impl EndpointUpdate {
    /// Update that only flips the endpoint to disabled.
    pub fn disable() -> Self {
        Self { enabled: Some(false), ..Self::default() }
    }

    /// Applies this update to an endpoint in place.
    pub fn apply_to(&self, endpoint: &mut Endpoint, now: DateTime<Utc>) {
        if let Some(url) = &self.url {
            endpoint.url.clone_from(url);
        }
        if let Some(subscriptions) = &self.subscriptions {
            endpoint.subscriptions.clone_from(subscriptions);
        }
        if let Some(enabled) = self.enabled {
            endpoint.enabled = enabled;
        }
        endpoint.updated_at = now;
    }
}

/// Transport-level failure codes persisted in place of an HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportErrorCode {
    /// TLS negotiation or certificate validation failed.
    #[serde(rename = "TLS_ERROR")]
    Tls,
    /// Host unreachable, DNS failure or refused connection.
    #[serde(rename = "CONNECTION_ERROR")]
    Connection,
    /// The request did not complete within the delivery timeout.
    #[serde(rename = "TIMEOUT_ERROR")]
    Timeout,
}

impl TransportErrorCode {
    /// Wire representation stored in the record and emitted in logs.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tls => "TLS_ERROR",
            Self::Connection => "CONNECTION_ERROR",
            Self::Timeout => "TIMEOUT_ERROR",
        }
    }
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the most recent delivery attempt, as persisted on the record.
///
/// Serializes to `{headers, code, body}` when the endpoint answered and to
/// `{error}` when the request never produced a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordedResponse {
    /// The endpoint returned an HTTP response.
    Http {
        /// Response headers.
        headers: HashMap<String, String>,
        /// HTTP status code.
        code: u16,
        /// Response body, lossily decoded as UTF-8.
        body: String,
    },
    /// The request failed below HTTP.
    Transport {
        /// Failure code.
        error: TransportErrorCode,
    },
}

impl RecordedResponse {
    /// Status code if an HTTP response was received.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Http { code, .. } => Some(*code),
            Self::Transport { .. } => None,
        }
    }

    /// Transport failure code if no response was received.
    pub fn error_code(&self) -> Option<TransportErrorCode> {
        match self {
            Self::Http { .. } => None,
            Self::Transport { error } => Some(*error),
        }
    }

    /// Whether the recorded attempt got a 2xx response.
    pub fn is_success(&self) -> bool {
        self.status_code().is_some_and(|code| (200..300).contains(&code))
    }
}

/// One instance of "this event should be sent to this endpoint".
///
/// Only the most recent attempt's outcome is retained in `response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// Unique identifier for this record.
    pub id: DeliveryRecordId,

    /// Owning endpoint. The endpoint may have been deleted since.
    pub endpoint_id: EndpointId,

    /// Event type, e.g. `order.created`.
    pub event_type: String,

    /// Opaque event payload.
    pub payload: Value,

    /// Outcome of the latest attempt. `None` until the first attempt completes.
    pub response: Option<RecordedResponse>,

    /// Number of the most recently scheduled attempt, starting at 1.
    pub attempt_number: u32,

    /// When the scheduled attempt is due. Set at creation and whenever a
    /// retry is scheduled, cleared once that attempt completes or is skipped.
    pub next_attempt_at: Option<DateTime<Utc>>,

    /// When the retry budget ran out.
    pub gave_up_at: Option<DateTime<Utc>>,

    /// When the record was created by the dispatcher.
    pub created_at: DateTime<Utc>,

    /// When the record was last modified.
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// JSON body sent to the endpoint: `{"event": ..., "payload": ...}`.
    pub fn wire_body(&self) -> Value {
        serde_json::json!({
            "event": self.event_type,
            "payload": self.payload,
        })
    }

    /// Whether an attempt is still owed to this record.
    pub fn has_pending_attempt(&self) -> bool {
        self.next_attempt_at.is_some()
    }

    /// Time left until the pending attempt is due, zero once it is overdue.
    /// `None` without a pending attempt.
    pub fn remaining_delay(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        self.next_attempt_at.map(|due| (due - now).to_std().unwrap_or_default())
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeliveryRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let payload: sqlx::types::Json<Value> = row.try_get("payload")?;
        let response: Option<sqlx::types::Json<RecordedResponse>> = row.try_get("response")?;
        let attempt_number: i32 = row.try_get("attempt_number")?;
        let attempt_number =
            u32::try_from(attempt_number).map_err(|e| sqlx::Error::ColumnDecode {
                index: "attempt_number".to_string(),
                source: Box::new(e),
            })?;

        Ok(Self {
            id: row.try_get("id")?,
            endpoint_id: row.try_get("endpoint_id")?,
            event_type: row.try_get("event_type")?,
            payload: payload.0,
            response: response.map(|json| json.0),
            attempt_number,
            next_attempt_at: row.try_get("next_attempt_at")?,
            gave_up_at: row.try_get("gave_up_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Creation request for a delivery record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDeliveryRecord {
    /// Target endpoint.
    pub endpoint_id: EndpointId,
    /// Event type.
    pub event_type: String,
    /// Event payload.
    pub payload: Value,
}

impl NewDeliveryRecord {
    /// Builds the persisted record with its first attempt due at `now`.
    pub fn into_record(self, now: DateTime<Utc>) -> DeliveryRecord {
        DeliveryRecord {
            id: DeliveryRecordId::new(),
            endpoint_id: self.endpoint_id,
            event_type: self.event_type,
            payload: self.payload,
            response: None,
            attempt_number: 1,
            next_attempt_at: Some(now),
            gave_up_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
