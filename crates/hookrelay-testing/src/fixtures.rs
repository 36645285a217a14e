//! Builders for endpoints and delivery records.

use chrono::Utc;
use hookrelay_core::{DeliveryRecord, EndpointId, NewDeliveryRecord, NewEndpoint};
use serde_json::{json, Value};
use uuid::Uuid;

/// Builder for endpoint registrations.
#[derive(Debug, Clone)]
pub struct EndpointBuilder {
    url: Option<String>,
    subscriptions: Vec<String>,
    enabled: bool,
}

impl EndpointBuilder {
    /// Creates a builder with no URL and no subscriptions.
    pub fn new() -> Self {
        Self { url: None, subscriptions: Vec::new(), enabled: true }
    }

    /// Creates a builder with a unique URL subscribed to everything.
    pub fn with_defaults() -> Self {
        Self {
            url: Some(format!("https://hooks.example.com/{}", Uuid::new_v4().simple())),
            subscriptions: vec!["*".to_string()],
            enabled: true,
        }
    }

    /// Sets the destination URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Replaces the subscription list.
    #[must_use]
    pub fn subscriptions<I, S>(mut self, subscriptions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscriptions = subscriptions.into_iter().map(Into::into).collect();
        self
    }

    /// Adds one subscription.
    #[must_use]
    pub fn subscribe(mut self, event_type: impl Into<String>) -> Self {
        self.subscriptions.push(event_type.into());
        self
    }

    /// Registers the endpoint disabled.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Builds the registration.
    pub fn build(self) -> NewEndpoint {
        NewEndpoint {
            url: self.url.unwrap_or_else(|| "https://hooks.example.com/default".to_string()),
            subscriptions: self.subscriptions,
            enabled: self.enabled,
        }
    }
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// A never-attempted `order.created` record for `endpoint_id`.
pub fn order_created_record(endpoint_id: EndpointId) -> DeliveryRecord {
    delivery_record(endpoint_id, "order.created", json!({"id": 1}))
}

/// A never-attempted record with the given event and payload.
pub fn delivery_record(
    endpoint_id: EndpointId,
    event_type: impl Into<String>,
    payload: Value,
) -> DeliveryRecord {
    NewDeliveryRecord { endpoint_id, event_type: event_type.into(), payload }
        .into_record(Utc::now())
}
