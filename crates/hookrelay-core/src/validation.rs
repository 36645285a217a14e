//! Input validation for endpoint registration and event dispatch.
//!
//! A value is "blank" when it is null, `false`, a whitespace-only string, or
//! an empty array or object. Numbers and `true` are never blank.

use serde_json::Value;
use url::Url;

use crate::{
    error::ValidationError,
    models::{EndpointUpdate, NewEndpoint},
};

/// Returns whether a JSON value counts as absent.
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(flag) => !flag,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Number(_) => false,
    }
}

/// Checks that `url` is present and an absolute http or https URL.
pub fn validate_url(url: &str) -> Result<(), ValidationError> {
    if url.trim().is_empty() {
        return Err(ValidationError::EmptyUrl);
    }

    let parsed = Url::parse(url).map_err(|e| ValidationError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(()),
        "http" | "https" => Err(ValidationError::InvalidUrl {
            url: url.to_string(),
            reason: "missing host".to_string(),
        }),
        scheme => Err(ValidationError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {scheme}"),
        }),
    }
}

/// Checks that a subscription list is non-empty with no blank entries.
pub fn validate_subscriptions(subscriptions: &[String]) -> Result<(), ValidationError> {
    if subscriptions.is_empty() {
        return Err(ValidationError::NoSubscriptions);
    }
    if subscriptions.iter().any(|s| s.trim().is_empty()) {
        return Err(ValidationError::BlankSubscription);
    }
    Ok(())
}

/// Checks an event before fan-out.
pub fn validate_event(event_type: &str, payload: &Value) -> Result<(), ValidationError> {
    if event_type.trim().is_empty() {
        return Err(ValidationError::BlankEventType);
    }
    if is_blank(payload) {
        return Err(ValidationError::BlankPayload);
    }
    Ok(())
}

impl NewEndpoint {
    /// Validates the registration.
    ///
    /// # Errors
    ///
    /// Returns the first failing rule: URL, then subscriptions.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_url(&self.url)?;
        validate_subscriptions(&self.subscriptions)
    }
}

impl EndpointUpdate {
    /// Validates only the fields that are being changed.
    ///
    /// # Errors
    ///
    /// Returns the first failing rule.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(url) = &self.url {
            validate_url(url)?;
        }
        if let Some(subscriptions) = &self.subscriptions {
            validate_subscriptions(subscriptions)?;
        }
        Ok(())
    }
}
