//! Persisted shapes and endpoint lifecycle rules seen from outside the crate.

use std::collections::HashMap;

use chrono::{Duration, Utc};
use hookrelay_core::{
    subscription, DeliveryRecord, EndpointUpdate, NewDeliveryRecord, NewEndpoint,
    RecordedResponse, TransportErrorCode, ValidationError,
};
use proptest::prelude::*;
use serde_json::json;

#[test]
fn recorded_http_response_round_trips_in_stored_shape() {
    let stored = json!({
        "headers": {"content-type": "application/json"},
        "code": 502,
        "body": "upstream unavailable",
    });

    let response: RecordedResponse = serde_json::from_value(stored.clone()).unwrap();

    assert_eq!(response.status_code(), Some(502));
    assert!(!response.is_success());
    assert_eq!(serde_json::to_value(&response).unwrap(), stored);
}

#[test]
fn transport_failures_store_only_an_error_code() {
    for (code, text) in [
        (TransportErrorCode::Tls, "TLS_ERROR"),
        (TransportErrorCode::Connection, "CONNECTION_ERROR"),
        (TransportErrorCode::Timeout, "TIMEOUT_ERROR"),
    ] {
        let response = RecordedResponse::Transport { error: code };
        assert_eq!(serde_json::to_value(&response).unwrap(), json!({"error": text}));
        assert_eq!(response.error_code(), Some(code));
        assert_eq!(response.status_code(), None);
    }
}

#[test]
fn record_serializes_with_nested_response() {
    let mut record: DeliveryRecord = NewDeliveryRecord {
        endpoint_id: hookrelay_core::EndpointId::new(),
        event_type: "invoice.paid".to_string(),
        payload: json!({"amount": 1200}),
    }
    .into_record(Utc::now());
    record.response = Some(RecordedResponse::Http {
        headers: HashMap::new(),
        code: 200,
        body: String::new(),
    });

    let value = serde_json::to_value(&record).unwrap();

    assert_eq!(value["event_type"], "invoice.paid");
    assert_eq!(value["response"]["code"], 200);
    let back: DeliveryRecord = serde_json::from_value(value).unwrap();
    assert_eq!(back, record);
}

#[test]
fn registration_without_enabled_flag_defaults_to_enabled() {
    let endpoint: NewEndpoint = serde_json::from_value(json!({
        "url": "https://good.example/hook",
        "subscriptions": ["order.created"],
    }))
    .unwrap();

    assert!(endpoint.enabled);
    assert!(endpoint.validate().is_ok());
}

#[test]
fn invalid_registrations_are_rejected() {
    let cases = [
        (NewEndpoint::new("", ["*"]), "empty url"),
        (NewEndpoint::new("ftp://files.example/drop", ["*"]), "non-http scheme"),
        (NewEndpoint::new("https://good.example/hook", Vec::<String>::new()), "no subscriptions"),
        (NewEndpoint::new("https://good.example/hook", ["order.created", " "]), "blank entry"),
    ];

    for (endpoint, label) in cases {
        assert!(endpoint.validate().is_err(), "{label} should be rejected");
    }
    assert_eq!(
        NewEndpoint::new("https://good.example/hook", Vec::<String>::new()).validate(),
        Err(ValidationError::NoSubscriptions)
    );
}

#[test]
fn disable_update_keeps_url_and_subscriptions() {
    let created = Utc::now();
    let mut endpoint =
        NewEndpoint::new("https://good.example/hook", ["order.created"]).into_endpoint(created);
    let original = endpoint.clone();

    EndpointUpdate::disable().apply_to(&mut endpoint, created + Duration::seconds(5));

    assert!(!endpoint.enabled);
    assert_eq!(endpoint.url, original.url);
    assert_eq!(endpoint.subscriptions, original.subscriptions);
    assert!(endpoint.updated_at > original.updated_at);
    assert!(!endpoint.accepts("order.created"));
}

proptest! {
    #[test]
    fn disabled_endpoints_never_accept(event in "[a-z]{1,8}\\.[a-z]{1,8}") {
        let mut endpoint = NewEndpoint::new("https://good.example/hook", ["*"])
            .into_endpoint(Utc::now());
        prop_assert!(endpoint.accepts(&event));

        endpoint.enabled = false;
        prop_assert!(!endpoint.accepts(&event));
        prop_assert!(subscription::matches(&endpoint, &event));
    }
}
