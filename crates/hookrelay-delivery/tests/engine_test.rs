//! End-to-end delivery tests through the running engine.
//!
//! Every test drives the production worker pool against a wiremock server.
//! Retry delays run on the virtual clock, so full retry cycles finish
//! immediately.

use std::{collections::HashMap, time::Duration};

use anyhow::Result;
use hookrelay_core::{
    Clock, DeliveryEvent, EndpointUpdate, RecordedResponse, Resolution, TransportErrorCode,
};
use hookrelay_delivery::RetryPolicy;
use hookrelay_testing::{
    fixtures::{order_created_record, EndpointBuilder},
    TestEnv,
};
use serde_json::json;
use wiremock::{matchers, Mock, ResponseTemplate};

#[tokio::test]
async fn order_created_is_delivered_once() -> Result<()> {
    let env = TestEnv::new().await?;

    Mock::given(matchers::method("POST"))
        .and(matchers::path("/hook"))
        .and(matchers::header("content-type", "application/json"))
        .and(matchers::body_json(json!({"event": "order.created", "payload": {"id": 1}})))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&env.http_mock)
        .await;

    let endpoint = env.register_local("/hook", ["order.created"]).await?;

    let ids = env.dispatch("order.created", json!({"id": 1})).await?;
    assert_eq!(ids.len(), 1);

    env.wait_for_stats(|s| s.delivered == 1).await?;
    env.wait_until_idle().await?;

    let record = env.record(ids[0]).await?;
    assert_eq!(record.response.as_ref().and_then(RecordedResponse::status_code), Some(200));
    assert!(matches!(
        record.response,
        Some(RecordedResponse::Http { ref body, .. }) if body == "ok"
    ));

    let stats = env.stats().await;
    assert_eq!(stats.retries_scheduled, 0);
    assert_eq!(stats.attempts_started, 1);
    assert_eq!(env.endpoint(endpoint.id).await, Some(endpoint));

    env.shutdown().await
}

#[tokio::test]
async fn fan_out_skips_disabled_and_unsubscribed_endpoints() -> Result<()> {
    let env = TestEnv::new().await?;
    env.respond_with_status(204).await;

    env.register_local("/exact", ["order.created"]).await?;
    env.register_local("/wildcard", ["*"]).await?;
    env.register_local("/other", ["order.updated"]).await?;
    env.register(EndpointBuilder::new().url(env.url("/off")).subscribe("*").disabled()).await?;

    let ids = env.dispatch("order.created", json!({"id": 7})).await?;
    assert_eq!(ids.len(), 2);

    env.wait_for_stats(|s| s.delivered == 2).await?;
    env.wait_until_idle().await?;

    let mut paths: Vec<String> = env
        .http_mock
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|request| request.url.path().to_string())
        .collect();
    paths.sort();
    assert_eq!(paths, vec!["/exact", "/wildcard"]);

    env.shutdown().await
}

#[tokio::test]
async fn persistent_server_error_stops_after_ten_attempts() -> Result<()> {
    let env = TestEnv::new().await?;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(10)
        .mount(&env.http_mock)
        .await;

    let endpoint = env.register_local("/hook", ["*"]).await?;
    let ids = env.dispatch("order.created", json!({"id": 1})).await?;

    env.wait_for_stats(|s| s.gave_up == 1).await?;
    env.wait_until_idle().await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(env.requests_received().await, 10);

    let stats = env.stats().await;
    assert_eq!(stats.attempts_started, 10);
    assert_eq!(stats.retries_scheduled, 9);

    let policy = RetryPolicy::default();
    let sleeps = env.clock.recorded_sleeps();
    assert_eq!(sleeps.len(), 9);
    for (index, delay) in sleeps.iter().enumerate() {
        let failed_attempt = u32::try_from(index)? + 1;
        let (min, max) = policy.delay_bounds(failed_attempt);
        assert!(*delay >= min && *delay <= max, "attempt {failed_attempt}: {delay:?}");
    }

    let record = env.record(ids[0]).await?;
    assert_eq!(record.response.as_ref().and_then(RecordedResponse::status_code), Some(500));
    assert!(env.endpoint(endpoint.id).await.is_some_and(|e| e.enabled));

    let gave_up = env.events.count(|e| matches!(e, DeliveryEvent::GaveUp(_))).await;
    assert_eq!(gave_up, 1);

    env.shutdown().await
}

#[tokio::test]
async fn missing_tunnel_deletes_endpoint() -> Result<()> {
    let env = TestEnv::builder().local_server_as_tunnel().build().await?;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(404).set_body_string("Tunnel abc123.0.0.1 not found"))
        .expect(1)
        .mount(&env.http_mock)
        .await;

    let endpoint = env.register_local("/hook", ["*"]).await?;
    let ids = env.dispatch("order.created", json!({"id": 1})).await?;

    env.wait_for_stats(|s| s.endpoints_deleted == 1).await?;
    env.wait_until_idle().await?;

    assert!(env.endpoint(endpoint.id).await.is_none());
    assert_eq!(env.stats().await.retries_scheduled, 0);
    assert_eq!(
        env.record(ids[0]).await?.response.as_ref().and_then(RecordedResponse::status_code),
        Some(404)
    );

    let later = env.dispatch("order.updated", json!({"id": 2})).await?;
    assert!(later.is_empty());
    assert_eq!(env.storage.record_count().await, 1);

    env.shutdown().await
}

#[tokio::test]
async fn plain_404_from_tunnel_host_is_retried() -> Result<()> {
    let env = TestEnv::builder().local_server_as_tunnel().max_attempts(2).build().await?;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such route"))
        .expect(2)
        .mount(&env.http_mock)
        .await;

    let endpoint = env.register_local("/hook", ["*"]).await?;
    env.dispatch("order.created", json!({"id": 1})).await?;

    env.wait_for_stats(|s| s.gave_up == 1).await?;
    env.wait_until_idle().await?;

    assert!(env.endpoint(endpoint.id).await.is_some());
    env.shutdown().await
}

#[tokio::test]
async fn tunnel_bad_gateway_is_retried() -> Result<()> {
    let env = TestEnv::builder().local_server_as_tunnel().max_attempts(2).build().await?;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .expect(2)
        .mount(&env.http_mock)
        .await;

    let endpoint = env.register_local("/hook", ["*"]).await?;
    env.dispatch("order.created", json!({"id": 1})).await?;

    env.wait_for_stats(|s| s.gave_up == 1).await?;
    env.wait_until_idle().await?;

    let stats = env.stats().await;
    assert_eq!(stats.retries_scheduled, 1);
    assert_eq!(stats.endpoints_disabled, 0);
    assert!(env.endpoint(endpoint.id).await.is_some_and(|e| e.enabled));

    env.shutdown().await
}

#[tokio::test]
async fn tunnel_gateway_timeout_disables_and_keeps_history() -> Result<()> {
    let env = TestEnv::builder().local_server_as_tunnel().build().await?;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(504))
        .expect(1)
        .mount(&env.http_mock)
        .await;

    let endpoint = env.register_local("/hook", ["*"]).await?;
    let ids = env.dispatch("order.created", json!({"id": 1})).await?;

    env.wait_for_stats(|s| s.endpoints_disabled == 1).await?;
    env.wait_until_idle().await?;

    let stored = env.endpoint(endpoint.id).await;
    assert!(stored.is_some_and(|e| !e.enabled));
    assert_eq!(env.stats().await.retries_scheduled, 0);

    let history = env.storage.records_for_endpoint(endpoint.id).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, ids[0]);
    assert_eq!(history[0].response.as_ref().and_then(RecordedResponse::status_code), Some(504));

    let later = env.dispatch("order.created", json!({"id": 2})).await?;
    assert!(later.is_empty());

    env.shutdown().await
}

#[tokio::test]
async fn gateway_timeout_from_ordinary_host_is_retried() -> Result<()> {
    let env = TestEnv::builder().max_attempts(2).build().await?;
    env.respond_with_status(504).await;

    let endpoint = env.register_local("/hook", ["*"]).await?;
    env.dispatch("order.created", json!({"id": 1})).await?;

    env.wait_for_stats(|s| s.gave_up == 1).await?;
    env.wait_until_idle().await?;

    assert_eq!(env.requests_received().await, 2);
    assert!(env.endpoint(endpoint.id).await.is_some_and(|e| e.enabled));

    env.shutdown().await
}

#[tokio::test]
async fn connection_failure_disables_without_deleting() -> Result<()> {
    let env = TestEnv::new().await?;

    let endpoint =
        env.register(EndpointBuilder::new().url("http://127.0.0.1:1/hook").subscribe("*")).await?;
    let ids = env.dispatch("order.created", json!({"id": 1})).await?;

    env.wait_for_stats(|s| s.endpoints_disabled == 1).await?;
    env.wait_until_idle().await?;

    assert!(env.endpoint(endpoint.id).await.is_some_and(|e| !e.enabled));
    assert_eq!(env.stats().await.retries_scheduled, 0);

    let record = env.record(ids[0]).await?;
    assert_eq!(
        record.response,
        Some(RecordedResponse::Transport { error: TransportErrorCode::Connection })
    );
    assert_eq!(env.storage.records_for_endpoint(endpoint.id).await.len(), 1);

    env.shutdown().await
}

#[tokio::test]
async fn tls_failure_is_retried_and_keeps_endpoint_enabled() -> Result<()> {
    let env = TestEnv::builder().max_attempts(2).build().await?;
    let https_url = format!("{}/hook", env.http_mock.uri().replacen("http://", "https://", 1));

    let endpoint = env.register(EndpointBuilder::new().url(https_url).subscribe("*")).await?;
    let ids = env.dispatch("order.created", json!({"id": 1})).await?;

    env.wait_for_stats(|s| s.gave_up == 1).await?;
    env.wait_until_idle().await?;

    let stats = env.stats().await;
    assert_eq!(stats.attempts_started, 2);
    assert_eq!(stats.retries_scheduled, 1);
    assert_eq!(stats.endpoints_disabled, 0);
    assert!(env.endpoint(endpoint.id).await.is_some_and(|e| e.enabled));

    let record = env.record(ids[0]).await?;
    assert_eq!(serde_json::to_value(&record.response)?, json!({"error": "TLS_ERROR"}));
    assert!(record.gave_up_at.is_some());
    assert_eq!(env.requests_received().await, 0);

    env.shutdown().await
}

#[tokio::test]
async fn timeout_neither_disables_nor_retries() -> Result<()> {
    let env = TestEnv::builder().request_timeout(Duration::from_millis(200)).build().await?;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&env.http_mock)
        .await;

    let endpoint = env.register_local("/slow", ["*"]).await?;
    let ids = env.dispatch("order.created", json!({"id": 1})).await?;

    env.wait_for_stats(|s| s.abandoned == 1).await?;
    env.wait_until_idle().await?;

    let stats = env.stats().await;
    assert_eq!(stats.retries_scheduled, 0);
    assert_eq!(stats.endpoints_disabled, 0);
    assert!(env.endpoint(endpoint.id).await.is_some_and(|e| e.enabled));
    assert_eq!(
        env.record(ids[0]).await?.response,
        Some(RecordedResponse::Transport { error: TransportErrorCode::Timeout })
    );
    assert_eq!(env.events.resolutions().await, vec![Resolution::Abandoned]);

    env.shutdown().await
}

#[tokio::test]
async fn recovery_enqueues_unattempted_records() -> Result<()> {
    let mut env = TestEnv::builder().without_workers().build().await?;
    env.respond_with_status(200).await;

    let endpoint = env.register_local("/hook", ["order.created"]).await?;
    let stranded = order_created_record(endpoint.id);
    let stranded_id = stranded.id;
    env.storage.insert_delivery_record(stranded).await;

    assert_eq!(env.engine().recover_pending().await?, 1);

    env.start().await?;
    env.wait_for_stats(|s| s.delivered == 1).await?;
    env.wait_until_idle().await?;

    assert!(env.record(stranded_id).await?.response.is_some_and(|r| r.is_success()));
    assert_eq!(env.engine().recover_pending().await?, 0);

    env.shutdown().await
}

#[tokio::test]
async fn recovery_resumes_a_retry_waiting_out_its_delay() -> Result<()> {
    let mut env = TestEnv::builder().without_workers().build().await?;
    env.respond_with_status(200).await;

    let endpoint = env.register_local("/hook", ["order.created"]).await?;
    let now = env.clock.now_utc();
    let failed = RecordedResponse::Http { headers: HashMap::new(), code: 500, body: String::new() };

    let mut waiting = order_created_record(endpoint.id);
    waiting.response = Some(failed.clone());
    waiting.attempt_number = 3;
    waiting.next_attempt_at = Some(now + chrono::Duration::minutes(5));
    let waiting_id = waiting.id;
    env.storage.insert_delivery_record(waiting).await;

    let mut exhausted = order_created_record(endpoint.id);
    exhausted.response = Some(failed);
    exhausted.attempt_number = 10;
    exhausted.next_attempt_at = None;
    exhausted.gave_up_at = Some(now);
    env.storage.insert_delivery_record(exhausted).await;

    assert_eq!(env.engine().recover_pending().await?, 1);

    env.start().await?;
    env.wait_for_stats(|s| s.delivered == 1).await?;
    env.wait_until_idle().await?;

    assert!(env.clock.recorded_sleeps().contains(&Duration::from_secs(5 * 60)));
    assert_eq!(env.requests_received().await, 1);

    let record = env.record(waiting_id).await?;
    assert!(record.response.as_ref().is_some_and(|r| r.is_success()));
    assert_eq!(record.attempt_number, 3);
    assert!(!record.has_pending_attempt());
    assert_eq!(env.engine().recover_pending().await?, 0);

    env.shutdown().await
}

#[tokio::test]
async fn endpoint_disabled_between_attempts_gets_no_more_requests() -> Result<()> {
    let mut env = TestEnv::builder().without_workers().build().await?;
    env.respond_with_status(500).await;

    let endpoint = env.register_local("/hook", ["*"]).await?;
    env.dispatch("order.created", json!({"id": 1})).await?;

    env.engine().update_endpoint(endpoint.id, EndpointUpdate::disable()).await?;

    env.start().await?;
    env.wait_for_stats(|s| s.skipped == 1).await?;
    env.wait_until_idle().await?;

    assert_eq!(env.requests_received().await, 0);
    assert_eq!(env.stats().await.attempts_started, 0);

    env.shutdown().await
}
