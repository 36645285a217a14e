//! Service configuration driving a real engine.

use std::sync::Arc;

use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use hookrelay::Config;
use hookrelay_core::{NewEndpoint, TestClock};
use hookrelay_delivery::{storage::mock::MockDeliveryStorage, DeliveryEngine};
use serde_json::json;

fn config(toml: &str) -> Config {
    Config::from_figment(
        Figment::new().merge(Serialized::defaults(Config::default())).merge(Toml::string(toml)),
    )
    .unwrap()
}

#[tokio::test]
async fn configured_engine_starts_dispatches_and_stops() {
    let config = config("worker_count = 3\nqueue_capacity = 64\nshutdown_timeout_seconds = 5");
    let storage = MockDeliveryStorage::new();

    let mut engine = DeliveryEngine::new(
        Arc::new(storage.clone()),
        config.to_delivery_config(),
        Arc::new(TestClock::new()),
    )
    .unwrap();

    engine.start().await.unwrap();
    assert_eq!(engine.stats().await.active_workers, 3);

    engine
        .register_endpoint(NewEndpoint::new("https://good.example/hook", ["invoice.paid"]))
        .await
        .unwrap();
    let ids = engine.dispatch("order.created", json!({"id": 1})).await.unwrap();
    assert!(ids.is_empty());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn recovery_respects_configured_batch_size() {
    let config = config("recovery_batch_size = 2");
    let storage = MockDeliveryStorage::new();
    let engine = DeliveryEngine::new(
        Arc::new(storage.clone()),
        config.to_delivery_config(),
        Arc::new(TestClock::new()),
    )
    .unwrap();

    let endpoint = engine
        .register_endpoint(NewEndpoint::new("https://good.example/hook", ["*"]))
        .await
        .unwrap();
    for _ in 0..3 {
        engine.dispatch("order.created", json!({"id": 1})).await.unwrap();
    }
    assert_eq!(storage.records_for_endpoint(endpoint.id).await.len(), 3);

    assert_eq!(engine.recover_pending().await.unwrap(), 2);

    engine.shutdown().await.unwrap();
}
