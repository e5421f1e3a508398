//! End-to-end HTTP frontend scenarios (`spec.md` §8, S1-S4), driven through the full
//! `axum::Router` built by [`mlserve::http_router`] rather than calling handlers directly.

use std::{sync::Arc, time::Duration};

use axum::body::{to_bytes, Body};
use http::{Request, StatusCode};
use mlserve::{
    http_router,
    query::{
        processor::{LoopbackDispatcher, QueryProcessor},
        ApplicationRecord, InputType, VersionedModelId,
    },
    AppRegistry, HttpState, MetricsConfig, MetricsRegistry,
};
use serde_json::{json, Value};
use tower::ServiceExt;

fn register_alpha(registry: &Arc<AppRegistry>, processor: &Arc<QueryProcessor>, default_output: f64, latency_slo_micros: u64) {
    registry.install(ApplicationRecord {
        name: "alpha".into(),
        candidate_models: vec![VersionedModelId {
            name: "m1".into(),
            version: 1,
        }],
        input_type: InputType::F64,
        policy: "default_output".into(),
        default_output,
        latency_slo_micros,
    });
    processor.init_application_state("alpha", default_output);
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn s1_happy_path_returns_worker_output() {
    let metrics = MetricsRegistry::new(MetricsConfig::default());
    let dispatcher = Arc::new(LoopbackDispatcher::new(42.0));
    let processor = Arc::new(QueryProcessor::new(dispatcher, &metrics).unwrap());
    let registry = AppRegistry::new();
    register_alpha(&registry, &processor, 7.0, 20_000);
    let app = http_router(HttpState::new(registry, processor), metrics);

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/alpha/predict")
                .header("content-type", "application/json")
                .body(Body::from(json!({"uid": "u1", "input": [1.0, 2.0, 3.0]}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["output"], 42.0);
    assert_eq!(body["default"], false);
    assert!(body["query_id"].is_u64());
}

#[tokio::test(start_paused = true)]
async fn s2_deadline_miss_falls_back_to_default_output() {
    let metrics = MetricsRegistry::new(MetricsConfig::default());
    let dispatcher = Arc::new(LoopbackDispatcher::with_delay(42.0, Duration::from_millis(50)));
    let processor = Arc::new(QueryProcessor::new(dispatcher, &metrics).unwrap());
    let registry = AppRegistry::new();
    register_alpha(&registry, &processor, 7.0, 20_000);
    let app = http_router(HttpState::new(registry, processor), metrics);

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/alpha/predict")
                .header("content-type", "application/json")
                .body(Body::from(json!({"uid": "u1", "input": [1.0, 2.0, 3.0]}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["output"], 7.0);
    assert_eq!(body["default"], true);
}

#[tokio::test]
async fn s3_schema_violation_yields_json_error() {
    let metrics = MetricsRegistry::new(MetricsConfig::default());
    let dispatcher = Arc::new(LoopbackDispatcher::new(42.0));
    let processor = Arc::new(QueryProcessor::new(dispatcher, &metrics).unwrap());
    let registry = AppRegistry::new();
    register_alpha(&registry, &processor, 7.0, 20_000);
    let app = http_router(HttpState::new(registry, processor), metrics);

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/alpha/predict")
                .header("content-type", "application/json")
                .body(Body::from(json!({"uid": "u1", "input": ["abc"]}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = body_json(resp).await;
    assert_eq!(body["error"], "Json error");
    assert!(body["cause"].as_str().is_some_and(|s| !s.is_empty()));
}

#[tokio::test]
async fn malformed_json_syntax_yields_json_error() {
    let metrics = MetricsRegistry::new(MetricsConfig::default());
    let dispatcher = Arc::new(LoopbackDispatcher::new(42.0));
    let processor = Arc::new(QueryProcessor::new(dispatcher, &metrics).unwrap());
    let registry = AppRegistry::new();
    register_alpha(&registry, &processor, 7.0, 20_000);
    let app = http_router(HttpState::new(registry, processor), metrics);

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/alpha/predict")
                .header("content-type", "application/json")
                .body(Body::from("{not valid json"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = body_json(resp).await;
    assert_eq!(body["error"], "Json error");
    assert!(body["cause"].as_str().is_some_and(|s| !s.is_empty()));
}

#[tokio::test]
async fn missing_required_field_yields_json_error() {
    let metrics = MetricsRegistry::new(MetricsConfig::default());
    let dispatcher = Arc::new(LoopbackDispatcher::new(42.0));
    let processor = Arc::new(QueryProcessor::new(dispatcher, &metrics).unwrap());
    let registry = AppRegistry::new();
    register_alpha(&registry, &processor, 7.0, 20_000);
    let app = http_router(HttpState::new(registry, processor), metrics);

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/alpha/predict")
                .header("content-type", "application/json")
                .body(Body::from(json!({"input": [1.0, 2.0, 3.0]}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = body_json(resp).await;
    assert_eq!(body["error"], "Json error");
    assert!(body["cause"].as_str().is_some_and(|s| !s.is_empty()));
}

#[tokio::test]
async fn s4_unknown_app_is_404() {
    let metrics = MetricsRegistry::new(MetricsConfig::default());
    let dispatcher = Arc::new(LoopbackDispatcher::new(42.0));
    let processor = Arc::new(QueryProcessor::new(dispatcher, &metrics).unwrap());
    let registry = AppRegistry::new();
    let app = http_router(HttpState::new(registry, processor), metrics);

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/beta/predict")
                .header("content-type", "application/json")
                .body(Body::from(json!({"uid": "u1", "input": [1.0]}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
