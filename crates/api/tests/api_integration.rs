//! Integration tests for the API server.

use std::sync::OnceLock;
use std::time::Duration;

use api::Services;
use api::config::{Config, parse_participants};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use broker::InMemoryBroker;
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn test_config() -> Config {
    Config {
        max_deliveries: 3,
        workers_per_queue: 1,
        participants: parse_participants("workout,nutrition,notification", 1),
        ..Config::default()
    }
}

async fn setup() -> (axum::Router, Services) {
    let services = api::start_services(&test_config(), InMemoryBroker::new())
        .await
        .unwrap();
    let app = api::create_app(services.state.clone(), get_metrics_handle());
    (app, services)
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

fn register_request(email: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/users")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::to_string(&serde_json::json!({ "email": email })).unwrap(),
        ))
        .unwrap()
}

fn saga_request(handle: &str) -> Request<Body> {
    Request::builder()
        .uri(format!("/users/{handle}/saga"))
        .body(Body::empty())
        .unwrap()
}

async fn wait_for_state(app: &axum::Router, handle: &str, expected: &str) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (status, json) = send(app, saga_request(handle)).await;
        assert_eq!(status, StatusCode::OK);
        if json["state"] == expected {
            return json;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "saga {handle} stuck in {}",
            json["state"]
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_health_check() {
    let (app, services) = setup().await;

    let (status, json) = send(
        &app,
        Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["participants"].as_array().unwrap().len(), 3);

    services.shutdown().await;
}

#[tokio::test]
async fn test_register_user_replicates() {
    let (app, services) = setup().await;

    let (status, json) = send(&app, register_request("  Alice@Example.com ")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["email"], "alice@example.com");
    let handle = json["handle"].as_str().unwrap().to_string();

    let saga = wait_for_state(&app, &handle, "Replicated").await;
    assert_eq!(saga["committed"].as_array().unwrap().len(), 3);
    assert!(saga["failure_reason"].is_null());

    services.shutdown().await;
}

#[tokio::test]
async fn test_register_invalid_email() {
    let (app, services) = setup().await;

    let (status, json) = send(&app, register_request("not-an-email")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("not-an-email"));

    services.shutdown().await;
}

#[tokio::test]
async fn test_register_duplicate_email() {
    let (app, services) = setup().await;

    let (status, _) = send(&app, register_request("bob@example.com")).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, json) = send(&app, register_request("BOB@example.com")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(json["error"].is_string());

    services.shutdown().await;
}

#[tokio::test]
async fn test_register_malformed_body() {
    let (app, services) = setup().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/users")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"mail": "x@example.com"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(response.status().is_client_error());

    services.shutdown().await;
}

#[tokio::test]
async fn test_failing_participant_rolls_back() {
    let (app, services) = setup().await;
    let (_, nutrition) = services
        .replicas
        .iter()
        .find(|(id, _)| id.as_str() == "nutrition")
        .unwrap();
    nutrition.set_reject_writes(Some("quota exceeded")).await;

    let (status, json) = send(&app, register_request("carol@example.com")).await;
    assert_eq!(status, StatusCode::CREATED);
    let handle = json["handle"].as_str().unwrap().to_string();

    let saga = wait_for_state(&app, &handle, "RolledBack").await;
    assert!(saga["failure_reason"].is_string());
    assert_eq!(saga["compensated"].as_array().unwrap().len(), 4);

    // The email is free again once identity compensated.
    nutrition.set_reject_writes(None).await;
    let (status, _) = send(&app, register_request("carol@example.com")).await;
    assert_eq!(status, StatusCode::CREATED);

    services.shutdown().await;
}

#[tokio::test]
async fn test_unknown_saga_returns_404() {
    let (app, services) = setup().await;

    let (status, json) = send(&app, saga_request(&uuid::Uuid::new_v4().to_string())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("No saga found"));

    services.shutdown().await;
}

#[tokio::test]
async fn test_malformed_handle_returns_400() {
    let (app, services) = setup().await;

    let response = app.clone().oneshot(saga_request("not-a-uuid")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    services.shutdown().await;
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, services) = setup().await;

    let (status, _) = send(&app, register_request("dave@example.com")).await;
    assert_eq!(status, StatusCode::CREATED);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("users_registered_total"));

    services.shutdown().await;
}
