//! Integration tests that run the API in-process for code coverage
//!
//! These tests exercise the API handlers directly using axum-test against
//! an in-memory transport, so no registry access is needed.

mod common;

use axum_test::TestServer;
use common::ScriptedTransport;
use model_cache::{
    ApiError, ModelCache,
    api::routes::{AppState, create_router},
    metrics,
};
use serde_json::json;
use std::fs;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tempfile::TempDir;

// Global metrics handle - only initialize once per test process
static METRICS_HANDLE: OnceLock<metrics_exporter_prometheus::PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> metrics_exporter_prometheus::PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| metrics::setup_metrics().expect("Failed to setup metrics"))
        .clone()
}

const MANIFEST: &[&str] = &["config.json", "weights.bin"];

fn files() -> Vec<(&'static str, &'static [u8])> {
    vec![
        ("config.json", b"{}".as_slice()),
        ("weights.bin", b"weights-weights".as_slice()),
    ]
}

fn tiny_path(suffix: &str) -> String {
    format!("/downloads/model/{}{}", urlencoding::encode("org/tiny"), suffix)
}

/// Helper to create a test server with the API
async fn create_test_server() -> (TestServer, Arc<ScriptedTransport>, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let transport = ScriptedTransport::new("abc123", &files());

    let cache = Arc::new(ModelCache::new(
        common::settings(temp_dir.path()),
        transport.clone(),
        common::catalog(MANIFEST),
    ));

    let state = AppState {
        cache,
        prometheus_handle: get_metrics_handle(),
    };

    let app = create_router(state);
    let server = TestServer::try_new(app).expect("Failed to create test server");

    (server, transport, temp_dir)
}

async fn wait_until_complete(server: &TestServer) -> serde_json::Value {
    for _ in 0..200 {
        let body: serde_json::Value = server.get(&tiny_path("")).await.json();
        if body["state"] == "complete" || body["state"] == "failed" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("download did not complete");
}

#[tokio::test]
async fn test_health_endpoint() {
    let (server, _transport, temp_dir) = create_test_server().await;

    let response = server.get("/health").await;

    assert_eq!(response.status_code(), 200);

    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert!(body["timestamp"].is_string());
    assert_eq!(body["active_downloads"], 0);
    assert_eq!(body["cache_root"], temp_dir.path().to_string_lossy().as_ref());
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (server, _transport, _temp_dir) = create_test_server().await;

    let response = server.get("/metrics").await;

    assert_eq!(response.status_code(), 200);
}

#[tokio::test]
async fn test_list_includes_configured_repositories() {
    let (server, _transport, _temp_dir) = create_test_server().await;

    let response = server.get("/downloads").await;
    assert_eq!(response.status_code(), 200);

    let body: Vec<serde_json::Value> = response.json();
    assert_eq!(body.len(), 1);
    assert_eq!(body[0]["repository"]["identifier"], "org/tiny");
    assert_eq!(body[0]["state"], "not_started");
    assert_eq!(body[0]["progress"], 0.0);
}

#[tokio::test]
async fn test_start_download_and_fetch_path() {
    let (server, _transport, temp_dir) = create_test_server().await;

    let response = server.post(&tiny_path("/start")).await;
    assert_eq!(response.status_code(), 202);
    let body: serde_json::Value = response.json();
    assert_eq!(body["outcome"], "started");

    let status = wait_until_complete(&server).await;
    assert_eq!(status["state"], "complete");
    assert_eq!(status["progress"], 1.0);
    assert_eq!(status["commit"], "abc123");

    let response = server.get(&tiny_path("/path")).await;
    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    let expected = temp_dir.path().join("models--org--tiny/snapshots/abc123");
    assert_eq!(body["path"], expected.to_string_lossy().as_ref());

    // Second start is a no-op
    let response = server.post(&tiny_path("/start")).await;
    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert_eq!(body["outcome"], "already_complete");
}

#[tokio::test]
async fn test_get_unknown_repository_is_not_started() {
    let (server, _transport, _temp_dir) = create_test_server().await;

    let path = format!("/downloads/dataset/{}", urlencoding::encode("someone/data"));
    let response = server.get(&path).await;

    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert_eq!(body["state"], "not_started");
    assert_eq!(body["repository"]["kind"], "dataset");
}

#[tokio::test]
async fn test_invalid_repository_rejected() {
    let (server, _transport, _temp_dir) = create_test_server().await;

    let response = server
        .post(&format!("/downloads/widget/{}/start", urlencoding::encode("org/tiny")))
        .await;
    assert_eq!(response.status_code(), 400);

    let response = server
        .get(&format!("/downloads/model/{}", urlencoding::encode("org/../x")))
        .await;
    assert_eq!(response.status_code(), 400);
    let body: serde_json::Value = response.json();
    assert!(body["error"].is_string());
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_path_not_installed() {
    let (server, _transport, _temp_dir) = create_test_server().await;

    let response = server.get(&tiny_path("/path")).await;

    assert_eq!(response.status_code(), 404);
}

#[tokio::test]
async fn test_pause_without_active_download() {
    let (server, _transport, _temp_dir) = create_test_server().await;

    let response = server.post(&tiny_path("/pause")).await;

    assert_eq!(response.status_code(), 409);
}

#[tokio::test]
async fn test_delete_download() {
    let (server, _transport, temp_dir) = create_test_server().await;

    server.post(&tiny_path("/start")).await;
    wait_until_complete(&server).await;

    let response = server.delete(&tiny_path("")).await;
    assert_eq!(response.status_code(), 204);
    assert!(!temp_dir.path().join("models--org--tiny").exists());

    let body: serde_json::Value = server.get(&tiny_path("")).await.json();
    assert_eq!(body["state"], "not_started");

    // Deleting again is harmless
    let response = server.delete(&tiny_path("")).await;
    assert_eq!(response.status_code(), 204);
}

#[tokio::test]
async fn test_check_update() {
    let (server, transport, _temp_dir) = create_test_server().await;

    // Nothing installed yet
    let response = server.post(&tiny_path("/check-update")).await;
    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert_eq!(body["has_update"], false);

    server.post(&tiny_path("/start")).await;
    wait_until_complete(&server).await;

    transport.set_commit("def456");
    let body: serde_json::Value = server.post(&tiny_path("/check-update")).await.json();
    assert_eq!(body["has_update"], true);

    let status: serde_json::Value = server.get(&tiny_path("")).await.json();
    assert_eq!(status["has_update"], true);
}

#[tokio::test]
async fn test_check_update_unresolvable() {
    let (server, transport, _temp_dir) = create_test_server().await;

    server.post(&tiny_path("/start")).await;
    wait_until_complete(&server).await;

    transport.fail_resolve();
    let response = server.post(&tiny_path("/check-update")).await;

    assert_eq!(response.status_code(), 404);
}

#[tokio::test]
async fn test_validate_directory() {
    let (server, _transport, _temp_dir) = create_test_server().await;
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("config.json"), "{}").unwrap();

    // No marker yet
    let response = server
        .post("/validate")
        .json(&json!({ "path": dir.path() }))
        .await;
    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert_eq!(body["valid"], false);
    assert!(body["reason"].as_str().unwrap().contains("marker"));

    fs::write(dir.path().join(".success"), "").unwrap();
    let body: serde_json::Value = server
        .post("/validate")
        .json(&json!({ "path": dir.path(), "manifest": ["config.json"] }))
        .await
        .json();
    assert_eq!(body["valid"], true);
    assert!(body.get("reason").is_none());

    let body: serde_json::Value = server
        .post("/validate")
        .json(&json!({ "path": dir.path(), "manifest": ["config.json", "weights.bin"] }))
        .await
        .json();
    assert_eq!(body["valid"], false);
    assert!(body["reason"].as_str().unwrap().contains("weights.bin"));
}

#[tokio::test]
async fn test_validate_against_family() {
    let (server, _transport, _temp_dir) = create_test_server().await;
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join(".success"), "").unwrap();

    let body: serde_json::Value = server
        .post("/validate")
        .json(&json!({ "path": dir.path(), "manifest": "qwen2.5-omni" }))
        .await
        .json();
    assert_eq!(body["valid"], false);

    let response = server
        .post("/validate")
        .json(&json!({ "path": dir.path(), "manifest": "no-such-family" }))
        .await;
    assert_eq!(response.status_code(), 400);
}

#[tokio::test]
async fn test_reset_cache_root() {
    let (server, _transport, _temp_dir) = create_test_server().await;
    let new_root = TempDir::new().unwrap();

    server.post(&tiny_path("/start")).await;
    wait_until_complete(&server).await;

    let response = server
        .post("/reset")
        .json(&json!({ "cache_root": new_root.path() }))
        .await;
    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert_eq!(body["cache_root"], new_root.path().to_string_lossy().as_ref());

    // Fresh root, nothing installed
    let response = server.get(&tiny_path("/path")).await;
    assert_eq!(response.status_code(), 404);

    let body: serde_json::Value = server.get("/health").await.json();
    assert_eq!(body["cache_root"], new_root.path().to_string_lossy().as_ref());
}

#[tokio::test]
async fn test_reset_rejects_empty_root() {
    let (server, _transport, _temp_dir) = create_test_server().await;

    let response = server.post("/reset").json(&json!({ "cache_root": "" })).await;

    assert_eq!(response.status_code(), 400);
}

#[tokio::test]
async fn test_error_conflict_response() {
    use axum::response::IntoResponse;

    let response = ApiError::Conflict("already running".to_string()).into_response();

    assert_eq!(response.status(), 409);
}
