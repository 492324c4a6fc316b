//! HTTP API integration tests.
//!
//! Serves the real router over a local socket, backed by the in-memory
//! store and cluster.

mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use chrono::Utc;
use common::{Harness, MODEL};
use mserve_control_plane::{api, serving::model::EndpointStatus, state::AppState};
use mserve_id::EndpointId;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower::ServiceExt;

struct ApiHarness {
    base_url: String,
    client: reqwest::Client,
    inner: Harness,
}

impl ApiHarness {
    async fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info,mserve_control_plane=debug".into()),
            )
            .with_test_writer()
            .try_init();

        let inner = Harness::new();
        let state = AppState::new(inner.orchestrator.clone(), None);
        let app = api::create_router(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
            inner,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn deploy(&self, route: &str) -> Value {
        let response = self
            .client
            .post(self.url("/v1/endpoints"))
            .header("X-Actor-Id", "alice")
            .json(&json!({
                "name": "llama chat",
                "route": route,
                "model_ref": MODEL,
                "serving_framework": "raw",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);
        let body: Value = response.json().await.unwrap();
        body["data"].clone()
    }
}

#[tokio::test]
async fn test_health_endpoints() {
    let h = ApiHarness::new().await;

    for path in ["/healthz", "/readyz"] {
        let response = h.client.get(h.url(path)).send().await.unwrap();
        assert_eq!(response.status(), 200, "{path}");
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["status"], "ok", "{path}");
    }

    let response = h.client.get(h.url("/livez")).send().await.unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_deploy_returns_success_envelope() {
    let h = ApiHarness::new().await;

    let response = h
        .client
        .post(h.url("/v1/endpoints"))
        .header("X-Actor-Id", "alice")
        .header("X-Request-Id", "trace-42")
        .json(&json!({
            "name": "llama chat",
            "route": "chat/llama/",
            "model_ref": MODEL,
            "max_concurrent_requests": 48,
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "success");
    assert_eq!(body["request_id"], "trace-42");
    assert!(body.get("code").is_none());

    let data = &body["data"];
    assert!(data["id"].as_str().unwrap().starts_with("ep_"));
    assert_eq!(data["route"], "/chat/llama");
    assert_eq!(data["status"], "healthy");
    assert_eq!(data["created_by"], "user:alice");
    assert_eq!(
        data["deployment_spec"]["runtime"]["max_concurrent_requests"],
        48
    );
    assert!(data.get("backup_config").is_none());
}

#[tokio::test]
async fn test_deploy_validation_errors() {
    let h = ApiHarness::new().await;

    let cases = [
        json!({ "name": "x", "route": "/a/../b", "model_ref": MODEL }),
        json!({ "name": "x", "route": "/a", "model_ref": "unknown-model" }),
        json!({ "name": "", "route": "/a", "model_ref": MODEL }),
        json!({ "name": "x", "route": "/a", "model_ref": MODEL, "min_replicas": 3, "max_replicas": 1 }),
    ];
    for case in cases {
        let response = h
            .client
            .post(h.url("/v1/endpoints"))
            .json(&case)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400, "{case}");
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["status"], "fail");
        assert_eq!(body["code"], "validation_error");
        assert_eq!(body["retryable"], false);
        assert!(body["data"].is_null());
    }

    let response = h
        .client
        .post(h.url("/v1/endpoints"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    assert!(h.inner.orchestrator.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_get_and_list() {
    let h = ApiHarness::new().await;
    let a = h.deploy("/chat/a").await;
    h.deploy("/chat/b").await;

    let id = a["id"].as_str().unwrap();
    let response = h
        .client
        .get(h.url(&format!("/v1/endpoints/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"]["id"], id);
    assert_eq!(body["message"], "endpoint is healthy");

    let response = h.client.get(h.url("/v1/endpoints")).send().await.unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"]["items"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_unknown_and_malformed_ids() {
    let h = ApiHarness::new().await;

    let missing = EndpointId::new();
    let response = h
        .client
        .get(h.url(&format!("/v1/endpoints/{missing}")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "not_found");

    let response = h
        .client
        .delete(h.url("/v1/endpoints/not-an-id"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_redeploy_with_and_without_body() {
    let h = ApiHarness::new().await;
    let endpoint = h.deploy("/chat/llama").await;
    let id = endpoint["id"].as_str().unwrap();

    let response = h
        .client
        .post(h.url(&format!("/v1/endpoints/{id}/redeploy")))
        .json(&json!({ "max_output_tokens": 2048 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"]["deployment_spec"]["runtime"]["max_output_tokens"], 2048);

    // An empty body re-applies the stored spec.
    let response = h
        .client
        .post(h.url(&format!("/v1/endpoints/{id}/redeploy")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"]["deployment_spec"]["runtime"]["max_output_tokens"], 2048);
}

#[tokio::test]
async fn test_locked_endpoint_returns_conflict() {
    let h = ApiHarness::new().await;
    let endpoint = h.deploy("/chat/llama").await;
    let id = EndpointId::parse(endpoint["id"].as_str().unwrap()).unwrap();

    let mut locked = h.inner.store.snapshot(&id).unwrap();
    locked.status = EndpointStatus::Deploying;
    locked.backup_config = Some(locked.desired.clone());
    locked.updated_at = Utc::now();
    h.inner.store.put(locked);

    for request in [
        h.client.post(h.url(&format!("/v1/endpoints/{id}/redeploy"))),
        h.client.delete(h.url(&format!("/v1/endpoints/{id}"))),
        h.client.post(h.url(&format!("/v1/endpoints/{id}/unlock"))),
    ] {
        let response = request.send().await.unwrap();
        assert_eq!(response.status(), 409);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["code"], "already_in_progress");
    }
}

#[tokio::test]
async fn test_delete_then_not_found() {
    let h = ApiHarness::new().await;
    let endpoint = h.deploy("/chat/llama").await;
    let id = endpoint["id"].as_str().unwrap();
    let url = h.url(&format!("/v1/endpoints/{id}"));

    let response = h.client.delete(&url).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"]["id"], id);

    let response = h.client.delete(&url).send().await.unwrap();
    assert_eq!(response.status(), 404);
    assert!(h.inner.cluster.resources().is_empty());
}

#[tokio::test]
async fn test_rejects_oversized_actor() {
    let h = ApiHarness::new().await;

    let response = h
        .client
        .get(h.url("/v1/endpoints"))
        .header("X-Actor-Id", "a".repeat(200))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test(start_paused = true)]
async fn redeploy_finishes_after_caller_disconnects() {
    let h = Harness::new();
    let endpoint = h.deploy("/chat/llama").await;
    let state = AppState::new(h.orchestrator.clone(), None);
    let app = api::create_router(state.clone());
    h.cluster.set_deletion_delay(Duration::from_secs(10));

    let request = Request::builder()
        .method("POST")
        .uri(format!("/v1/endpoints/{}/redeploy", endpoint.id))
        .header("content-type", "application/json")
        .header("x-actor-id", "alice")
        .body(Body::from(r#"{"max_concurrent_requests": 64}"#))
        .unwrap();

    // The caller gives up while old resources are still terminating.
    let abandoned = tokio::time::timeout(Duration::from_secs(1), app.oneshot(request)).await;
    assert!(abandoned.is_err(), "redeploy should still be confirming deletion");

    state.operations().close();
    state.operations().wait().await;

    let row = h.store.snapshot(&endpoint.id).unwrap();
    assert_eq!(row.status, EndpointStatus::Healthy);
    assert_eq!(row.backup_config, None);
    assert_eq!(row.desired.deployment_spec.runtime.max_concurrent_requests, 64);
    assert!(h.cluster.exists(&h.deployment_ref(&endpoint)));
}
