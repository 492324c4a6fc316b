//! Probe endpoints for the load balancer and kubelet.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct Probe {
    /// `ok` or `unavailable`.
    pub status: &'static str,
    pub version: &'static str,
    /// Postgres reachability; omitted on `/healthz` and for in-memory stores.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<String>,
}

impl Probe {
    fn ok() -> Self {
        Self {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            store: None,
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(|| async { StatusCode::OK }))
}

async fn healthz() -> Json<Probe> {
    Json(Probe::ok())
}

/// 503 while the endpoint store cannot be reached.
async fn readyz(State(state): State<AppState>) -> (StatusCode, Json<Probe>) {
    let Some(db) = state.db() else {
        return (StatusCode::OK, Json(Probe::ok()));
    };

    match db.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(Probe {
                store: Some("ok".to_string()),
                ..Probe::ok()
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(Probe {
                    status: "unavailable",
                    store: Some(e.to_string()),
                    ..Probe::ok()
                }),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_healthz_skips_store() {
        let Json(probe) = healthz().await;
        assert_eq!(probe.status, "ok");
        assert!(probe.store.is_none());
    }

    #[test]
    fn test_probe_serializes_without_store() {
        let value = serde_json::to_value(Probe::ok()).unwrap();
        assert_eq!(value["status"], "ok");
        assert!(value.get("store").is_none());
    }
}
