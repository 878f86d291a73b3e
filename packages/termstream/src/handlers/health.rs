use axum::{Json, extract::State, response::IntoResponse};

use crate::AppState;
use crate::metrics;

/// Health check endpoint - returns server status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let running = state.registry.running_count().await as u64;
    let snapshot = state.metrics.snapshot();

    Json(metrics::HealthStatus {
        status: "healthy".to_string(),
        sessions: metrics::SessionHealth {
            total: state.registry.len() as u64,
            running,
        },
        subscriptions: snapshot.subscriptions.active,
        multiplexer_available: state.bridge.is_available().await,
        uptime_secs: snapshot.uptime_secs,
    })
}

/// Metrics endpoint - returns detailed server metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

#[cfg(test)]
mod tests {
    use crate::test_helpers::{body_json, empty_request, json_request, send, test_app_state};
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_health() {
        let app = crate::router(test_app_state());
        let resp = send(&app, empty_request("GET", "/health")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["sessions"]["total"], 0);
        assert_eq!(json["multiplexer_available"], true);
    }

    #[tokio::test]
    async fn test_metrics_count_sessions() {
        let state = test_app_state();
        let app = crate::router(state.clone());
        let resp = send(
            &app,
            json_request("POST", "/sessions", json!({ "command": ["/bin/sh", "-c", "sleep 5"] })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = send(&app, empty_request("GET", "/metrics")).await;
        let json = body_json(resp).await;
        assert_eq!(json["sessions"]["created"], 1);
        assert!(json["uptime_secs"].is_u64());
        state.registry.shutdown().await;
    }
}
