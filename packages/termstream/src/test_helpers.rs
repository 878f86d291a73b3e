use axum::{Router, body::Body, http::Request, response::Response};
use std::sync::Arc;
use tower::ServiceExt;

use crate::AppState;
use crate::config::AppConfig;
use crate::metrics::ServerMetrics;
use crate::multiplexer::MultiplexerBridge;
use crate::multiplexer::fake::FakeMux;
use crate::registry::SessionRegistry;

/// `AppState` with default config and a fake multiplexer holding one
/// session named `work`.
pub fn test_app_state() -> AppState {
    let config = Arc::new(AppConfig::default());
    let metrics = Arc::new(ServerMetrics::new());
    AppState {
        registry: Arc::new(SessionRegistry::new(config.clone(), metrics.clone())),
        bridge: MultiplexerBridge::new(Arc::new(FakeMux::with_session("work"))),
        metrics,
        config,
    }
}

pub async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

pub fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub async fn body_json(resp: Response) -> serde_json::Value {
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}
