//! Termstream
//!
//! Runs terminal programs in PTYs and streams them to any number of clients.
//! Every subscriber gets a snapshot of the current screen first and then
//! live, gapless frames. Transport trouble is supervised per subscription:
//! a subscriber that keeps failing is severed and must resubscribe, and a
//! session whose subscribers are severed again right after coming back is
//! ended with a distinct exit reason.

pub mod broadcaster;
pub mod config;
pub mod error;
pub mod handlers;
pub mod input;
pub mod metrics;
pub mod multiplexer;
pub mod registry;
mod ring;
pub mod session;
pub mod stream;
pub mod supervisor;

#[cfg(test)]
mod test_helpers;

use axum::{
    Router,
    routing::{delete, get, post},
};
use std::sync::Arc;

use crate::config::AppConfig;
use crate::metrics::ServerMetrics;
use crate::multiplexer::MultiplexerBridge;
use crate::registry::SessionRegistry;

pub use crate::error::{MultiplexerError, SessionError};
pub use crate::session::{ExitReason, SessionInfo, SessionSource, SessionSpec, SessionStatus};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub bridge: MultiplexerBridge,
    pub metrics: Arc<ServerMetrics>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(config: AppConfig, bridge: MultiplexerBridge) -> Self {
        let config = Arc::new(config);
        let metrics = Arc::new(ServerMetrics::new());
        Self {
            registry: Arc::new(SessionRegistry::new(config.clone(), metrics.clone())),
            bridge,
            metrics,
            config,
        }
    }
}

/// All HTTP and WebSocket routes.
pub fn router(state: AppState) -> Router {
    use crate::handlers::*;

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/cleanup-exited", post(cleanup_exited))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/sessions/{id}/stream", get(stream::stream_handler))
        .route("/sessions/{id}/snapshot", get(get_snapshot))
        .route("/sessions/{id}/input", post(send_input))
        .route("/sessions/{id}/resize", post(resize_session))
        .route("/sessions/{id}/kill", post(kill_session))
        .route(
            "/multiplexer/sessions",
            get(list_mux_sessions).post(create_mux_session),
        )
        .route("/multiplexer/attach", post(attach_mux))
        .route("/multiplexer/sessions/{session}", delete(kill_mux_session))
        .route(
            "/multiplexer/sessions/{session}/windows/{window}",
            delete(kill_mux_window),
        )
        .route(
            "/multiplexer/sessions/{session}/windows/{window}/panes/{pane}",
            delete(kill_mux_pane),
        )
        .with_state(state)
}
