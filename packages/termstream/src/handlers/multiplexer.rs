use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::MultiplexerError;
use crate::multiplexer::{AttachRequest, MuxListing, MuxTarget};
use crate::session::SessionInfo;

pub async fn list_mux_sessions(State(state): State<AppState>) -> Json<MuxListing> {
    Json(state.bridge.list_entities().await)
}

#[derive(Debug, Deserialize)]
pub struct CreateMuxSessionRequest {
    name: String,
    #[serde(default)]
    layout: Option<String>,
}

pub async fn create_mux_session(
    State(state): State<AppState>,
    Json(req): Json<CreateMuxSessionRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), MultiplexerError> {
    state
        .bridge
        .create(&req.name, req.layout.as_deref())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "name": req.name })),
    ))
}

/// Attach to a session, window or pane; returns the new native session.
pub async fn attach_mux(
    State(state): State<AppState>,
    Json(req): Json<AttachRequest>,
) -> Result<(StatusCode, Json<SessionInfo>), MultiplexerError> {
    let info = state.bridge.attach(&state.registry, req).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

pub async fn kill_mux_session(
    State(state): State<AppState>,
    Path(session): Path<String>,
) -> Result<StatusCode, MultiplexerError> {
    state.bridge.kill(&MuxTarget::session(session)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn kill_mux_window(
    State(state): State<AppState>,
    Path((session, window)): Path<(String, u32)>,
) -> Result<StatusCode, MultiplexerError> {
    let target = MuxTarget {
        session,
        window: Some(window),
        pane: None,
    };
    state.bridge.kill(&target).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn kill_mux_pane(
    State(state): State<AppState>,
    Path((session, window, pane)): Path<(String, u32, u32)>,
) -> Result<StatusCode, MultiplexerError> {
    let target = MuxTarget {
        session,
        window: Some(window),
        pane: Some(pane),
    };
    state.bridge.kill(&target).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use crate::AppState;
    use crate::multiplexer::MultiplexerBridge;
    use crate::test_helpers::{body_json, empty_request, json_request, send, test_app_state};
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_list_tree() {
        let app = crate::router(test_app_state());
        let resp = send(&app, empty_request("GET", "/multiplexer/sessions")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["available"], true);
        assert_eq!(json["kind"], "fake");
        assert_eq!(json["sessions"][0]["name"], "work");
        assert_eq!(json["sessions"][0]["windows"][0]["panes"][0]["index"], 0);
    }

    #[tokio::test]
    async fn test_disabled_multiplexer() {
        let state = AppState {
            bridge: MultiplexerBridge::disabled(),
            ..test_app_state()
        };
        let app = crate::router(state);

        let resp = send(&app, empty_request("GET", "/multiplexer/sessions")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["available"], false);
        assert!(json["sessions"].as_array().unwrap().is_empty());

        let resp = send(
            &app,
            json_request("POST", "/multiplexer/attach", json!({ "session": "work" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(resp).await["code"], "multiplexer_unavailable");
    }

    #[tokio::test]
    async fn test_attach_returns_native_session() {
        let state = test_app_state();
        let app = crate::router(state.clone());
        let resp = send(
            &app,
            json_request(
                "POST",
                "/multiplexer/attach",
                json!({ "session": "work", "window": 0, "pane": 0 }),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let json = body_json(resp).await;
        assert_eq!(json["source"]["kind"], "multiplexer");
        assert_eq!(json["source"]["target"], "work:0.0");

        let id = json["id"].as_str().unwrap();
        let resp = send(&app, empty_request("GET", &format!("/sessions/{}", id))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        state.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_attach_missing_target() {
        let app = crate::router(test_app_state());
        let resp = send(
            &app,
            json_request("POST", "/multiplexer/attach", json!({ "session": "nope" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["code"], "target_not_found");
    }

    #[tokio::test]
    async fn test_create_and_kill() {
        let app = crate::router(test_app_state());
        let resp = send(
            &app,
            json_request("POST", "/multiplexer/sessions", json!({ "name": "scratch" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = send(&app, empty_request("DELETE", "/multiplexer/sessions/scratch")).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        // The multiplexer's own error text is surfaced
        let resp = send(&app, empty_request("DELETE", "/multiplexer/sessions/scratch")).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(resp).await;
        assert!(json["error"].as_str().unwrap().contains("can't find session"));
    }
}
