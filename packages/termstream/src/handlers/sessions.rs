use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio_util::codec::Encoder;
use virtual_terminal::FrameCodec;

use crate::AppState;
use crate::error::SessionError;
use crate::input::InputRequest;
use crate::session::{SessionInfo, SessionSpec};

/// A command as an argv array, or a single string. Strings containing
/// whitespace run through `/bin/sh -c`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Argv(Vec<String>),
    Line(String),
}

impl CommandLine {
    fn into_argv(self) -> Vec<String> {
        match self {
            CommandLine::Argv(argv) => argv,
            CommandLine::Line(line) => {
                let line = line.trim();
                if line.is_empty() {
                    Vec::new()
                } else if line.contains(char::is_whitespace) {
                    vec!["/bin/sh".to_string(), "-c".to_string(), line.to_string()]
                } else {
                    vec![line.to_string()]
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    command: Option<CommandLine>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    cols: Option<i64>,
    #[serde(default)]
    rows: Option<i64>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

fn checked_size(cols: Option<i64>, rows: Option<i64>) -> Result<(Option<u16>, Option<u16>), SessionError> {
    let check = |v: Option<i64>| match v {
        None => Ok(None),
        Some(n) => u16::try_from(n)
            .ok()
            .filter(|n| *n > 0)
            .map(Some)
            .ok_or(SessionError::InvalidSize {
                cols: cols.unwrap_or(0),
                rows: rows.unwrap_or(0),
            }),
    };
    Ok((check(cols)?, check(rows)?))
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionInfo>), SessionError> {
    let (cols, rows) = checked_size(req.cols, req.rows)?;
    let spec = SessionSpec {
        command: req.command.map(CommandLine::into_argv).unwrap_or_default(),
        cwd: req.cwd,
        cols,
        rows,
        name: req.name,
        env: req.env.into_iter().collect(),
        ..Default::default()
    };
    let info = state.registry.create_session(spec).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.registry.list().await)
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(name_or_id): Path<String>,
) -> Result<Json<SessionInfo>, SessionError> {
    Ok(Json(state.registry.find(&name_or_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct SnapshotQuery {
    #[serde(default)]
    format: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CursorPosition {
    row: u16,
    col: u16,
}

#[derive(Debug, Serialize)]
pub struct SnapshotResponse {
    seq: u64,
    cols: u16,
    rows: u16,
    cursor: CursorPosition,
    data: String,
}

/// Current snapshot without subscribing. `?format=binary` returns the
/// encoded wire message instead of JSON.
pub async fn get_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<SnapshotQuery>,
) -> Result<Response, SessionError> {
    let snapshot = state.registry.snapshot(&id).await?;

    if query.format.as_deref() == Some("binary") {
        let mut buf = BytesMut::new();
        FrameCodec::new().encode(&snapshot, &mut buf)?;
        return Ok((
            [(header::CONTENT_TYPE, "application/octet-stream")],
            buf.freeze(),
        )
            .into_response());
    }

    Ok(Json(SnapshotResponse {
        seq: snapshot.seq,
        cols: snapshot.cols,
        rows: snapshot.rows,
        cursor: CursorPosition {
            row: snapshot.cursor.0,
            col: snapshot.cursor.1,
        },
        data: String::from_utf8_lossy(&snapshot.payload).into_owned(),
    })
    .into_response())
}

pub async fn send_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<InputRequest>,
) -> Result<Json<serde_json::Value>, SessionError> {
    let written = state.registry.send_input(&id, &input).await?;
    Ok(Json(serde_json::json!({ "written": written })))
}

#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    cols: i64,
    rows: i64,
}

pub async fn resize_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> Result<Json<SessionInfo>, SessionError> {
    Ok(Json(state.registry.resize(&id, req.cols, req.rows).await?))
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KillSignal {
    Sigterm,
    Sigkill,
    Sigint,
}

impl KillSignal {
    fn as_str(self) -> &'static str {
        match self {
            KillSignal::Sigterm => "SIGTERM",
            KillSignal::Sigkill => "SIGKILL",
            KillSignal::Sigint => "SIGINT",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct KillRequest {
    #[serde(default)]
    signal: Option<KillSignal>,
}

/// Body is optional; an empty body sends SIGTERM.
pub async fn kill_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let req = if body.is_empty() {
        KillRequest::default()
    } else {
        match serde_json::from_slice::<KillRequest>(&body) {
            Ok(req) => req,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": e.to_string(), "code": "invalid_request" })),
                )
                    .into_response();
            }
        }
    };

    match state
        .registry
        .kill(&id, req.signal.map(KillSignal::as_str))
        .await
    {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, SessionError> {
    state.registry.delete_exited(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn cleanup_exited(State(state): State<AppState>) -> Json<serde_json::Value> {
    let removed = state.registry.cleanup_exited(None).await;
    Json(serde_json::json!({ "removed": removed }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{body_json, empty_request, json_request, send, test_app_state};
    use serde_json::json;
    use std::time::Duration;

    async fn wait_for_status(app: &axum::Router, id: &str, status: &str) -> serde_json::Value {
        for _ in 0..100 {
            let resp = send(app, empty_request("GET", &format!("/sessions/{}", id))).await;
            let json = body_json(resp).await;
            if json["status"] == status {
                return json;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("session {} never reached {}", id, status);
    }

    async fn create(app: &axum::Router, body: serde_json::Value) -> String {
        let resp = send(app, json_request("POST", "/sessions", body)).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        body_json(resp).await["id"].as_str().unwrap().to_string()
    }

    #[test]
    fn test_command_line_forms() {
        assert_eq!(
            CommandLine::Line("htop".into()).into_argv(),
            vec!["htop".to_string()]
        );
        assert_eq!(
            CommandLine::Line("echo hi".into()).into_argv(),
            vec!["/bin/sh".to_string(), "-c".into(), "echo hi".into()]
        );
        assert!(CommandLine::Line("  ".into()).into_argv().is_empty());
        assert_eq!(
            CommandLine::Argv(vec!["ls".into(), "-la".into()]).into_argv(),
            vec!["ls".to_string(), "-la".into()]
        );
    }

    #[tokio::test]
    async fn test_create_list_get() {
        let state = test_app_state();
        let app = crate::router(state.clone());
        let id = create(
            &app,
            json!({ "command": ["/bin/sh", "-c", "sleep 5"], "cols": 100, "rows": 30, "name": "sleeper" }),
        )
        .await;

        let resp = send(&app, empty_request("GET", "/sessions")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let list = body_json(resp).await;
        assert_eq!(list.as_array().unwrap().len(), 1);

        let json = wait_for_status(&app, &id, "running").await;
        assert_eq!(json["name"], "sleeper");
        assert_eq!(json["cols"], 100);
        assert_eq!(json["rows"], 30);
        assert_eq!(json["source"]["kind"], "native");

        let resp = send(&app, empty_request("GET", "/sessions/sleeper")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["id"], id.as_str());
        state.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_create_errors() {
        let app = crate::router(test_app_state());

        let resp = send(
            &app,
            json_request("POST", "/sessions", json!({ "command": ["/no/such/program"] })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body_json(resp).await["code"], "spawn_error");

        let resp = send(
            &app,
            json_request("POST", "/sessions", json!({ "command": "true", "cols": -4 })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["code"], "invalid_size");
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let app = crate::router(test_app_state());
        for (method, uri) in [
            ("GET", "/sessions/missing"),
            ("GET", "/sessions/missing/snapshot"),
            ("DELETE", "/sessions/missing"),
        ] {
            let resp = send(&app, empty_request(method, uri)).await;
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{} {}", method, uri);
            assert_eq!(body_json(resp).await["code"], "session_not_found");
        }
    }

    #[tokio::test]
    async fn test_echo_session_lifecycle() {
        let app = crate::router(test_app_state());
        let id = create(&app, json!({ "command": "echo hello" })).await;

        let exited = wait_for_status(&app, &id, "exited").await;
        assert_eq!(exited["exit_code"], 0);
        assert_eq!(exited["exit_reason"], "process_exited");

        let resp = send(&app, empty_request("GET", &format!("/sessions/{}/snapshot", id))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let snap = body_json(resp).await;
        assert!(snap["data"].as_str().unwrap().contains("hello"));
        assert_eq!(snap["cols"], 80);

        // Input after exit is rejected without touching the process
        let resp = send(
            &app,
            json_request("POST", &format!("/sessions/{}/input", id), json!({ "text": "x" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["code"], "session_not_running");

        let resp = send(&app, empty_request("DELETE", &format!("/sessions/{}", id))).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_binary_snapshot() {
        let state = test_app_state();
        let app = crate::router(state.clone());
        let id = create(&app, json!({ "command": ["/bin/sh", "-c", "sleep 5"] })).await;

        let resp = send(
            &app,
            empty_request("GET", &format!("/sessions/{}/snapshot?format=binary", id)),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "application/octet-stream"
        );
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body[0], virtual_terminal::SNAPSHOT_MAGIC);
        state.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_input_resize_kill_delete() {
        let app = crate::router(test_app_state());
        let id = create(&app, json!({ "command": ["/bin/sh", "-c", "sleep 5"] })).await;

        let resp = send(
            &app,
            json_request("POST", &format!("/sessions/{}/input", id), json!({ "key": "enter" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["written"], 1);

        let resp = send(
            &app,
            json_request("POST", &format!("/sessions/{}/input", id), json!({ "key": "nope" })),
        )
        .await;
        assert_eq!(body_json(resp).await["code"], "unknown_key");

        let resp = send(
            &app,
            json_request("POST", &format!("/sessions/{}/resize", id), json!({ "cols": 0, "rows": 40 })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = send(
            &app,
            json_request("POST", &format!("/sessions/{}/resize", id), json!({ "cols": 120, "rows": 40 })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = send(&app, empty_request("GET", &format!("/sessions/{}/snapshot", id))).await;
        let snap = body_json(resp).await;
        assert_eq!((snap["cols"].as_u64(), snap["rows"].as_u64()), (Some(120), Some(40)));

        let resp = send(&app, empty_request("DELETE", &format!("/sessions/{}", id))).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = send(
            &app,
            json_request("POST", &format!("/sessions/{}/kill", id), json!({ "signal": "SIGKILL" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let exited = wait_for_status(&app, &id, "exited").await;
        assert_eq!(exited["exit_reason"], "killed");

        let resp = send(&app, empty_request("POST", "/sessions/cleanup-exited")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["removed"][0], id.as_str());
    }

    #[tokio::test]
    async fn test_kill_rejects_unknown_signal() {
        let state = test_app_state();
        let app = crate::router(state.clone());
        let id = create(&app, json!({ "command": ["/bin/sh", "-c", "sleep 5"] })).await;
        let resp = send(
            &app,
            json_request("POST", &format!("/sessions/{}/kill", id), json!({ "signal": "SIGWINCH" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        state.registry.shutdown().await;
    }
}
