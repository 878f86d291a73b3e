use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use pty_manager::PtyError;
use virtual_terminal::FrameError;

/// Errors surfaced by the session core.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Session creation failed: bad executable, bad cwd, PTY allocation
    #[error("failed to start session: {0}")]
    Spawn(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session is not running: {0}")]
    NotRunning(String),

    /// Only exited sessions can be deleted
    #[error("session has not exited: {0}")]
    NotExited(String),

    #[error("process has already exited")]
    WriteAfterExit,

    #[error("invalid terminal size: {cols}x{rows}")]
    InvalidSize { cols: i64, rows: i64 },

    #[error("unknown key: {0}")]
    UnknownKey(String),

    #[error("unsupported signal: {0}")]
    UnsupportedSignal(String),

    #[error("process host error: {0}")]
    Host(PtyError),

    #[error("failed to encode stream message: {0}")]
    Encode(#[from] FrameError),
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::Spawn(_) => "spawn_error",
            SessionError::NotFound(_) => "session_not_found",
            SessionError::NotRunning(_) => "session_not_running",
            SessionError::NotExited(_) => "session_not_exited",
            SessionError::WriteAfterExit => "write_after_exit",
            SessionError::InvalidSize { .. } => "invalid_size",
            SessionError::UnknownKey(_) => "unknown_key",
            SessionError::UnsupportedSignal(_) => "unsupported_signal",
            SessionError::Host(_) => "host_error",
            SessionError::Encode(_) => "encode_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::NotRunning(_)
            | SessionError::WriteAfterExit
            | SessionError::InvalidSize { .. }
            | SessionError::UnknownKey(_)
            | SessionError::UnsupportedSignal(_) => StatusCode::BAD_REQUEST,
            SessionError::NotExited(_) => StatusCode::CONFLICT,
            SessionError::Spawn(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SessionError::Host(_) | SessionError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<PtyError> for SessionError {
    fn from(e: PtyError) -> Self {
        match e {
            PtyError::WriteAfterExit => SessionError::WriteAfterExit,
            PtyError::UnsupportedSignal(sig) => SessionError::UnsupportedSignal(sig),
            PtyError::EmptyCommand
            | PtyError::InvalidWorkingDir(_)
            | PtyError::OpenFailed(_)
            | PtyError::SpawnFailed { .. } => SessionError::Spawn(e.to_string()),
            other => SessionError::Host(other),
        }
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = self.status();
        (
            status,
            Json(serde_json::json!({ "error": self.to_string(), "code": self.code() })),
        )
            .into_response()
    }
}

/// Errors from the external multiplexer bridge.
#[derive(Debug, thiserror::Error)]
pub enum MultiplexerError {
    /// The multiplexer binary is missing, disabled, or has no server running
    #[error("multiplexer unavailable: {0}")]
    Unavailable(String),

    #[error("multiplexer target not found: {0}")]
    TargetNotFound(String),

    /// The multiplexer ran but reported failure; carries its own output
    #[error("multiplexer command failed: {0}")]
    CommandFailed(String),

    #[error("invalid multiplexer request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl IntoResponse for MultiplexerError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            MultiplexerError::Unavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "multiplexer_unavailable")
            }
            MultiplexerError::TargetNotFound(_) => (StatusCode::NOT_FOUND, "target_not_found"),
            MultiplexerError::CommandFailed(_) => {
                (StatusCode::BAD_GATEWAY, "multiplexer_command_failed")
            }
            MultiplexerError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            MultiplexerError::Session(inner) => (inner.status(), inner.code()),
        };
        (
            status,
            Json(serde_json::json!({ "error": self.to_string(), "code": code })),
        )
            .into_response()
    }
}
