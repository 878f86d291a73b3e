use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Exited,
}

/// Why a session left the `running` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// The process ended on its own
    ProcessExited,
    /// The process ended after a kill request
    Killed,
    /// Subscriptions kept getting severed right after resubscribing
    ExcessiveReconnection,
}

/// Where the session's I/O comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionSource {
    Native,
    /// Attached to an external multiplexer target such as `work:1.0`
    Multiplexer { target: String },
}

/// Public view of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub status: SessionStatus,
    pub pid: Option<u32>,
    pub cols: u16,
    pub rows: u16,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<ExitReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_signal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<DateTime<Utc>>,
    pub source: SessionSource,
}

impl SessionInfo {
    pub fn is_running(&self) -> bool {
        self.status == SessionStatus::Running
    }
}

/// Everything needed to start a session.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    /// argv; empty means the configured default shell
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub name: Option<String>,
    pub env: Vec<(String, String)>,
    pub source: SessionSource,
}

impl Default for SessionSpec {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            cwd: None,
            cols: None,
            rows: None,
            name: None,
            env: Vec::new(),
            source: SessionSource::Native,
        }
    }
}

impl SessionSpec {
    pub fn command(argv: &[&str]) -> Self {
        Self {
            command: argv.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }
}

/// Default display name: basename of the program.
pub(crate) fn default_name(command: &[String]) -> String {
    command
        .first()
        .and_then(|program| {
            std::path::Path::new(program)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
        })
        .unwrap_or_else(|| "session".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_name_is_basename() {
        assert_eq!(default_name(&["/usr/bin/htop".to_string()]), "htop");
        assert_eq!(default_name(&["ls".to_string(), "-la".to_string()]), "ls");
        assert_eq!(default_name(&[]), "session");
    }

    #[test]
    fn test_status_serde() {
        assert_eq!(
            serde_json::to_value(SessionStatus::Running).unwrap(),
            "running"
        );
        assert_eq!(
            serde_json::to_value(ExitReason::ExcessiveReconnection).unwrap(),
            "excessive_reconnection"
        );
    }

    #[test]
    fn test_source_serde() {
        let json = serde_json::to_value(SessionSource::Multiplexer {
            target: "work:1.0".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "multiplexer");
        assert_eq!(json["target"], "work:1.0");
    }
}
