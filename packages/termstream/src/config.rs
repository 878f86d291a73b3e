use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use virtual_terminal::ScreenConfig;

// =============================================================================
// File config (figment-deserialized from defaults / termstream.toml / env vars)
// =============================================================================
//
//   termstream.toml:  [stream]
//                     error_threshold = 5
//
//   env var:          TERMSTREAM_STREAM__ERROR_THRESHOLD=5   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub terminal: TerminalFileConfig,
    #[serde(default)]
    pub stream: StreamFileConfig,
    #[serde(default)]
    pub sessions: SessionsFileConfig,
    #[serde(default)]
    pub multiplexer: MultiplexerFileConfig,
}

/// Listener and spawn defaults (lives under `[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Command used when a create request names none.
    #[serde(default = "default_shell")]
    pub default_shell: String,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            default_shell: default_shell(),
        }
    }
}

/// Screen and frame batching knobs (lives under `[terminal]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TerminalFileConfig {
    #[serde(default = "default_cols")]
    pub default_cols: u16,
    #[serde(default = "default_rows")]
    pub default_rows: u16,
    /// Scrollback rows included in snapshots.
    #[serde(default = "default_scrollback_lines")]
    pub scrollback_lines: usize,
    #[serde(default = "default_max_delta_bytes")]
    pub max_delta_bytes: usize,
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
    /// Recent frames kept per session for lag recovery.
    #[serde(default = "default_frame_ring_len")]
    pub frame_ring_len: usize,
}

impl Default for TerminalFileConfig {
    fn default() -> Self {
        Self {
            default_cols: default_cols(),
            default_rows: default_rows(),
            scrollback_lines: default_scrollback_lines(),
            max_delta_bytes: default_max_delta_bytes(),
            batch_window_ms: default_batch_window_ms(),
            max_batch_bytes: default_max_batch_bytes(),
            frame_ring_len: default_frame_ring_len(),
        }
    }
}

/// Subscription delivery and reconnect policy (lives under `[stream]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamFileConfig {
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_error_window_secs")]
    pub error_window_secs: u64,
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    #[serde(default = "default_thrash_window_secs")]
    pub thrash_window_secs: u64,
}

impl Default for StreamFileConfig {
    fn default() -> Self {
        Self {
            outbound_queue: default_outbound_queue(),
            send_timeout_ms: default_send_timeout_ms(),
            error_window_secs: default_error_window_secs(),
            error_threshold: default_error_threshold(),
            thrash_window_secs: default_thrash_window_secs(),
        }
    }
}

/// Exited-session retention (lives under `[sessions]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionsFileConfig {
    /// 0 keeps exited sessions until they are deleted explicitly.
    #[serde(default)]
    pub exited_retention_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for SessionsFileConfig {
    fn default() -> Self {
        Self {
            exited_retention_secs: 0,
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

/// External multiplexer bridge (lives under `[multiplexer]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MultiplexerFileConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_mux_command")]
    pub command: String,
}

impl Default for MultiplexerFileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: default_mux_command(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    4020
}
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_scrollback_lines() -> usize {
    1000
}
fn default_max_delta_bytes() -> usize {
    256 * 1024
}
fn default_batch_window_ms() -> u64 {
    16
}
fn default_max_batch_bytes() -> usize {
    32 * 1024
}
fn default_frame_ring_len() -> usize {
    256
}
fn default_outbound_queue() -> usize {
    256
}
fn default_send_timeout_ms() -> u64 {
    5000
}
fn default_error_window_secs() -> u64 {
    5
}
fn default_error_threshold() -> u32 {
    3
}
fn default_thrash_window_secs() -> u64 {
    5
}
fn default_cleanup_interval_secs() -> u64 {
    60
}
fn default_true() -> bool {
    true
}
fn default_mux_command() -> String {
    "tmux".to_string()
}

/// Build a figment that layers: defaults → config file → TERMSTREAM_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `TERMSTREAM_SERVER__PORT=8080`  →  `server.port = 8080`
pub fn load_config(config_path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("TERMSTREAM_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub terminal: TerminalConfig,
    pub stream: StreamConfig,
    pub sessions: SessionsConfig,
    pub multiplexer: MultiplexerFileConfig,
}

impl AppConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            server: ServerConfig::from_file(&fc.server),
            terminal: TerminalConfig::from_file(&fc.terminal),
            stream: StreamConfig::from_file(&fc.stream),
            sessions: SessionsConfig::from_file(&fc.sessions),
            multiplexer: fc.multiplexer.clone(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub default_shell: String,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        Self {
            host: fc.host.clone(),
            port: fc.port,
            default_shell: fc.default_shell.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TerminalConfig {
    pub default_cols: u16,
    pub default_rows: u16,
    pub screen: ScreenConfig,
    /// Coalescing window for PTY reads
    pub batch_window: Duration,
    pub max_batch_bytes: usize,
    pub frame_ring_len: usize,
}

impl TerminalConfig {
    pub fn from_file(fc: &TerminalFileConfig) -> Self {
        Self {
            default_cols: fc.default_cols.max(1),
            default_rows: fc.default_rows.max(1),
            screen: ScreenConfig {
                scrollback_lines: fc.scrollback_lines,
                max_delta_bytes: fc.max_delta_bytes,
            },
            batch_window: Duration::from_millis(fc.batch_window_ms),
            max_batch_bytes: fc.max_batch_bytes.max(1),
            frame_ring_len: fc.frame_ring_len,
        }
    }
}

#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Per-subscription queue depth; never below 2 so a snapshot and the
    /// exit notice always fit.
    pub outbound_queue: usize,
    pub send_timeout: Duration,
    pub error_window: Duration,
    pub error_threshold: u32,
    pub thrash_window: Duration,
}

impl StreamConfig {
    pub fn from_file(fc: &StreamFileConfig) -> Self {
        Self {
            outbound_queue: fc.outbound_queue.max(2),
            send_timeout: Duration::from_millis(fc.send_timeout_ms),
            error_window: Duration::from_secs(fc.error_window_secs),
            error_threshold: fc.error_threshold.max(1),
            thrash_window: Duration::from_secs(fc.thrash_window_secs),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::from_file(&StreamFileConfig::default())
    }
}

#[derive(Clone, Debug)]
pub struct SessionsConfig {
    /// `None` disables the periodic sweep.
    pub exited_retention: Option<Duration>,
    pub cleanup_interval: Duration,
}

impl SessionsConfig {
    pub fn from_file(fc: &SessionsFileConfig) -> Self {
        Self {
            exited_retention: (fc.exited_retention_secs > 0)
                .then(|| Duration::from_secs(fc.exited_retention_secs)),
            cleanup_interval: Duration::from_secs(fc.cleanup_interval_secs.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_config_defaults() {
        let fc = FileConfig::default();
        assert_eq!(fc.server.host, "127.0.0.1");
        assert_eq!(fc.server.port, 4020);
        assert_eq!(fc.terminal.default_cols, 80);
        assert_eq!(fc.terminal.default_rows, 24);
        assert_eq!(fc.stream.error_threshold, 3);
        assert_eq!(fc.stream.error_window_secs, 5);
        assert!(fc.multiplexer.enabled);
        assert_eq!(fc.multiplexer.command, "tmux");
    }

    #[test]
    fn test_runtime_config_from_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.terminal.batch_window, Duration::from_millis(16));
        assert_eq!(config.terminal.screen.scrollback_lines, 1000);
        assert_eq!(config.stream.error_window, Duration::from_secs(5));
        assert_eq!(config.stream.send_timeout, Duration::from_secs(5));
        assert!(config.sessions.exited_retention.is_none());
    }

    #[test]
    fn test_stream_config_clamps() {
        let sc = StreamConfig::from_file(&StreamFileConfig {
            outbound_queue: 0,
            error_threshold: 0,
            ..Default::default()
        });
        assert_eq!(sc.outbound_queue, 2);
        assert_eq!(sc.error_threshold, 1);
    }

    #[test]
    fn test_retention_enabled_when_positive() {
        let sc = SessionsConfig::from_file(&SessionsFileConfig {
            exited_retention_secs: 600,
            cleanup_interval_secs: 0,
        });
        assert_eq!(sc.exited_retention, Some(Duration::from_secs(600)));
        assert_eq!(sc.cleanup_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_load_config_defaults() {
        let fc: FileConfig = load_config(None).extract().unwrap();
        assert_eq!(fc.server.port, 4020);
        assert_eq!(fc.terminal.frame_ring_len, 256);
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("termstream.toml");
        std::fs::write(
            &path,
            "[server]\nport = 8080\n\n[stream]\nerror_threshold = 5\n\n[multiplexer]\nenabled = false\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(Some(&path)).extract().unwrap();
        assert_eq!(fc.server.port, 8080);
        assert_eq!(fc.server.host, "127.0.0.1");
        assert_eq!(fc.stream.error_threshold, 5);
        assert!(!fc.multiplexer.enabled);
    }

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(Some(&tmp.path().join("absent.toml")))
            .extract()
            .unwrap();
        assert_eq!(fc.stream.outbound_queue, 256);
    }
}
