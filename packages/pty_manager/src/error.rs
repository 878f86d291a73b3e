use std::path::PathBuf;

/// Errors that can occur during PTY operations
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    /// The command line was empty
    #[error("no command given")]
    EmptyCommand,

    /// The requested working directory is missing or not a directory
    #[error("working directory is not a directory: {}", .0.display())]
    InvalidWorkingDir(PathBuf),

    /// Failed to allocate the PTY pair
    #[error("failed to open PTY: {0}")]
    OpenFailed(String),

    /// The executable could not be started (not found, permission denied, ...)
    #[error("failed to spawn '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    /// Failed to write to PTY
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// The process behind the PTY has already exited
    #[error("process has already exited")]
    WriteAfterExit,

    /// Failed to resize PTY
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to signal the PTY process
    #[error("failed to signal process: {0}")]
    KillFailed(String),

    /// Signal name not understood by `kill`
    #[error("unsupported signal: {0}")]
    UnsupportedSignal(String),

    /// The actor task is no longer running
    #[error("PTY actor is gone")]
    ChannelClosed,
}
