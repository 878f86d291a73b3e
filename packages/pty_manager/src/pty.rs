use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::PtyError;

/// How long the exit waiter lets the reader drain output the process wrote
/// just before exiting. Grandchildren holding the slave open would otherwise
/// delay the exit event forever.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const READ_BUFFER_SIZE: usize = 8192;

/// Configuration for spawning a PTY
#[derive(Clone, Debug)]
pub struct PtyConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            command: "/bin/sh".to_string(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            rows: 24,
            cols: 80,
        }
    }
}

impl PtyConfig {
    /// Build a config from an argv vector (`argv[0]` is the program).
    pub fn from_argv(argv: &[String]) -> Result<Self, PtyError> {
        let (command, args) = argv.split_first().ok_or(PtyError::EmptyCommand)?;
        Ok(Self {
            command: command.clone(),
            args: args.to_vec(),
            ..Default::default()
        })
    }
}

/// State of a PTY session
#[derive(Clone, Debug)]
pub struct PtyState {
    pub running: bool,
    pub pid: Option<u32>,
    pub command: String,
    pub args: Vec<String>,
    pub rows: u16,
    pub cols: u16,
}

/// A chunk of bytes read from the PTY master
#[derive(Clone, Debug)]
pub struct PtyOutput {
    pub data: Vec<u8>,
    pub timestamp: i64,
}

/// How the process ended. `signal` is set when the exit followed a signal
/// sent through [`PtyHandle::kill`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

/// Events produced by a PTY, in the order they happened.
///
/// `Exited` is sent exactly once. It follows all output unless the reader
/// is still busy after `READER_DRAIN_TIMEOUT` (a background job holding the
/// terminal open); output from such a job arrives after `Exited`, and the
/// channel closes once the terminal is released.
#[derive(Clone, Debug)]
pub enum PtyEvent {
    Output(PtyOutput),
    Exited(ExitStatus),
}

/// Messages that can be sent to the PTY actor
pub(crate) enum PtyMessage {
    WriteInput {
        data: Vec<u8>,
        respond_to: oneshot::Sender<Result<usize, PtyError>>,
    },
    Resize {
        rows: u16,
        cols: u16,
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
    GetState {
        respond_to: oneshot::Sender<PtyState>,
    },
    Kill {
        signal: Option<String>,
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
}

/// Flags shared between the actor, the exit waiter thread and handles.
#[derive(Debug, Default)]
struct Shared {
    exited: AtomicBool,
    signal_sent: OnceLock<&'static str>,
}

/// Handle to communicate with a PTY actor.
///
/// Every write and resize is funnelled through one actor queue, so callers
/// never interleave at the byte level.
#[derive(Clone)]
pub struct PtyHandle {
    sender: mpsc::Sender<PtyMessage>,
    shared: Arc<Shared>,
    pid: Option<u32>,
}

impl PtyHandle {
    /// Write data to the PTY
    pub async fn write(&self, data: &[u8]) -> Result<usize, PtyError> {
        if self.has_exited() {
            return Err(PtyError::WriteAfterExit);
        }
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::WriteInput {
                data: data.to_vec(),
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::ChannelClosed)?;
        rx.await.map_err(|_| PtyError::ChannelClosed)?
    }

    /// Write a string to the PTY
    pub async fn write_str(&self, text: &str) -> Result<usize, PtyError> {
        self.write(text.as_bytes()).await
    }

    /// Resize the PTY
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::Resize {
                rows,
                cols,
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::ChannelClosed)?;
        rx.await.map_err(|_| PtyError::ChannelClosed)?
    }

    /// Get the current state of the PTY
    pub async fn state(&self) -> Result<PtyState, PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| PtyError::ChannelClosed)?;
        rx.await.map_err(|_| PtyError::ChannelClosed)
    }

    /// Send a termination signal to the process.
    ///
    /// Returns once the signal has been delivered. Killing an exited process
    /// is a no-op. Exit confirmation arrives as [`PtyEvent::Exited`].
    pub async fn kill(&self, signal: Option<&str>) -> Result<(), PtyError> {
        if self.has_exited() {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::Kill {
                signal: signal.map(|s| s.to_string()),
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::ChannelClosed)?;
        rx.await.map_err(|_| PtyError::ChannelClosed)?
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.shared.exited.load(Ordering::SeqCst)
    }
}

/// The PTY actor that manages a single PTY session
pub struct PtyActor {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    state: PtyState,
    shared: Arc<Shared>,
    receiver: mpsc::Receiver<PtyMessage>,
}

impl PtyActor {
    /// Spawn a new PTY and return a handle to it plus its event stream.
    ///
    /// Fails synchronously when the working directory is invalid or the
    /// executable cannot be started.
    pub fn spawn(config: PtyConfig) -> Result<(PtyHandle, mpsc::Receiver<PtyEvent>), PtyError> {
        if config.command.trim().is_empty() {
            return Err(PtyError::EmptyCommand);
        }
        if let Some(dir) = &config.working_dir {
            if !dir.is_dir() {
                return Err(PtyError::InvalidWorkingDir(dir.clone()));
            }
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::OpenFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&config.command);
        for arg in &config.args {
            cmd.arg(arg);
        }
        if let Some(dir) = &config.working_dir {
            cmd.cwd(dir);
        }

        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        for key in ["PATH", "HOME", "USER", "LANG"] {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        info!(
            "Spawning PTY command: {} with args: {:?}",
            config.command, config.args
        );

        let mut child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!("Failed to spawn command '{}': {}", config.command, e);
            PtyError::SpawnFailed {
                command: config.command.clone(),
                reason: e.to_string(),
            }
        })?;
        // The child holds its own copy of the slave; ours would keep the
        // master from ever seeing EOF.
        drop(pair.slave);

        let pid = child.process_id();
        info!("PTY process started with PID: {:?}", pid);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::OpenFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::OpenFailed(e.to_string()))?;
        let killer = child.clone_killer();

        let shared = Arc::new(Shared::default());
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (msg_tx, msg_rx) = mpsc::channel(32);
        let (drained_tx, drained_rx) = std::sync::mpsc::channel::<()>();

        let reader_tx = event_tx.clone();
        std::thread::spawn(move || {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        debug!("PTY EOF detected");
                        break;
                    }
                    Ok(n) => {
                        let output = PtyOutput {
                            data: buffer[..n].to_vec(),
                            timestamp: chrono::Utc::now().timestamp_millis(),
                        };
                        if reader_tx.blocking_send(PtyEvent::Output(output)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // EIO is how Linux reports a hung-up slave
                        debug!("PTY read ended: {}", e);
                        break;
                    }
                }
            }
            let _ = drained_tx.send(());
            debug!("PTY reader thread exiting");
        });

        let waiter_shared = shared.clone();
        std::thread::spawn(move || {
            let result = child.wait();
            waiter_shared.exited.store(true, Ordering::SeqCst);
            let _ = drained_rx.recv_timeout(READER_DRAIN_TIMEOUT);

            let signal = waiter_shared.signal_sent.get().map(|s| s.to_string());
            let status = match result {
                Ok(status) => ExitStatus {
                    code: Some(status.exit_code() as i32),
                    signal,
                },
                Err(e) => {
                    warn!("Failed to wait for PTY child: {}", e);
                    ExitStatus { code: None, signal }
                }
            };
            info!("PTY process exited: {:?}", status);
            let _ = event_tx.blocking_send(PtyEvent::Exited(status));
        });

        let state = PtyState {
            running: true,
            pid,
            command: config.command.clone(),
            args: config.args.clone(),
            rows: config.rows,
            cols: config.cols,
        };

        let actor = Self {
            master: pair.master,
            writer,
            killer,
            state,
            shared: shared.clone(),
            receiver: msg_rx,
        };

        tokio::spawn(async move {
            actor.run().await;
        });

        Ok((
            PtyHandle {
                sender: msg_tx,
                shared,
                pid,
            },
            event_rx,
        ))
    }

    async fn run(mut self) {
        debug!(
            "PTY actor started for command: {} with PID: {:?}",
            self.state.command, self.state.pid
        );

        // Runs until every handle is dropped; that drop also closes the master.
        while let Some(msg) = self.receiver.recv().await {
            match msg {
                PtyMessage::WriteInput { data, respond_to } => {
                    let _ = respond_to.send(self.handle_write_input(&data));
                }
                PtyMessage::Resize {
                    rows,
                    cols,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.handle_resize(rows, cols));
                }
                PtyMessage::GetState { respond_to } => {
                    self.state.running = !self.shared.exited.load(Ordering::SeqCst);
                    let _ = respond_to.send(self.state.clone());
                }
                PtyMessage::Kill { signal, respond_to } => {
                    let _ = respond_to.send(self.handle_kill(signal));
                }
            }
        }

        debug!("PTY actor shutting down");
    }

    fn handle_write_input(&mut self, data: &[u8]) -> Result<usize, PtyError> {
        if self.shared.exited.load(Ordering::SeqCst) {
            return Err(PtyError::WriteAfterExit);
        }
        self.writer
            .write_all(data)
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        self.writer
            .flush()
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        Ok(data.len())
    }

    fn handle_resize(&mut self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))?;

        self.state.rows = rows;
        self.state.cols = cols;
        Ok(())
    }

    fn handle_kill(&mut self, signal: Option<String>) -> Result<(), PtyError> {
        if self.shared.exited.load(Ordering::SeqCst) {
            return Ok(());
        }

        match signal.as_deref() {
            Some("SIGTERM") | None => {
                #[cfg(unix)]
                self.signal_process(nix::sys::signal::Signal::SIGTERM)?;
                #[cfg(not(unix))]
                self.killer
                    .kill()
                    .map_err(|e| PtyError::KillFailed(e.to_string()))?;
                let _ = self.shared.signal_sent.set("SIGTERM");
            }
            Some("SIGKILL") => {
                self.killer
                    .kill()
                    .map_err(|e| PtyError::KillFailed(e.to_string()))?;
                let _ = self.shared.signal_sent.set("SIGKILL");
            }
            // An interrupt is not recorded as the exit cause; the process
            // may handle it and keep running.
            #[cfg(unix)]
            Some("SIGINT") => {
                self.signal_process(nix::sys::signal::Signal::SIGINT)?;
            }
            Some(sig) => {
                return Err(PtyError::UnsupportedSignal(sig.to_string()));
            }
        }

        Ok(())
    }

    #[cfg(unix)]
    fn signal_process(&self, signal: nix::sys::signal::Signal) -> Result<(), PtyError> {
        use nix::errno::Errno;
        use nix::unistd::Pid;

        let Some(pid) = self.state.pid else {
            return Ok(());
        };
        match nix::sys::signal::kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(PtyError::KillFailed(e.to_string())),
        }
    }
}
