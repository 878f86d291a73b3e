//! Session table and per-session workers
//!
//! Each session owns one process host and one broadcaster. A dedicated
//! worker task is the only writer of frames for its session: it batches
//! host output for a short window, publishes it, announces resizes and
//! turns the host's exit event into the session's single exit transition.

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use dashmap::DashMap;
use pty_manager::{PtyActor, PtyConfig, PtyError, PtyEvent, PtyHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use virtual_terminal::{FrameEncoder, Snapshot};

use crate::broadcaster::{Broadcaster, ExitNotice, Subscription, SubscriptionId};
use crate::config::AppConfig;
use crate::error::SessionError;
use crate::input::InputRequest;
use crate::metrics::ServerMetrics;
use crate::session::{ExitReason, SessionInfo, SessionSpec, SessionStatus, default_name};
use crate::supervisor::SupervisorState;

/// How often lagging subscribers get another recovery attempt.
const RECOVERY_INTERVAL: Duration = Duration::from_millis(250);

const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

struct SessionEntry {
    id: String,
    info: RwLock<SessionInfo>,
    host: PtyHandle,
    broadcaster: Broadcaster,
    /// Held across a whole resize so the PTY, screen and info agree.
    resize_lock: Mutex<()>,
    resized: Notify,
    metrics: Arc<ServerMetrics>,
}

impl SessionEntry {
    async fn info(&self) -> SessionInfo {
        self.info.read().await.clone()
    }

    async fn is_running(&self) -> bool {
        self.info.read().await.is_running()
    }

    async fn touch(&self) {
        self.info.write().await.last_activity = Utc::now();
    }

    /// The single `running -> exited` transition. Later calls are no-ops.
    async fn mark_exited(
        &self,
        exit_code: Option<i32>,
        reason: ExitReason,
        signal: Option<String>,
    ) -> bool {
        {
            let mut info = self.info.write().await;
            if info.status == SessionStatus::Exited {
                return false;
            }
            let now = Utc::now();
            info.status = SessionStatus::Exited;
            info.exit_code = exit_code;
            info.exit_reason = Some(reason);
            info.exit_signal = signal.clone();
            info.exited_at = Some(now);
            info.last_activity = now;
        }

        self.broadcaster
            .mark_exited(ExitNotice {
                exit_code,
                reason,
                signal,
            })
            .await;
        self.metrics.session_exited();
        info!(
            session_id = %self.id,
            "Session exited (code {:?}, {:?})",
            exit_code,
            reason
        );
        true
    }
}

pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionEntry>>,
    config: Arc<AppConfig>,
    metrics: Arc<ServerMetrics>,
}

impl SessionRegistry {
    pub fn new(config: Arc<AppConfig>, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Spawn a process and start streaming it.
    pub async fn create_session(&self, spec: SessionSpec) -> Result<SessionInfo, SessionError> {
        let cols = spec.cols.unwrap_or(self.config.terminal.default_cols);
        let rows = spec.rows.unwrap_or(self.config.terminal.default_rows);
        if cols == 0 || rows == 0 {
            return Err(SessionError::InvalidSize {
                cols: cols.into(),
                rows: rows.into(),
            });
        }

        let command = if spec.command.is_empty() {
            vec![self.config.server.default_shell.clone()]
        } else {
            spec.command
        };

        let mut pty_config = PtyConfig::from_argv(&command)?;
        pty_config.working_dir = spec.cwd.clone();
        pty_config.env = spec.env;
        pty_config.cols = cols;
        pty_config.rows = rows;

        let (host, events) = PtyActor::spawn(pty_config).map_err(|e| {
            self.metrics.spawn_error();
            error!("Failed to spawn {:?}: {}", command, e);
            SessionError::from(e)
        })?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let cwd = spec
            .cwd
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_default();
        let info = SessionInfo {
            id: id.clone(),
            name: spec.name.unwrap_or_else(|| default_name(&command)),
            command,
            cwd,
            status: SessionStatus::Running,
            pid: host.pid(),
            cols,
            rows,
            created_at: now,
            last_activity: now,
            exit_code: None,
            exit_reason: None,
            exit_signal: None,
            exited_at: None,
            source: spec.source,
        };

        let terminal = &self.config.terminal;
        let broadcaster = Broadcaster::new(
            id.clone(),
            FrameEncoder::new(cols, rows, terminal.screen),
            terminal.frame_ring_len,
            self.config.stream.clone(),
            self.metrics.clone(),
        );
        let entry = Arc::new(SessionEntry {
            id: id.clone(),
            info: RwLock::new(info.clone()),
            host,
            broadcaster,
            resize_lock: Mutex::new(()),
            resized: Notify::new(),
            metrics: self.metrics.clone(),
        });

        self.sessions.insert(id.clone(), entry.clone());
        tokio::spawn(run_session_worker(
            entry,
            events,
            terminal.batch_window,
            terminal.max_batch_bytes,
        ));
        self.metrics.session_created();

        info!(
            session_id = %id,
            "Created session '{}' running {:?} ({}x{}, pid {:?})",
            info.name,
            info.command,
            cols,
            rows,
            info.pid
        );
        Ok(info)
    }

    fn entry(&self, id: &str) -> Result<Arc<SessionEntry>, SessionError> {
        self.sessions
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    pub async fn get(&self, id: &str) -> Result<SessionInfo, SessionError> {
        Ok(self.entry(id)?.info().await)
    }

    /// Look a session up by id, then by name (newest wins), then by a
    /// unique id prefix.
    pub async fn find(&self, name_or_id: &str) -> Result<SessionInfo, SessionError> {
        if let Ok(entry) = self.entry(name_or_id) {
            return Ok(entry.info().await);
        }
        let not_found = || SessionError::NotFound(name_or_id.to_string());
        if name_or_id.is_empty() {
            return Err(not_found());
        }

        let sessions = self.list().await;
        if let Some(info) = sessions.iter().find(|s| s.name == name_or_id) {
            return Ok(info.clone());
        }
        let mut prefixed = sessions.into_iter().filter(|s| s.id.starts_with(name_or_id));
        match (prefixed.next(), prefixed.next()) {
            (Some(info), None) => Ok(info),
            _ => Err(not_found()),
        }
    }

    /// All sessions, newest first.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let entries: Vec<Arc<SessionEntry>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut list = Vec::with_capacity(entries.len());
        for entry in entries {
            list.push(entry.info().await);
        }
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub async fn running_count(&self) -> usize {
        let entries: Vec<Arc<SessionEntry>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut running = 0;
        for entry in entries {
            if entry.is_running().await {
                running += 1;
            }
        }
        running
    }

    /// Record a process exit. Returns `false` if the session had already
    /// exited; only the first call broadcasts.
    pub async fn mark_exited(&self, id: &str, exit_code: Option<i32>) -> Result<bool, SessionError> {
        let entry = self.entry(id)?;
        Ok(entry
            .mark_exited(exit_code, ExitReason::ProcessExited, None)
            .await)
    }

    /// Resize the terminal. Snapshots reflect the new size immediately and
    /// the next frame carries it.
    pub async fn resize(&self, id: &str, cols: i64, rows: i64) -> Result<SessionInfo, SessionError> {
        let entry = self.entry(id)?;
        let invalid = || SessionError::InvalidSize { cols, rows };
        let cols = u16::try_from(cols).ok().filter(|c| *c > 0).ok_or_else(invalid)?;
        let rows = u16::try_from(rows).ok().filter(|r| *r > 0).ok_or_else(invalid)?;

        let _resizing = entry.resize_lock.lock().await;
        if !entry.is_running().await {
            return Err(SessionError::NotRunning(id.to_string()));
        }

        entry.host.resize(rows, cols).await?;
        entry.broadcaster.resize(cols, rows).await;
        let info = {
            let mut info = entry.info.write().await;
            info.cols = cols;
            info.rows = rows;
            info.last_activity = Utc::now();
            info.clone()
        };
        entry.resized.notify_one();

        debug!(session_id = %id, "Resized to {}x{}", cols, rows);
        Ok(info)
    }

    /// Write text or a named key to the session's process.
    pub async fn send_input(&self, id: &str, input: &InputRequest) -> Result<usize, SessionError> {
        let entry = self.entry(id)?;
        let bytes = input.to_bytes()?;
        if !entry.is_running().await {
            return Err(SessionError::NotRunning(id.to_string()));
        }

        let written = match entry.host.write(&bytes).await {
            Ok(n) => n,
            Err(PtyError::WriteAfterExit) => {
                return Err(SessionError::NotRunning(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        self.metrics.input_written(written);
        entry.touch().await;
        Ok(written)
    }

    /// Send a termination signal. Returns once it is sent; the exit itself
    /// arrives through the worker. Killing an exited session is a no-op.
    pub async fn kill(&self, id: &str, signal: Option<&str>) -> Result<(), SessionError> {
        let entry = self.entry(id)?;
        if entry.host.has_exited() {
            return Ok(());
        }
        entry.host.kill(signal).await?;
        info!(session_id = %id, "Sent {} to session", signal.unwrap_or("SIGTERM"));
        Ok(())
    }

    /// Remove an exited session. Running sessions must be killed first.
    pub async fn delete_exited(&self, id: &str) -> Result<(), SessionError> {
        let entry = self.entry(id)?;
        if entry.is_running().await {
            return Err(SessionError::NotExited(id.to_string()));
        }
        self.sessions.remove(id);
        entry.broadcaster.close().await;
        info!(session_id = %id, "Deleted session");
        Ok(())
    }

    /// Remove exited sessions, optionally only those that exited more than
    /// `older_than` ago. Returns the removed ids.
    pub async fn cleanup_exited(&self, older_than: Option<Duration>) -> Vec<String> {
        let cutoff = older_than
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() - d);
        let entries: Vec<Arc<SessionEntry>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();

        let mut removed = Vec::new();
        for entry in entries {
            let info = entry.info().await;
            if info.is_running() {
                continue;
            }
            let old_enough = match (cutoff, info.exited_at) {
                (Some(cutoff), Some(exited_at)) => exited_at <= cutoff,
                (Some(_), None) => false,
                (None, _) => true,
            };
            if old_enough && self.sessions.remove(&entry.id).is_some() {
                entry.broadcaster.close().await;
                removed.push(entry.id.clone());
            }
        }

        if !removed.is_empty() {
            info!("Cleaned up {} exited sessions", removed.len());
        }
        removed
    }

    /// Open a stream on a session: snapshot first, then live frames.
    pub async fn subscribe(&self, id: &str, client_id: &str) -> Result<Subscription, SessionError> {
        let entry = self.entry(id)?;
        Ok(entry.broadcaster.subscribe(client_id).await)
    }

    pub async fn unsubscribe(&self, id: &str, sub_id: SubscriptionId) {
        if let Ok(entry) = self.entry(id) {
            entry.broadcaster.unsubscribe(sub_id).await;
        }
    }

    /// Charge a transport error to a subscription. `None` if the session or
    /// subscription is gone.
    pub async fn report_transport_error(
        &self,
        id: &str,
        sub_id: SubscriptionId,
    ) -> Option<SupervisorState> {
        let entry = self.entry(id).ok()?;
        entry.broadcaster.report_error(sub_id).await
    }

    pub async fn snapshot(&self, id: &str) -> Result<Snapshot, SessionError> {
        let entry = self.entry(id)?;
        Ok(entry.broadcaster.snapshot().await)
    }

    /// Kill every running session.
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<SessionEntry>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        for entry in entries {
            if entry.host.has_exited() {
                continue;
            }
            if let Err(e) = entry.host.kill(None).await {
                warn!(session_id = %entry.id, "Failed to kill session on shutdown: {}", e);
            }
        }
    }

    /// Periodically remove sessions that exited longer ago than the
    /// configured retention. Does nothing when retention is disabled.
    pub fn spawn_cleanup_task(self: Arc<Self>) -> Option<JoinHandle<()>> {
        let retention = self.config.sessions.exited_retention?;
        let every = self.config.sessions.cleanup_interval;
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.cleanup_exited(Some(retention)).await;
            }
        }))
    }
}

async fn flush(entry: &SessionEntry, batch: &mut BytesMut, deadline: &mut Option<Instant>) {
    *deadline = None;
    if batch.is_empty() {
        return;
    }
    let payload: Bytes = batch.split().freeze();
    entry.broadcaster.publish(payload).await;
}

/// Collect output that trails the exit event, until the host releases the
/// terminal or `EXIT_DRAIN_TIMEOUT` passes.
async fn drain_trailing_output(events: &mut mpsc::Receiver<PtyEvent>, batch: &mut BytesMut) {
    let until = Instant::now() + EXIT_DRAIN_TIMEOUT;
    while let Ok(Some(event)) = tokio::time::timeout_at(until, events.recv()).await {
        if let PtyEvent::Output(output) = event {
            batch.extend_from_slice(&output.data);
        }
    }
}

async fn run_session_worker(
    entry: Arc<SessionEntry>,
    mut events: mpsc::Receiver<PtyEvent>,
    batch_window: Duration,
    max_batch_bytes: usize,
) {
    let thrashing = entry.broadcaster.thrashing();
    let mut thrash_handled = false;
    let mut batch = BytesMut::new();
    let mut deadline: Option<Instant> = None;
    let mut recovery = tokio::time::interval(RECOVERY_INTERVAL);
    recovery.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(PtyEvent::Output(output)) => {
                    batch.extend_from_slice(&output.data);
                    entry.touch().await;
                    if batch.len() >= max_batch_bytes {
                        flush(&entry, &mut batch, &mut deadline).await;
                    } else if deadline.is_none() {
                        deadline = Some(Instant::now() + batch_window);
                    }
                }
                Some(PtyEvent::Exited(status)) => {
                    drain_trailing_output(&mut events, &mut batch).await;
                    flush(&entry, &mut batch, &mut deadline).await;
                    let reason = if status.signal.is_some() {
                        ExitReason::Killed
                    } else {
                        ExitReason::ProcessExited
                    };
                    entry.mark_exited(status.code, reason, status.signal).await;
                    break;
                }
                None => {
                    flush(&entry, &mut batch, &mut deadline).await;
                    entry.mark_exited(None, ExitReason::ProcessExited, None).await;
                    break;
                }
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                flush(&entry, &mut batch, &mut deadline).await;
            }
            _ = entry.resized.notified() => {
                // A pending batch carries the new size when it flushes
                if batch.is_empty() && entry.broadcaster.has_pending_resize().await {
                    entry.broadcaster.publish(Bytes::new()).await;
                }
            }
            _ = thrashing.cancelled(), if !thrash_handled => {
                thrash_handled = true;
                flush(&entry, &mut batch, &mut deadline).await;
                warn!(session_id = %entry.id, "Ending session after repeated reconnection failures");
                entry.metrics.session_thrashed();
                entry.mark_exited(None, ExitReason::ExcessiveReconnection, None).await;
                if let Err(e) = entry.host.kill(Some("SIGKILL")).await {
                    warn!(session_id = %entry.id, "Failed to kill thrashing session: {}", e);
                }
            }
            _ = recovery.tick() => {
                entry.broadcaster.recover_lagging().await;
            }
        }
    }

    debug!(session_id = %entry.id, "Session worker finished");
}
