//! External multiplexer bridge
//!
//! Mirrors a multiplexer's session, window and pane tree and turns "attach
//! to this pane" into an ordinary session whose process is the
//! multiplexer's own client.

mod tmux;

pub use tmux::Tmux;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::MultiplexerError;
use crate::registry::SessionRegistry;
use crate::session::{SessionInfo, SessionSource, SessionSpec};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuxPane {
    pub index: u32,
    pub active: bool,
    pub command: String,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuxWindow {
    pub index: u32,
    pub name: String,
    pub active: bool,
    pub panes: Vec<MuxPane>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuxSession {
    pub name: String,
    pub attached: bool,
    pub windows: Vec<MuxWindow>,
}

/// A session, window or pane. The most specific part given wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuxTarget {
    pub session: String,
    #[serde(default)]
    pub window: Option<u32>,
    #[serde(default)]
    pub pane: Option<u32>,
}

impl MuxTarget {
    pub fn session(name: impl Into<String>) -> Self {
        Self {
            session: name.into(),
            window: None,
            pane: None,
        }
    }

    /// Whether the target exists in a listed tree.
    fn resolve(&self, sessions: &[MuxSession]) -> bool {
        let Some(session) = sessions.iter().find(|s| s.name == self.session) else {
            return false;
        };
        match (self.window, self.pane) {
            (None, None) => true,
            (Some(w), pane) => session
                .windows
                .iter()
                .find(|win| win.index == w)
                .is_some_and(|win| pane.is_none_or(|p| win.panes.iter().any(|x| x.index == p))),
            // Pane without window: a pane of the active window
            (None, Some(p)) => session
                .windows
                .iter()
                .find(|win| win.active)
                .is_some_and(|win| win.panes.iter().any(|x| x.index == p)),
        }
    }
}

impl fmt::Display for MuxTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.window, self.pane) {
            (None, None) => write!(f, "{}", self.session),
            (Some(w), None) => write!(f, "{}:{}", self.session, w),
            (Some(w), Some(p)) => write!(f, "{}:{}.{}", self.session, w, p),
            (None, Some(p)) => write!(f, "{}:.{}", self.session, p),
        }
    }
}

/// An external multiplexer such as tmux.
#[async_trait]
pub trait Multiplexer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn is_available(&self) -> bool;

    /// The full session tree. An empty list when no server is running.
    async fn list(&self) -> Result<Vec<MuxSession>, MultiplexerError>;

    /// Focus the target and return the argv of a client attached to it.
    async fn prepare_attach(&self, target: &MuxTarget) -> Result<Vec<String>, MultiplexerError>;

    async fn create_session(&self, name: &str, layout: Option<&str>) -> Result<(), MultiplexerError>;

    async fn kill(&self, target: &MuxTarget) -> Result<(), MultiplexerError>;
}

/// Listing response: the tree, or an empty tree when unavailable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxListing {
    pub available: bool,
    pub kind: Option<String>,
    pub sessions: Vec<MuxSession>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachRequest {
    #[serde(flatten)]
    pub target: MuxTarget,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Owns an optional multiplexer; every operation degrades to
/// [`MultiplexerError::Unavailable`] without one.
#[derive(Clone, Default)]
pub struct MultiplexerBridge {
    mux: Option<Arc<dyn Multiplexer>>,
}

impl MultiplexerBridge {
    pub fn new(mux: Arc<dyn Multiplexer>) -> Self {
        Self { mux: Some(mux) }
    }

    pub fn disabled() -> Self {
        Self { mux: None }
    }

    fn mux(&self) -> Result<&Arc<dyn Multiplexer>, MultiplexerError> {
        self.mux
            .as_ref()
            .ok_or_else(|| MultiplexerError::Unavailable("multiplexer support disabled".into()))
    }

    pub async fn is_available(&self) -> bool {
        match &self.mux {
            Some(mux) => mux.is_available().await,
            None => false,
        }
    }

    /// Enumerate the tree. Failures are logged and reported as unavailable.
    pub async fn list_entities(&self) -> MuxListing {
        let Some(mux) = &self.mux else {
            return MuxListing {
                available: false,
                kind: None,
                sessions: Vec::new(),
            };
        };
        match mux.list().await {
            Ok(sessions) => MuxListing {
                available: true,
                kind: Some(mux.name().to_string()),
                sessions,
            },
            Err(e) => {
                warn!("Failed to list {} sessions: {}", mux.name(), e);
                MuxListing {
                    available: false,
                    kind: Some(mux.name().to_string()),
                    sessions: Vec::new(),
                }
            }
        }
    }

    /// Open a session attached to the target's multiplexer client.
    pub async fn attach(
        &self,
        registry: &SessionRegistry,
        request: AttachRequest,
    ) -> Result<SessionInfo, MultiplexerError> {
        let mux = self.mux()?;
        let target = request.target;
        if target.session.trim().is_empty() {
            return Err(MultiplexerError::InvalidRequest(
                "session name is required".into(),
            ));
        }

        let sessions = mux.list().await?;
        if !target.resolve(&sessions) {
            return Err(MultiplexerError::TargetNotFound(target.to_string()));
        }

        let command = mux.prepare_attach(&target).await?;
        let info = registry
            .create_session(SessionSpec {
                command,
                cols: request.cols,
                rows: request.rows,
                name: Some(request.name.unwrap_or_else(|| target.to_string())),
                source: SessionSource::Multiplexer {
                    target: target.to_string(),
                },
                ..Default::default()
            })
            .await?;

        info!(
            session_id = %info.id,
            "Attached to {} target {}",
            mux.name(),
            target
        );
        Ok(info)
    }

    pub async fn create(&self, name: &str, layout: Option<&str>) -> Result<(), MultiplexerError> {
        if name.trim().is_empty() {
            return Err(MultiplexerError::InvalidRequest(
                "session name is required".into(),
            ));
        }
        self.mux()?.create_session(name, layout).await
    }

    pub async fn kill(&self, target: &MuxTarget) -> Result<(), MultiplexerError> {
        self.mux()?.kill(target).await
    }
}
