use async_trait::async_trait;
use std::process::Output;
use tokio::process::Command;
use tracing::debug;

use super::{MuxPane, MuxSession, MuxTarget, MuxWindow, Multiplexer};
use crate::error::MultiplexerError;

const DEFAULT_TMUX_COMMAND: &str = "tmux";

const LIST_FORMAT: &str = "#{session_name}\t#{session_attached}\t#{window_index}\t#{window_name}\t#{window_active}\t#{pane_index}\t#{pane_active}\t#{pane_current_command}\t#{pane_current_path}\t#{pane_width}\t#{pane_height}";

pub struct Tmux {
    command: String,
}

impl Tmux {
    pub fn new(command: &str) -> Self {
        let command = command.trim();
        Self {
            command: if command.is_empty() {
                DEFAULT_TMUX_COMMAND.to_string()
            } else {
                command.to_string()
            },
        }
    }

    async fn run_tmux(&self, args: &[&str]) -> Result<Output, MultiplexerError> {
        debug!("Running {} {:?}", self.command, args);
        Command::new(&self.command)
            .args(args)
            .output()
            .await
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => {
                    MultiplexerError::Unavailable(format!("{} not found", self.command))
                }
                _ => MultiplexerError::Unavailable(err.to_string()),
            })
    }

    async fn run_checked(&self, args: &[&str], what: &str) -> Result<Output, MultiplexerError> {
        let output = self.run_tmux(args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(MultiplexerError::CommandFailed(format!(
                "{}.{}",
                what,
                format_output(&output)
            )))
        }
    }
}

#[async_trait]
impl Multiplexer for Tmux {
    fn name(&self) -> &'static str {
        "tmux"
    }

    async fn is_available(&self) -> bool {
        self.run_tmux(&["-V"])
            .await
            .is_ok_and(|output| output.status.success())
    }

    async fn list(&self) -> Result<Vec<MuxSession>, MultiplexerError> {
        let output = self.run_tmux(&["list-panes", "-a", "-F", LIST_FORMAT]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_no_server(&stderr) {
                return Ok(Vec::new());
            }
            return Err(MultiplexerError::CommandFailed(format!(
                "Failed to list tmux panes.{}",
                format_output(&output)
            )));
        }
        Ok(parse_list_panes(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn prepare_attach(&self, target: &MuxTarget) -> Result<Vec<String>, MultiplexerError> {
        let target_name = target.to_string();
        if let Some(w) = target.window {
            let window = format!("{}:{}", target.session, w);
            self.run_checked(
                &["select-window", "-t", &window],
                &format!("Failed to select tmux window '{window}'"),
            )
            .await?;
        }
        if target.pane.is_some() {
            self.run_checked(
                &["select-pane", "-t", &target_name],
                &format!("Failed to select tmux pane '{target_name}'"),
            )
            .await?;
        }
        Ok(vec![
            self.command.clone(),
            "attach-session".to_string(),
            "-t".to_string(),
            target.session.clone(),
        ])
    }

    async fn create_session(&self, name: &str, layout: Option<&str>) -> Result<(), MultiplexerError> {
        self.run_checked(
            &["new-session", "-d", "-s", name],
            &format!("Failed to create tmux session '{name}'"),
        )
        .await?;
        if let Some(layout) = layout.map(str::trim).filter(|l| !l.is_empty()) {
            self.run_checked(
                &["select-layout", "-t", name, layout],
                &format!("Failed to apply layout '{layout}' to '{name}'"),
            )
            .await?;
        }
        Ok(())
    }

    async fn kill(&self, target: &MuxTarget) -> Result<(), MultiplexerError> {
        let target_name = target.to_string();
        let subcommand = match (target.window, target.pane) {
            (_, Some(_)) => "kill-pane",
            (Some(_), None) => "kill-window",
            (None, None) => "kill-session",
        };
        self.run_checked(
            &[subcommand, "-t", &target_name],
            &format!("Failed to {} '{target_name}'", subcommand.replace('-', " ")),
        )
        .await?;
        Ok(())
    }
}

fn is_no_server(stderr: &str) -> bool {
    stderr.contains("no server running")
        || stderr.contains("no sessions")
        || stderr.contains("error connecting to")
}

/// Build the tree from `list-panes -a -F LIST_FORMAT` output. Malformed
/// lines are skipped.
fn parse_list_panes(stdout: &str) -> Vec<MuxSession> {
    let mut sessions: Vec<MuxSession> = Vec::new();
    for line in stdout.lines() {
        let fields: Vec<&str> = line.split('\t').collect();
        let [
            session_name,
            attached,
            window_index,
            window_name,
            window_active,
            pane_index,
            pane_active,
            command,
            cwd,
            width,
            height,
        ] = fields.as_slice()
        else {
            continue;
        };
        let (Ok(window_index), Ok(pane_index)) =
            (window_index.parse::<u32>(), pane_index.parse::<u32>())
        else {
            continue;
        };

        let pane = MuxPane {
            index: pane_index,
            active: *pane_active == "1",
            command: command.to_string(),
            cwd: cwd.to_string(),
            cols: width.parse().unwrap_or(0),
            rows: height.parse().unwrap_or(0),
        };

        let session = match sessions.iter_mut().position(|s| s.name == *session_name) {
            Some(i) => &mut sessions[i],
            None => {
                sessions.push(MuxSession {
                    name: session_name.to_string(),
                    attached: attached.parse::<u32>().unwrap_or(0) > 0,
                    windows: Vec::new(),
                });
                let last = sessions.len() - 1;
                &mut sessions[last]
            }
        };
        let window = match session.windows.iter().position(|w| w.index == window_index) {
            Some(i) => &mut session.windows[i],
            None => {
                session.windows.push(MuxWindow {
                    index: window_index,
                    name: window_name.to_string(),
                    active: *window_active == "1",
                    panes: Vec::new(),
                });
                let last = session.windows.len() - 1;
                &mut session.windows[last]
            }
        };
        window.panes.push(pane);
    }
    sessions
}

fn format_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut parts = Vec::new();
    if !stdout.trim().is_empty() {
        parts.push(stdout.trim().to_string());
    }
    if !stderr.trim().is_empty() {
        parts.push(stderr.trim().to_string());
    }
    if parts.is_empty() {
        "".to_string()
    } else {
        format!(" {}", parts.join("\n"))
    }
}
