//! tmux session backend
//!
//! Each job runs in a detached session on a dedicated server socket so
//! operators can `tmux -S <socket> attach -t job_00042` to watch it.
//!
//! With [`ExitChannel::PaneStatus`] the server keeps dead panes around
//! (`remain-on-exit on`) and the exit code is read from
//! `#{pane_dead_status}`. With [`ExitChannel::Marker`] the command runs under
//! a small `sh` wrapper that dumps the pane history to a marker file when the
//! command exits non-zero.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use serde::{Deserialize, Serialize};

use crate::command::{CommandLine, SessionId};

use super::{BackendError, BackendResult, ExecutionBackend, SessionHandle};

/// How the tmux backend learns a command's outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitChannel {
    /// Read the exit status of the dead pane
    #[default]
    PaneStatus,
    /// Wrapper writes a marker file on non-zero exit
    Marker,
}

const MARKER_WRAPPER: &str = r#"marker="$1"; shift; "$@"; code=$?; if [ "$code" -ne 0 ]; then tmux capture-pane -p -J -S - > "$marker" 2>/dev/null || echo "exit code $code" > "$marker"; fi; exit "$code""#;

/// tmux-backed execution
#[derive(Debug, Clone)]
pub struct TmuxBackend {
    binary: String,
    socket: PathBuf,
    exit_channel: ExitChannel,
    history_limit: u32,
    marker_dir: PathBuf,
}

impl TmuxBackend {
    pub fn new(binary: impl Into<String>, socket: impl Into<PathBuf>, marker_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            socket: socket.into(),
            exit_channel: ExitChannel::default(),
            history_limit: 50_000,
            marker_dir: marker_dir.into(),
        }
    }

    pub fn with_exit_channel(mut self, channel: ExitChannel) -> Self {
        self.exit_channel = channel;
        self
    }

    pub fn with_history_limit(mut self, lines: u32) -> Self {
        self.history_limit = lines;
        self
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    fn tmux(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-S").arg(&self.socket);
        cmd.stdin(Stdio::null());
        cmd
    }

    fn run(&self, args: &[String]) -> BackendResult<Output> {
        self.tmux().args(args).output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BackendError::Unavailable(format!("{} not found", self.binary))
            } else {
                BackendError::Io(e)
            }
        })
    }

    fn has_session(&self, session: &SessionId) -> BackendResult<bool> {
        let out = self.run(&strings(&["has-session", "-t", &exact(session)]))?;
        Ok(out.status.success())
    }

    /// `display-message` for the session's pane; `None` once the session is gone.
    fn pane_format(&self, session: &SessionId, format: &str) -> BackendResult<Option<String>> {
        let out = self.run(&strings(&["display-message", "-p", "-t", session.as_str(), format]))?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    fn marker_path(&self, session: &SessionId) -> PathBuf {
        self.marker_dir.join(format!("{}.failed", session))
    }

    /// tmux command sequence that starts the server and the session.
    fn spawn_args(&self, session: &SessionId, command: &CommandLine) -> Vec<String> {
        let mut args = strings(&["start-server", ";"]);
        if self.exit_channel == ExitChannel::PaneStatus {
            args.extend(strings(&["set-option", "-g", "remain-on-exit", "on", ";"]));
        }
        args.extend(strings(&["set-option", "-g", "history-limit"]));
        args.push(self.history_limit.to_string());
        args.push(";".to_string());
        args.extend(strings(&["new-session", "-d", "-s", session.as_str()]));

        let argv = match self.exit_channel {
            ExitChannel::PaneStatus => command.argv(),
            ExitChannel::Marker => {
                let mut wrapped = strings(&["sh", "-c", MARKER_WRAPPER, "sh"]);
                wrapped.push(self.marker_path(session).to_string_lossy().into_owned());
                wrapped.extend(command.argv());
                wrapped
            }
        };
        args.extend(argv.iter().map(|a| escape_separator(a)));
        args
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn exact(session: &SessionId) -> String {
    format!("={}", session)
}

/// tmux treats a trailing `;` on any argument as a command separator.
fn escape_separator(arg: &str) -> String {
    match arg.strip_suffix(';') {
        Some(head) => format!("{}\\;", head),
        None => arg.to_string(),
    }
}

fn stderr_of(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).trim().to_string()
}

impl ExecutionBackend for TmuxBackend {
    fn name(&self) -> &'static str {
        "tmux"
    }

    fn spawn(&self, session: &SessionId, command: &CommandLine) -> BackendResult<SessionHandle> {
        if let Some(parent) = self.socket.parent() {
            fs::create_dir_all(parent)?;
        }
        if self.exit_channel == ExitChannel::Marker {
            fs::create_dir_all(&self.marker_dir)?;
            let marker = self.marker_path(session);
            if marker.exists() {
                fs::remove_file(&marker)?;
            }
        }

        if self.has_session(session)? {
            tracing::warn!(session = %session, "replacing leftover tmux session");
            self.cleanup(session)?;
        }

        let out = self.run(&self.spawn_args(session, command))?;
        if !out.status.success() {
            return Err(BackendError::SpawnFailed {
                session: session.to_string(),
                reason: stderr_of(&out),
            });
        }

        let pid = self
            .pane_format(session, "#{pane_pid}")?
            .and_then(|raw| raw.parse().ok());
        tracing::debug!(session = %session, socket = %self.socket.display(), ?pid, "tmux session started");

        Ok(SessionHandle {
            session: session.clone(),
            pid,
        })
    }

    fn is_alive(&self, session: &SessionId) -> BackendResult<bool> {
        match self.exit_channel {
            ExitChannel::PaneStatus => Ok(self.pane_format(session, "#{pane_dead}")?.as_deref() == Some("0")),
            ExitChannel::Marker => self.has_session(session),
        }
    }

    fn capture_output(&self, session: &SessionId) -> BackendResult<String> {
        let out = self.run(&strings(&["capture-pane", "-p", "-J", "-S", "-", "-t", session.as_str()]))?;
        if out.status.success() {
            return Ok(String::from_utf8_lossy(&out.stdout).into_owned());
        }

        // Session already gone: the marker holds whatever the wrapper saved.
        match fs::read(self.marker_path(session)) {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BackendError::UnknownSession(session.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn exit_code(&self, session: &SessionId) -> BackendResult<Option<i32>> {
        if self.exit_channel != ExitChannel::PaneStatus {
            return Ok(None);
        }
        let raw = self.pane_format(session, "#{pane_dead} #{pane_dead_status}")?;
        Ok(raw.and_then(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("1"), Some(code)) => code.parse().ok(),
                _ => None,
            }
        }))
    }

    fn failure_marker(&self, session: &SessionId) -> Option<PathBuf> {
        match self.exit_channel {
            ExitChannel::Marker => Some(self.marker_path(session)),
            ExitChannel::PaneStatus => None,
        }
    }

    fn cleanup(&self, session: &SessionId) -> BackendResult<()> {
        let out = self.run(&strings(&["kill-session", "-t", &exact(session)]))?;
        if !out.status.success() {
            tracing::debug!(session = %session, stderr = %stderr_of(&out), "kill-session found nothing to kill");
        }
        let marker = self.marker_path(session);
        if marker.exists() {
            fs::remove_file(&marker)?;
        }
        Ok(())
    }
}
