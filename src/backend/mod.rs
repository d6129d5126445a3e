//! Execution backends
//!
//! A backend starts a job's command in an isolated session that can be
//! inspected while it runs. The scheduler never gets a completion callback;
//! it polls [`ExecutionBackend::is_alive`] and then asks for the outcome.
//!
//! Outcome resolution, in order:
//! 1. a real exit code from [`ExecutionBackend::exit_code`]
//! 2. the failure marker file, for backends that can only signal failure by
//!    writing one ([`ExecutionBackend::failure_marker`])
//! 3. otherwise the run is reported as failed, since nothing vouches for it

mod process;
mod tmux;

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::{CommandLine, SessionId};

pub use process::ProcessBackend;
pub use tmux::{ExitChannel, TmuxBackend};

/// Backend result type
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors from backend operations
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("failed to start session {session}: {reason}")]
    SpawnFailed { session: String, reason: String },

    #[error("unknown session {0}")]
    UnknownSession(String),

    #[error("backend command failed: {0}")]
    CommandFailed(String),
}

/// Which backend implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Detached tmux session, attachable by operators
    #[default]
    Tmux,
    /// Plain child process with output redirected to a file
    Process,
}

/// Returned by [`ExecutionBackend::spawn`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub session: SessionId,
    /// Process id, when the backend knows it
    pub pid: Option<u32>,
}

/// How a finished session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Succeeded,
    Failed {
        exit_code: Option<i32>,
        reason: String,
    },
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SessionOutcome::Succeeded)
    }
}

/// Capability surface the scheduler depends on.
pub trait ExecutionBackend: Send {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Start `command` in a new session named `session`. Must not block on
    /// the command itself.
    fn spawn(&self, session: &SessionId, command: &CommandLine) -> BackendResult<SessionHandle>;

    /// Whether the session's command is still running.
    fn is_alive(&self, session: &SessionId) -> BackendResult<bool>;

    /// Everything the command has printed so far.
    fn capture_output(&self, session: &SessionId) -> BackendResult<String>;

    /// Exit code of a finished command, if the backend exposes one.
    fn exit_code(&self, _session: &SessionId) -> BackendResult<Option<i32>> {
        Ok(None)
    }

    /// File whose presence after the run means the command failed, for
    /// backends without an exit code channel.
    fn failure_marker(&self, _session: &SessionId) -> Option<PathBuf> {
        None
    }

    /// Release anything the session still holds, ending it if it is still
    /// running.
    fn cleanup(&self, _session: &SessionId) -> BackendResult<()> {
        Ok(())
    }
}

impl<B: ExecutionBackend + ?Sized> ExecutionBackend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn spawn(&self, session: &SessionId, command: &CommandLine) -> BackendResult<SessionHandle> {
        (**self).spawn(session, command)
    }

    fn is_alive(&self, session: &SessionId) -> BackendResult<bool> {
        (**self).is_alive(session)
    }

    fn capture_output(&self, session: &SessionId) -> BackendResult<String> {
        (**self).capture_output(session)
    }

    fn exit_code(&self, session: &SessionId) -> BackendResult<Option<i32>> {
        (**self).exit_code(session)
    }

    fn failure_marker(&self, session: &SessionId) -> Option<PathBuf> {
        (**self).failure_marker(session)
    }

    fn cleanup(&self, session: &SessionId) -> BackendResult<()> {
        (**self).cleanup(session)
    }
}

/// Decide how a finished session ended.
pub fn resolve_outcome(backend: &dyn ExecutionBackend, session: &SessionId) -> BackendResult<SessionOutcome> {
    if let Some(code) = backend.exit_code(session)? {
        return Ok(if code == 0 {
            SessionOutcome::Succeeded
        } else {
            SessionOutcome::Failed {
                exit_code: Some(code),
                reason: format!("exit code {}", code),
            }
        });
    }

    match backend.failure_marker(session) {
        Some(marker) if marker.exists() => Ok(SessionOutcome::Failed {
            exit_code: None,
            reason: format!("failure marker {} present", marker.display()),
        }),
        Some(_) => Ok(SessionOutcome::Succeeded),
        None => Ok(SessionOutcome::Failed {
            exit_code: None,
            reason: "session ended without reporting an exit status".to_string(),
        }),
    }
}
