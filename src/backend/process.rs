//! Plain child-process backend
//!
//! Runs the command directly with stdout and stderr appended to
//! `<output_dir>/<session>.out`. Exit codes come straight from the OS.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Mutex;

use crate::command::{CommandLine, SessionId};
use crate::signal::exit_code;

use super::{BackendError, BackendResult, ExecutionBackend, SessionHandle};

struct ProcessSession {
    child: Child,
    output_path: PathBuf,
    exit: Option<ExitStatus>,
}

/// Child-process backend
pub struct ProcessBackend {
    output_dir: PathBuf,
    sessions: Mutex<HashMap<String, ProcessSession>>,
}

impl ProcessBackend {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// File the session's output goes to
    pub fn output_path(&self, session: &SessionId) -> PathBuf {
        self.output_dir.join(format!("{}.out", session))
    }

    fn sessions(&self) -> BackendResult<std::sync::MutexGuard<'_, HashMap<String, ProcessSession>>> {
        self.sessions
            .lock()
            .map_err(|_| BackendError::Unavailable("session table poisoned".to_string()))
    }
}

fn read_lossy(path: &Path) -> BackendResult<String> {
    match fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

impl ExecutionBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    fn spawn(&self, session: &SessionId, command: &CommandLine) -> BackendResult<SessionHandle> {
        let mut sessions = self.sessions()?;
        if let Some(existing) = sessions.get_mut(session.as_str()) {
            if existing.child.try_wait()?.is_none() {
                return Err(BackendError::SpawnFailed {
                    session: session.to_string(),
                    reason: "a session with this name is still running".to_string(),
                });
            }
        }

        fs::create_dir_all(&self.output_dir)?;
        let output_path = self.output_path(session);
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&output_path)?;
        let stderr = stdout.try_clone()?;

        let child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| BackendError::SpawnFailed {
                session: session.to_string(),
                reason: format!("{}: {}", command.program, e),
            })?;

        let pid = child.id();
        sessions.insert(
            session.as_str().to_string(),
            ProcessSession {
                child,
                output_path,
                exit: None,
            },
        );

        Ok(SessionHandle {
            session: session.clone(),
            pid: Some(pid),
        })
    }

    fn is_alive(&self, session: &SessionId) -> BackendResult<bool> {
        let mut sessions = self.sessions()?;
        let entry = sessions
            .get_mut(session.as_str())
            .ok_or_else(|| BackendError::UnknownSession(session.to_string()))?;
        if entry.exit.is_none() {
            entry.exit = entry.child.try_wait()?;
        }
        Ok(entry.exit.is_none())
    }

    fn capture_output(&self, session: &SessionId) -> BackendResult<String> {
        let path = {
            let sessions = self.sessions()?;
            sessions
                .get(session.as_str())
                .map(|s| s.output_path.clone())
                .unwrap_or_else(|| self.output_path(session))
        };
        read_lossy(&path)
    }

    fn exit_code(&self, session: &SessionId) -> BackendResult<Option<i32>> {
        let sessions = self.sessions()?;
        Ok(sessions
            .get(session.as_str())
            .and_then(|s| s.exit.as_ref())
            .map(exit_code))
    }

    fn cleanup(&self, session: &SessionId) -> BackendResult<()> {
        let mut sessions = self.sessions()?;
        if let Some(mut entry) = sessions.remove(session.as_str()) {
            if entry.exit.is_none() && entry.child.try_wait()?.is_none() {
                tracing::warn!(session = %session, pid = entry.child.id(), "killing session that is still running");
                if let Err(e) = entry.child.kill() {
                    // Keep tracking it so a later cleanup can try again.
                    sessions.insert(session.as_str().to_string(), entry);
                    return Err(e.into());
                }
                entry.child.wait()?;
            }
        }
        Ok(())
    }
}
