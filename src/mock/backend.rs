//! Scripted execution backend

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::{BackendError, BackendResult, ExecutionBackend, SessionHandle};
use crate::command::{CommandLine, SessionId};

/// Called on every `is_alive` poll, before the answer is computed
pub type PollHook = Arc<dyn Fn(&SessionId) + Send + Sync>;

/// Scripted behaviour of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeRun {
    /// Number of `is_alive` polls answered with `true`
    pub polls: u32,
    /// Exit code reported once finished; `None` hides the exit code channel
    pub exit_code: Option<i32>,
    pub output: String,
    /// Write the failure marker (with `output`) when the run finishes
    pub writes_marker: bool,
}

impl FakeRun {
    pub fn succeeds() -> Self {
        Self {
            polls: 1,
            exit_code: Some(0),
            output: String::new(),
            writes_marker: false,
        }
    }

    pub fn exits(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::succeeds()
        }
    }

    pub fn with_polls(mut self, polls: u32) -> Self {
        self.polls = polls;
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn without_exit_code(mut self) -> Self {
        self.exit_code = None;
        self
    }

    pub fn writes_marker(mut self) -> Self {
        self.writes_marker = true;
        self
    }
}

impl Default for FakeRun {
    fn default() -> Self {
        Self::succeeds()
    }
}

#[derive(Debug)]
struct FakeSession {
    run: FakeRun,
    polls_left: u32,
    finished: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    scripts: HashMap<String, FakeRun>,
    default_run: FakeRun,
    spawn_errors: HashMap<String, String>,
    poll_errors: HashMap<String, String>,
    sessions: HashMap<String, FakeSession>,
    spawned: Vec<(SessionId, CommandLine)>,
    cleaned: Vec<SessionId>,
    killed: Vec<SessionId>,
}

/// In-memory backend with scripted sessions
#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
    marker_dir: Option<PathBuf>,
    poll_hook: Option<PollHook>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable the failure-marker channel, with markers under `dir`.
    pub fn with_marker_dir(mut self, dir: &Path) -> Self {
        self.marker_dir = Some(dir.to_path_buf());
        self
    }

    pub fn with_poll_hook(mut self, hook: impl Fn(&SessionId) + Send + Sync + 'static) -> Self {
        self.poll_hook = Some(Arc::new(hook));
        self
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Script the next run of `session`.
    pub fn script(&self, session: &SessionId, run: FakeRun) {
        self.lock().scripts.insert(session.as_str().to_string(), run);
    }

    /// Behaviour of sessions without a script
    pub fn set_default(&self, run: FakeRun) {
        self.lock().default_run = run;
    }

    /// Make `spawn` for `session` fail with `reason`.
    pub fn fail_spawn(&self, session: &SessionId, reason: impl Into<String>) {
        self.lock()
            .spawn_errors
            .insert(session.as_str().to_string(), reason.into());
    }

    /// Make `is_alive` for `session` fail with `reason` while it runs.
    pub fn fail_poll(&self, session: &SessionId, reason: impl Into<String>) {
        self.lock()
            .poll_errors
            .insert(session.as_str().to_string(), reason.into());
    }

    /// Sessions that were still running when cleaned up
    pub fn killed(&self) -> Vec<SessionId> {
        self.lock().killed.clone()
    }

    /// Every spawn so far, in order
    pub fn spawned(&self) -> Vec<(SessionId, CommandLine)> {
        self.lock().spawned.clone()
    }

    pub fn spawned_sessions(&self) -> Vec<SessionId> {
        self.lock().spawned.iter().map(|(s, _)| s.clone()).collect()
    }

    pub fn cleaned(&self) -> Vec<SessionId> {
        self.lock().cleaned.clone()
    }

    fn marker_path(&self, session: &SessionId) -> Option<PathBuf> {
        self.marker_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.failed", session)))
    }
}

impl ExecutionBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn spawn(&self, session: &SessionId, command: &CommandLine) -> BackendResult<SessionHandle> {
        let mut state = self.lock();
        if let Some(reason) = state.spawn_errors.get(session.as_str()) {
            return Err(BackendError::SpawnFailed {
                session: session.to_string(),
                reason: reason.clone(),
            });
        }
        if state
            .sessions
            .get(session.as_str())
            .is_some_and(|s| !s.finished)
        {
            return Err(BackendError::SpawnFailed {
                session: session.to_string(),
                reason: "session already running".to_string(),
            });
        }

        let run = state
            .scripts
            .remove(session.as_str())
            .unwrap_or_else(|| state.default_run.clone());
        state.sessions.insert(
            session.as_str().to_string(),
            FakeSession {
                polls_left: run.polls,
                run,
                finished: false,
            },
        );
        state.spawned.push((session.clone(), command.clone()));

        Ok(SessionHandle {
            session: session.clone(),
            pid: None,
        })
    }

    fn is_alive(&self, session: &SessionId) -> BackendResult<bool> {
        if let Some(hook) = &self.poll_hook {
            hook(session);
        }

        let marker = self.marker_path(session);
        let mut state = self.lock();
        if let Some(reason) = state.poll_errors.get(session.as_str()) {
            return Err(BackendError::CommandFailed(reason.clone()));
        }
        let entry = state
            .sessions
            .get_mut(session.as_str())
            .ok_or_else(|| BackendError::UnknownSession(session.to_string()))?;

        if entry.finished {
            return Ok(false);
        }
        if entry.polls_left > 0 {
            entry.polls_left -= 1;
            return Ok(true);
        }

        entry.finished = true;
        if entry.run.writes_marker {
            if let Some(marker) = marker {
                std::fs::write(marker, &entry.run.output)?;
            }
        }
        Ok(false)
    }

    fn capture_output(&self, session: &SessionId) -> BackendResult<String> {
        self.lock()
            .sessions
            .get(session.as_str())
            .map(|s| s.run.output.clone())
            .ok_or_else(|| BackendError::UnknownSession(session.to_string()))
    }

    fn exit_code(&self, session: &SessionId) -> BackendResult<Option<i32>> {
        Ok(self
            .lock()
            .sessions
            .get(session.as_str())
            .filter(|s| s.finished)
            .and_then(|s| s.run.exit_code))
    }

    fn failure_marker(&self, session: &SessionId) -> Option<PathBuf> {
        self.marker_path(session)
    }

    fn cleanup(&self, session: &SessionId) -> BackendResult<()> {
        let mut state = self.lock();
        let still_running = state
            .sessions
            .get_mut(session.as_str())
            .filter(|s| !s.finished)
            .map(|s| s.finished = true)
            .is_some();
        if still_running {
            state.killed.push(session.clone());
        }
        state.cleaned.push(session.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn cmd() -> CommandLine {
        CommandLine::new("python", vec!["job.py".into()])
    }

    #[test]
    fn test_polls_count_down() {
        let backend = FakeBackend::new();
        let session = SessionId::for_job(1);
        backend.script(&session, FakeRun::exits(2).with_polls(3));
        backend.spawn(&session, &cmd()).unwrap();

        assert_eq!(backend.exit_code(&session).unwrap(), None);
        let alive: Vec<bool> = (0..5).map(|_| backend.is_alive(&session).unwrap()).collect();
        assert_eq!(alive, vec![true, true, true, false, false]);
        assert_eq!(backend.exit_code(&session).unwrap(), Some(2));
    }

    #[test]
    fn test_poll_hook_runs_each_poll() {
        let counter = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&counter);
        let backend = FakeBackend::new().with_poll_hook(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let session = SessionId::for_job(2);
        backend.spawn(&session, &cmd()).unwrap();
        while backend.is_alive(&session).unwrap() {}

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_marker_written_on_finish() {
        let dir = TempDir::new().unwrap();
        let backend = FakeBackend::new().with_marker_dir(dir.path());
        let session = SessionId::for_job(3);
        backend.script(
            &session,
            FakeRun::succeeds().without_exit_code().writes_marker().with_output("Traceback"),
        );
        backend.spawn(&session, &cmd()).unwrap();
        while backend.is_alive(&session).unwrap() {}

        let marker = backend.failure_marker(&session).unwrap();
        assert_eq!(std::fs::read_to_string(marker).unwrap(), "Traceback");
    }

    #[test]
    fn test_spawn_failure_and_clones_share_state() {
        let backend = FakeBackend::new();
        let handle = backend.clone();
        let session = SessionId::for_job(4);
        handle.fail_spawn(&session, "tmux exploded");

        assert!(matches!(
            backend.spawn(&session, &cmd()),
            Err(BackendError::SpawnFailed { .. })
        ));
        backend.spawn(&SessionId::for_job(5), &cmd()).unwrap();
        assert_eq!(handle.spawned_sessions(), vec![SessionId::for_job(5)]);
    }
}
