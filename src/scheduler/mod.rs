//! The scheduler loop
//!
//! One thread, one job at a time. Each iteration:
//!
//! 1. stop if shutdown was requested, skip if paused
//! 2. take the oldest pending job, or back off when there is none
//! 3. acquire the resource lock (bounded wait)
//! 4. mark the job RUNNING, notify `started`
//! 5. start it through the backend and poll until it exits
//! 6. mark it COMPLETED or FAILED, notify
//! 7. release the lock (guard drop, so also on every error path)
//!
//! The lock is taken before the RUNNING transition, so a job is only ever
//! RUNNING while the lock is held. Pause and shutdown are only looked at
//! between jobs.

mod backoff;
mod tally;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use gpuq_lock::{holder_alive, AwaitOutcome, HolderInfo, HolderKind, LockError, LockGuard, ResourceLock};
use thiserror::Error;

use crate::backend::{resolve_outcome, BackendError, ExecutionBackend, SessionOutcome};
use crate::command::{CommandLine, CommandTemplate, SessionId};
use crate::job::{Job, JobFilter, JobId};
use crate::notify::{deliver, JobEvent, NotificationSink};
use crate::signal::ControlState;
use crate::state::JobStatus;
use crate::store::{JobStore, StoreError};

pub use backoff::{describe_wait, Backoff, DEFAULT_ESCALATE_AFTER, DEFAULT_IDLE_TIERS};
pub use tally::{DailySummary, DailyTally};

/// Message recorded for jobs found RUNNING at startup
pub const INTERRUPTED_MESSAGE: &str = "interrupted: scheduler restarted while job was running";

/// Scheduler result type
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors that stop or disturb the scheduler loop
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job store error: {0}")]
    Store(#[from] StoreError),

    #[error("resource lock error: {0}")]
    Lock(#[from] LockError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("another scheduler (pid {pid}) is already running job {job_id:?}")]
    AlreadyRunning { pid: u32, job_id: Option<JobId> },

    #[error("giving up after {failures} consecutive storage failures; last: {last}")]
    StorageExhausted { failures: u32, last: String },
}

impl SchedulerError {
    /// Errors worth retrying a bounded number of times
    pub fn is_storage_failure(&self) -> bool {
        match self {
            SchedulerError::Store(e) => e.is_storage_failure(),
            _ => false,
        }
    }
}

/// Timing and policy knobs
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub idle_tiers: Vec<Duration>,
    pub escalate_after: u32,
    pub paused_poll: Duration,
    pub completion_poll: Duration,
    pub lock_poll: Duration,
    /// `None` waits for the lock indefinitely
    pub lock_timeout: Option<Duration>,
    pub max_storage_failures: u32,
    pub reclaim_stale_lock: bool,
    /// Where output of failed jobs is saved
    pub session_log_dir: PathBuf,
    /// Recorded as the lock holder
    pub holder_user: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            idle_tiers: DEFAULT_IDLE_TIERS.iter().map(|s| Duration::from_secs(*s)).collect(),
            escalate_after: DEFAULT_ESCALATE_AFTER,
            paused_poll: Duration::from_secs(5),
            completion_poll: Duration::from_secs(5),
            lock_poll: Duration::from_secs(5),
            lock_timeout: Some(Duration::from_secs(600)),
            max_storage_failures: 5,
            reclaim_stale_lock: false,
            session_log_dir: PathBuf::from("logs").join("sessions"),
            holder_user: whoami::username(),
        }
    }
}

/// What one call to [`Scheduler::run_once`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Iteration {
    ShutdownRequested,
    Paused,
    /// Queue empty; wait this long before checking again
    Idle { wait: Duration },
    /// A job is waiting but the resource stayed busy
    LockUnavailable { job_id: JobId },
    /// The job was removed or changed by someone else before it started
    Skipped { job_id: JobId },
    Executed { job_id: JobId, status: JobStatus },
}

/// Dequeues and runs jobs one at a time
pub struct Scheduler<B, N> {
    store: JobStore,
    lock: ResourceLock,
    backend: B,
    sink: N,
    template: CommandTemplate,
    control: Arc<ControlState>,
    settings: SchedulerSettings,
    backoff: Backoff,
    tally: DailyTally,
    last_pending: Option<u64>,
}

impl<B: ExecutionBackend, N: NotificationSink> Scheduler<B, N> {
    pub fn new(store: JobStore, lock: ResourceLock, backend: B, sink: N, control: Arc<ControlState>) -> Self {
        let settings = SchedulerSettings::default();
        Self {
            store,
            lock,
            backend,
            sink,
            template: CommandTemplate::default(),
            control,
            backoff: Backoff::new(settings.idle_tiers.clone(), settings.escalate_after),
            settings,
            tally: DailyTally::new(Local::now().date_naive()),
            last_pending: None,
        }
    }

    pub fn with_settings(mut self, settings: SchedulerSettings) -> Self {
        self.backoff = Backoff::new(settings.idle_tiers.clone(), settings.escalate_after);
        self.settings = settings;
        self
    }

    pub fn with_template(mut self, template: CommandTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn control(&self) -> &Arc<ControlState> {
        &self.control
    }

    pub fn tally(&self) -> DailySummary {
        self.tally.summary()
    }

    /// Run until shutdown is requested.
    ///
    /// Returns an error only for conditions the loop cannot ride out:
    /// another live scheduler at startup, or storage failing
    /// `max_storage_failures` times in a row.
    pub fn run(&mut self) -> SchedulerResult<()> {
        self.recover()?;
        tracing::info!(
            pid = std::process::id(),
            backend = self.backend.name(),
            lock = %self.lock.path().display(),
            "scheduler started"
        );

        let mut storage_failures = 0u32;
        loop {
            match self.run_once() {
                Ok(iteration) => {
                    storage_failures = 0;
                    match iteration {
                        Iteration::ShutdownRequested => break,
                        Iteration::Paused => {
                            self.control.sleep(self.settings.paused_poll);
                        }
                        Iteration::Idle { wait } => self.idle_wait(wait),
                        Iteration::LockUnavailable { .. } => {
                            self.control.sleep(self.backoff.first());
                        }
                        Iteration::Executed { .. } | Iteration::Skipped { .. } => {}
                    }
                }
                Err(e) if e.is_storage_failure() => {
                    storage_failures += 1;
                    tracing::error!(error = %e, storage_failures, "storage failure");
                    if storage_failures >= self.settings.max_storage_failures {
                        return Err(SchedulerError::StorageExhausted {
                            failures: storage_failures,
                            last: e.to_string(),
                        });
                    }
                    self.control.sleep(self.backoff.first());
                }
                Err(SchedulerError::Store(e)) => {
                    tracing::warn!(error = %e, "job store rejected a request; continuing");
                    self.control.sleep(self.backoff.first());
                }
                Err(SchedulerError::Lock(e)) => {
                    tracing::warn!(error = %e, "resource lock unreadable");
                    self.control.sleep(self.backoff.first());
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(today = %self.tally.summary(), "scheduler stopped");
        Ok(())
    }

    /// One pass of the loop. Never sleeps except while waiting for the lock
    /// or for a running job.
    pub fn run_once(&mut self) -> SchedulerResult<Iteration> {
        if let Err(e) = self.control.refresh() {
            tracing::warn!(error = %e, "failed to read control directory");
        }
        if self.control.is_shutdown_requested() {
            tracing::info!("shutdown requested; not starting new jobs");
            return Ok(Iteration::ShutdownRequested);
        }
        if self.control.is_paused() {
            tracing::debug!("paused; not dequeuing");
            return Ok(Iteration::Paused);
        }

        if let Some(summary) = self.tally.roll_over(Local::now().date_naive()) {
            tracing::info!(%summary, "daily summary");
        }

        let Some(job) = self.store.next_pending()? else {
            let wait = self.backoff.record_empty();
            tracing::info!(
                empty_checks = self.backoff.empty_checks(),
                next_check = %describe_wait(wait),
                "no pending jobs"
            );
            return Ok(Iteration::Idle { wait });
        };
        self.backoff.reset();

        let Some(guard) = self.acquire_lock(&job)? else {
            return Ok(Iteration::LockUnavailable { job_id: job.id });
        };

        self.execute(job, guard)
    }

    fn holder_for(&self, job: &Job) -> HolderInfo {
        HolderInfo::new(
            self.settings.holder_user.clone(),
            job.program.clone(),
            std::process::id(),
            HolderKind::Scheduled,
            Some(job.id),
        )
    }

    fn acquire_lock(&self, job: &Job) -> SchedulerResult<Option<LockGuard>> {
        if let Some(guard) = self.lock.try_guard(self.holder_for(job))? {
            return Ok(Some(guard));
        }

        let control = Arc::clone(&self.control);
        let outcome = self.lock.await_free(self.settings.lock_poll, self.settings.lock_timeout, &|| {
            control.is_shutdown_requested()
        });
        match outcome {
            AwaitOutcome::Free => Ok(self.lock.try_guard(self.holder_for(job))?),
            AwaitOutcome::TimedOut => {
                tracing::warn!(job_id = job.id, "resource still busy; job stays pending");
                Ok(None)
            }
            AwaitOutcome::Cancelled => Ok(None),
        }
    }

    /// Run a dequeued job to completion while holding `guard`.
    fn execute(&mut self, job: Job, guard: LockGuard) -> SchedulerResult<Iteration> {
        let job = match self.store.transition(job.id, JobStatus::Running, None) {
            Ok(job) => job,
            Err(e) if e.is_storage_failure() => return Err(e.into()),
            Err(e) => {
                tracing::warn!(job_id = job.id, error = %e, "job changed before it could start; skipping");
                return Ok(Iteration::Skipped { job_id: job.id });
            }
        };
        self.tally.record_started();
        tracing::info!(
            job_id = job.id,
            program = %job.program,
            parameters = %job.parameters.to_json(),
            "processing job"
        );
        deliver(&self.sink, JobEvent::Started, &job, None);

        let session = SessionId::for_job(job.id);
        let (status, message) = match self.supervise(&job, &session) {
            Ok(SessionOutcome::Succeeded) => (JobStatus::Completed, None),
            Ok(SessionOutcome::Failed { exit_code, reason }) => {
                let log = self.save_output(&session);
                let message = match exit_code {
                    Some(code) => format!("Job failed with exit code {}. See log: {}", code, log),
                    None => format!("Job failed ({}). See log: {}", reason, log),
                };
                (JobStatus::Failed, Some(message))
            }
            Err(e) => {
                let log = self.save_output(&session);
                (JobStatus::Failed, Some(format!("backend error: {}. See log: {}", e, log)))
            }
        };

        // The session must be gone before the lock is given up.
        if let Err(e) = self.backend.cleanup(&session) {
            tracing::error!(job_id = job.id, session = %session, error = %e, "session cleanup failed");
        }

        let finished = self.finalize(&job, status, message.as_deref())?;
        drop(guard);
        tracing::info!(job_id = job.id, "resource lock released");

        self.tally.record_finished(status);
        match status {
            JobStatus::Completed => {
                tracing::info!(job_id = job.id, "job completed successfully");
                deliver(&self.sink, JobEvent::Completed, &finished, None);
            }
            _ => {
                tracing::error!(job_id = job.id, error = message.as_deref().unwrap_or(""), "job failed");
                deliver(&self.sink, JobEvent::Failed, &finished, message.as_deref());
            }
        }
        Ok(Iteration::Executed { job_id: job.id, status })
    }

    fn supervise(&self, job: &Job, session: &SessionId) -> Result<SessionOutcome, BackendError> {
        let command = CommandLine::for_job(job, &self.template);
        tracing::info!(job_id = job.id, session = %session, command = %command.display(), "starting session");

        self.backend.spawn(session, &command)?;
        while self.backend.is_alive(session)? {
            std::thread::sleep(self.settings.completion_poll);
        }
        resolve_outcome(&self.backend, session)
    }

    /// Record the terminal status, retrying storage failures while the lock
    /// is still held so no other job can start meanwhile.
    ///
    /// A record that was deleted or already finalized elsewhere (for
    /// example by `gpuq clear`) is logged and reported from memory.
    fn finalize(&mut self, job: &Job, status: JobStatus, message: Option<&str>) -> SchedulerResult<Job> {
        let id = job.id;
        let mut failures = 0u32;
        loop {
            match self.store.transition(id, status, message) {
                Ok(job) => return Ok(job),
                Err(e) if e.is_storage_failure() => {
                    failures += 1;
                    tracing::error!(job_id = id, error = %e, failures, "could not record job outcome");
                    if failures >= self.settings.max_storage_failures {
                        return Err(SchedulerError::StorageExhausted {
                            failures,
                            last: e.to_string(),
                        });
                    }
                    std::thread::sleep(self.settings.completion_poll);
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = id,
                        error = %e,
                        "job record vanished or was already finalized; jobs appear to have been cleared"
                    );
                    return Ok(Job {
                        status,
                        completed_at: Some(Utc::now()),
                        error_message: message.map(str::to_string),
                        ..job.clone()
                    });
                }
            }
        }
    }

    /// Save whatever the session printed; returns the path (or a note when
    /// saving failed) for the error message.
    fn save_output(&self, session: &SessionId) -> String {
        let output = self
            .backend
            .capture_output(session)
            .unwrap_or_else(|e| format!("<output unavailable: {}>\n", e));
        let path = session_log_path(&self.settings.session_log_dir, session);

        let written = fs::create_dir_all(&self.settings.session_log_dir).and_then(|_| fs::write(&path, output));
        match written {
            Ok(()) => path.display().to_string(),
            Err(e) => {
                tracing::warn!(session = %session, path = %path.display(), error = %e, "could not save session output");
                format!("<not saved: {}>", e)
            }
        }
    }

    /// Startup checks: refuse to run beside a live scheduler, deal with a
    /// stale lock, and fail jobs a previous scheduler left RUNNING.
    pub fn recover(&mut self) -> SchedulerResult<()> {
        match self.lock.current_holder() {
            Ok(Some(holder)) if holder.ctype == HolderKind::Scheduled => match holder_alive(&holder) {
                Some(true) if holder.pid != std::process::id() => {
                    return Err(SchedulerError::AlreadyRunning {
                        pid: holder.pid,
                        job_id: holder.job_id,
                    });
                }
                Some(false) => {
                    tracing::warn!(
                        pid = holder.pid,
                        job_id = ?holder.job_id,
                        acquired_at = %holder.acquired_at,
                        "resource lock left behind by a scheduler that is no longer running"
                    );
                    if self.settings.reclaim_stale_lock && self.lock.release_if_holder(&holder)? {
                        tracing::warn!("stale resource lock reclaimed");
                    }
                }
                _ => {}
            },
            Ok(Some(holder)) => {
                tracing::info!(user = %holder.holder_user, command = %holder.command, "resource currently held interactively");
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "resource lock record unreadable"),
        }

        for job in self.store.running()? {
            tracing::warn!(job_id = job.id, "job was left running by a previous scheduler; marking failed");
            let failed = self.store.transition(job.id, JobStatus::Failed, Some(INTERRUPTED_MESSAGE))?;
            deliver(&self.sink, JobEvent::Failed, &failed, Some(INTERRUPTED_MESSAGE));
        }
        Ok(())
    }

    /// Sleep through an idle period, waking early when jobs appear or
    /// shutdown is requested. Queue size changes are logged as they happen.
    fn idle_wait(&mut self, wait: Duration) {
        let step = self.backoff.first().min(wait);
        let mut remaining = wait;
        while !remaining.is_zero() {
            let chunk = step.min(remaining);
            if !self.control.sleep(chunk) {
                return;
            }
            remaining = remaining.saturating_sub(chunk);
            if self.observe_queue() > 0 {
                return;
            }
        }
    }

    /// Log changes in the number of pending jobs; returns the current count.
    fn observe_queue(&mut self) -> u64 {
        let pending = match self.store.count_by_status() {
            Ok(counts) => counts.pending,
            Err(e) => {
                tracing::warn!(error = %e, "could not count pending jobs");
                return 0;
            }
        };
        let previous = self.last_pending.replace(pending).unwrap_or(0);

        if pending > previous {
            let newest = self
                .store
                .list_all(&JobFilter::all().with_status(JobStatus::Pending))
                .ok()
                .and_then(|jobs| jobs.into_iter().next());
            tracing::info!(
                added = pending - previous,
                pending,
                owner = newest.as_ref().and_then(|j| j.owner_user.as_deref()).unwrap_or("unknown"),
                notify = newest.as_ref().and_then(|j| j.notify_address.as_deref()).unwrap_or("-"),
                "job(s) added to queue"
            );
        } else if pending < previous {
            tracing::info!(from = previous, to = pending, "queue size decreased");
            if pending == 0 {
                tracing::info!("queue appears to have been cleared; waiting for new jobs");
            }
        }
        pending
    }
}

/// `<dir>/<session>_<YYYYmmdd_HHMMSS>.log`
pub fn session_log_path(dir: &Path, session: &SessionId) -> PathBuf {
    dir.join(format!("{}_{}.log", session, Local::now().format("%Y%m%d_%H%M%S")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewJob;
    use crate::mock::{FakeBackend, FakeRun, RecordingSink};
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        backend: FakeBackend,
        sink: RecordingSink,
        scheduler: Scheduler<FakeBackend, RecordingSink>,
        lock: ResourceLock,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let backend = FakeBackend::new();
        let sink = RecordingSink::new();
        let lock = ResourceLock::new(dir.path().join("gpu_lock.json"));
        let settings = SchedulerSettings {
            completion_poll: Duration::from_millis(1),
            lock_poll: Duration::from_millis(5),
            lock_timeout: Some(Duration::from_millis(30)),
            session_log_dir: dir.path().join("sessions"),
            holder_user: "runner".into(),
            ..SchedulerSettings::default()
        };
        let scheduler = Scheduler::new(
            JobStore::open_in_memory().unwrap(),
            lock.clone(),
            backend.clone(),
            sink.clone(),
            Arc::new(ControlState::new()),
        )
        .with_settings(settings);
        Harness {
            _dir: dir,
            backend,
            sink,
            scheduler,
            lock,
        }
    }

    fn enqueue(h: &mut Harness, program: &str) -> JobId {
        h.scheduler
            .store
            .enqueue(&NewJob::new(program, "/usr/bin/python3"))
            .unwrap()
    }

    #[test]
    fn test_idle_iteration_backs_off() {
        let mut h = harness();
        let waits: Vec<Iteration> = (0..4).map(|_| h.scheduler.run_once().unwrap()).collect();
        assert_eq!(waits[0], Iteration::Idle { wait: Duration::from_secs(30) });
        assert_eq!(waits[3], Iteration::Idle { wait: Duration::from_secs(300) });
    }

    #[test]
    fn test_successful_job() {
        let mut h = harness();
        let id = enqueue(&mut h, "/jobs/train.py");

        let iteration = h.scheduler.run_once().unwrap();
        assert_eq!(iteration, Iteration::Executed { job_id: id, status: JobStatus::Completed });

        let job = h.scheduler.store().get(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error_message.is_none());
        assert!(!h.lock.is_held());
        assert_eq!(h.sink.events_for(id), vec![JobEvent::Started, JobEvent::Completed]);
        assert_eq!(h.backend.cleaned(), vec![SessionId::for_job(id)]);
        assert_eq!(h.scheduler.tally().completed, 1);
    }

    #[test]
    fn test_failed_job_records_exit_code_and_log() {
        let mut h = harness();
        let id = enqueue(&mut h, "/jobs/crash.py");
        h.backend
            .script(&SessionId::for_job(id), FakeRun::exits(1).with_output("Traceback: boom"));

        h.scheduler.run_once().unwrap();

        let job = h.scheduler.store().get(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let message = job.error_message.unwrap();
        assert!(message.starts_with("Job failed with exit code 1. See log: "), "{}", message);
        let log_path = message.rsplit("See log: ").next().unwrap();
        assert_eq!(fs::read_to_string(log_path).unwrap(), "Traceback: boom");
        assert!(!h.lock.is_held());
    }

    #[test]
    fn test_spawn_error_fails_job_and_releases_lock() {
        let mut h = harness();
        let id = enqueue(&mut h, "/jobs/a.py");
        h.backend.fail_spawn(&SessionId::for_job(id), "no server");

        let iteration = h.scheduler.run_once().unwrap();
        assert_eq!(iteration, Iteration::Executed { job_id: id, status: JobStatus::Failed });

        let job = h.scheduler.store().get(id).unwrap().unwrap();
        assert!(job.error_message.unwrap().starts_with("backend error:"));
        assert!(!h.lock.is_held());
    }

    #[test]
    fn test_backend_error_mid_run_ends_session_before_release() {
        let mut h = harness();
        let id = enqueue(&mut h, "/jobs/a.py");
        let session = SessionId::for_job(id);
        h.backend.script(&session, FakeRun::succeeds().with_polls(10));
        h.backend.fail_poll(&session, "tmux server vanished");

        let iteration = h.scheduler.run_once().unwrap();
        assert_eq!(iteration, Iteration::Executed { job_id: id, status: JobStatus::Failed });

        let job = h.scheduler.store().get(id).unwrap().unwrap();
        assert!(job.error_message.unwrap().contains("tmux server vanished"));
        assert_eq!(h.backend.killed(), vec![session], "running session is ended, not orphaned");
        assert!(!h.lock.is_held());
    }

    #[test]
    fn test_job_removed_before_start_is_skipped() {
        let mut h = harness();
        let id = enqueue(&mut h, "/jobs/a.py");
        let job = h.scheduler.store().get(id).unwrap().unwrap();
        h.scheduler.store.clear().unwrap();

        let guard = h
            .lock
            .try_guard(HolderInfo::new("runner", "/jobs/a.py", std::process::id(), HolderKind::Scheduled, Some(id)))
            .unwrap()
            .unwrap();
        assert_eq!(h.scheduler.execute(job, guard).unwrap(), Iteration::Skipped { job_id: id });
        assert!(!h.lock.is_held());
        assert!(h.backend.spawned().is_empty());
        assert!(h.sink.events().is_empty());
    }

    #[test]
    fn test_busy_lock_leaves_job_pending() {
        let mut h = harness();
        let id = enqueue(&mut h, "/jobs/a.py");
        let other = HolderInfo::new("bob", "notebook.py", std::process::id(), HolderKind::Interactive, None);
        assert!(h.lock.acquire(&other).unwrap());

        let iteration = h.scheduler.run_once().unwrap();
        assert_eq!(iteration, Iteration::LockUnavailable { job_id: id });
        assert_eq!(h.scheduler.store().get(id).unwrap().unwrap().status, JobStatus::Pending);
        assert!(h.backend.spawned().is_empty());
        assert_eq!(h.lock.current_holder().unwrap().unwrap().holder_user, "bob");
    }

    #[test]
    fn test_shutdown_and_pause_checked_first() {
        let mut h = harness();
        enqueue(&mut h, "/jobs/a.py");

        h.scheduler.control().toggle_pause().unwrap();
        assert_eq!(h.scheduler.run_once().unwrap(), Iteration::Paused);
        h.scheduler.control().request_shutdown();
        assert_eq!(h.scheduler.run_once().unwrap(), Iteration::ShutdownRequested);
        assert!(h.backend.spawned().is_empty());
    }

    #[test]
    fn test_recover_fails_orphaned_running_jobs() {
        let mut h = harness();
        let id = enqueue(&mut h, "/jobs/a.py");
        h.scheduler.store.transition(id, JobStatus::Running, None).unwrap();

        h.scheduler.recover().unwrap();

        let job = h.scheduler.store().get(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
        assert_eq!(h.sink.events_for(id), vec![JobEvent::Failed]);
    }

    #[test]
    fn test_recover_refuses_live_scheduler() {
        let mut h = harness();
        // pid 1 is always alive
        let holder = HolderInfo::new("root", "/jobs/x.py", 1, HolderKind::Scheduled, Some(7));
        assert!(h.lock.acquire(&holder).unwrap());

        assert!(matches!(
            h.scheduler.recover(),
            Err(SchedulerError::AlreadyRunning { pid: 1, job_id: Some(7) })
        ));
    }

    #[test]
    fn test_session_log_path_layout() {
        let path = session_log_path(Path::new("/var/log/gpuq/sessions"), &SessionId::for_job(3));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("job_00003_"));
        assert!(name.ends_with(".log"));
    }
}
