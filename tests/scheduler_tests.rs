//! Scheduler Integration Tests
//!
//! End-to-end runs of the scheduler loop against a file-backed job store, a
//! real lock file and the scripted backend.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gpuq::job::{JobFilter, NewJob, Parameters};
use gpuq::mock::{FakeBackend, FakeRun, RecordingSink};
use gpuq::notify::JobEvent;
use gpuq::scheduler::{Iteration, Scheduler, SchedulerError, SchedulerSettings, INTERRUPTED_MESSAGE};
use gpuq::signal::ControlState;
use gpuq::{JobId, JobStatus, JobStore, ResourceLock, SessionId};
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    db_path: PathBuf,
    lock: ResourceLock,
    sink: RecordingSink,
    control: Arc<ControlState>,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("jobs.db");
        let lock = ResourceLock::new(dir.path().join("gpu_lock.json"));
        Self {
            dir,
            db_path,
            lock,
            sink: RecordingSink::new(),
            control: Arc::new(ControlState::new()),
        }
    }

    fn settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            idle_tiers: vec![Duration::from_millis(5)],
            completion_poll: Duration::from_millis(1),
            lock_poll: Duration::from_millis(5),
            lock_timeout: Some(Duration::from_millis(50)),
            paused_poll: Duration::from_millis(5),
            max_storage_failures: 2,
            session_log_dir: self.dir.path().join("sessions"),
            holder_user: "runner".to_string(),
            ..SchedulerSettings::default()
        }
    }

    fn store(&self) -> JobStore {
        JobStore::open(&self.db_path).unwrap()
    }

    fn scheduler(&self, backend: FakeBackend) -> Scheduler<FakeBackend, RecordingSink> {
        Scheduler::new(
            self.store(),
            self.lock.clone(),
            backend,
            self.sink.clone(),
            Arc::clone(&self.control),
        )
        .with_settings(self.settings())
    }

    fn enqueue(&self, program: &str) -> JobId {
        self.store()
            .enqueue(&NewJob::new(program, "/usr/bin/python3").with_owner("alice"))
            .unwrap()
    }

    fn status(&self, id: JobId) -> JobStatus {
        self.store().get(id).unwrap().unwrap().status
    }
}

// =============================================================================
// Scenario A: a single successful job
// =============================================================================

#[test]
fn test_single_job_runs_to_completion() {
    let fx = Fixture::new();
    let params = Parameters::from_json_str(r#"{"epochs": 5, "name": "run1"}"#).unwrap();
    let id = fx
        .store()
        .enqueue(&NewJob::new("/jobs/train.py", "/usr/bin/python3").with_parameters(params))
        .unwrap();

    let backend = FakeBackend::new();
    backend.script(&SessionId::for_job(id), FakeRun::succeeds().with_polls(3));
    let mut scheduler = fx.scheduler(backend.clone());

    let iteration = scheduler.run_once().unwrap();
    assert_eq!(iteration, Iteration::Executed { job_id: id, status: JobStatus::Completed });

    let job = fx.store().get(id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.started_at.is_some() && job.completed_at.is_some());
    assert!(job.error_message.is_none());
    assert!(!fx.lock.is_held(), "lock must be released after the job");

    let spawned = backend.spawned();
    assert_eq!(spawned.len(), 1);
    assert_eq!(spawned[0].0.as_str(), format!("job_{:05}", id));
    assert_eq!(
        spawned[0].1.argv(),
        vec!["/usr/bin/python3", "/jobs/train.py", "--from_sql", "--epochs", "5", "--name", "run1"]
    );

    let records = fx.sink.records();
    assert_eq!(fx.sink.events(), vec![(JobEvent::Started, id), (JobEvent::Completed, id)]);
    assert_eq!(records[0].status, JobStatus::Running);
    assert_eq!(records[1].status, JobStatus::Completed);
}

// =============================================================================
// Scenario B: status filtering after mixed outcomes
// =============================================================================

#[test]
fn test_listing_by_status_after_mixed_outcomes() {
    let fx = Fixture::new();
    let first = fx.enqueue("/jobs/a.py");
    let second = fx.enqueue("/jobs/b.py");
    let third = fx.enqueue("/jobs/c.py");

    let backend = FakeBackend::new();
    backend.script(&SessionId::for_job(second), FakeRun::exits(2));
    let mut scheduler = fx.scheduler(backend);
    for _ in 0..3 {
        scheduler.run_once().unwrap();
    }

    let store = fx.store();
    let failed = store.list_all(&JobFilter::all().with_status(JobStatus::Failed)).unwrap();
    assert_eq!(failed.iter().map(|j| j.id).collect::<Vec<_>>(), vec![second]);

    let completed = store.list_all(&JobFilter::all().with_status(JobStatus::Completed)).unwrap();
    assert_eq!(
        completed.iter().map(|j| j.id).collect::<Vec<_>>(),
        vec![third, first],
        "listing is newest first"
    );
    assert!(store.list_all(&JobFilter::all().with_status(JobStatus::Pending)).unwrap().is_empty());
    assert_eq!(scheduler.tally().total, 3);
    assert_eq!(scheduler.tally().failed, 1);
}

// =============================================================================
// Scenario C: a failing job releases the lock and the queue moves on
// =============================================================================

#[test]
fn test_failure_releases_lock_and_next_job_runs() {
    let fx = Fixture::new();
    let bad = fx.enqueue("/jobs/bad.py");
    let good = fx.enqueue("/jobs/good.py");

    let lock = fx.lock.clone();
    let held_during_run = Arc::new(AtomicBool::new(true));
    let held = Arc::clone(&held_during_run);
    let backend = FakeBackend::new().with_poll_hook(move |_| {
        if !lock.is_held() {
            held.store(false, Ordering::SeqCst);
        }
    });
    backend.script(
        &SessionId::for_job(bad),
        FakeRun::exits(1).with_polls(2).with_output("ValueError: bad input\n"),
    );
    let mut scheduler = fx.scheduler(backend);

    assert_eq!(
        scheduler.run_once().unwrap(),
        Iteration::Executed { job_id: bad, status: JobStatus::Failed }
    );
    assert!(!fx.lock.is_held());

    let failed = fx.store().get(bad).unwrap().unwrap();
    let message = failed.error_message.unwrap();
    assert!(message.contains("exit code 1"), "{}", message);
    let log = message.rsplit("See log: ").next().unwrap();
    assert_eq!(std::fs::read_to_string(log).unwrap(), "ValueError: bad input\n");

    let failed_event = fx.sink.records().into_iter().find(|r| r.event == JobEvent::Failed).unwrap();
    assert_eq!(failed_event.job_id, bad);
    assert_eq!(failed_event.extra.as_deref(), Some(message.as_str()));

    assert_eq!(
        scheduler.run_once().unwrap(),
        Iteration::Executed { job_id: good, status: JobStatus::Completed }
    );
    assert!(held_during_run.load(Ordering::SeqCst), "lock was held while each job ran");
}

#[test]
fn test_marker_channel_reports_failure() {
    let fx = Fixture::new();
    let id = fx.enqueue("/jobs/a.py");

    let backend = FakeBackend::new().with_marker_dir(fx.dir.path());
    backend.script(
        &SessionId::for_job(id),
        FakeRun::succeeds().without_exit_code().writes_marker().with_output("Traceback"),
    );
    let mut scheduler = fx.scheduler(backend);
    scheduler.run_once().unwrap();

    let job = fx.store().get(id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("failure marker"));
}

// =============================================================================
// Scenario D: pause while a job runs
// =============================================================================

#[test]
fn test_pause_during_run_finishes_job_then_holds_queue() {
    let fx = Fixture::new();
    let first = fx.enqueue("/jobs/a.py");
    let second = fx.enqueue("/jobs/b.py");
    let third = fx.enqueue("/jobs/c.py");

    let control = Arc::clone(&fx.control);
    let first_session = SessionId::for_job(first);
    let backend = FakeBackend::new().with_poll_hook(move |session| {
        if *session == first_session && !control.is_paused() {
            control.toggle_pause().unwrap();
        }
    });
    backend.script(&SessionId::for_job(first), FakeRun::succeeds().with_polls(1));
    let mut scheduler = fx.scheduler(backend.clone());

    assert_eq!(
        scheduler.run_once().unwrap(),
        Iteration::Executed { job_id: first, status: JobStatus::Completed },
        "pausing never interrupts the running job"
    );
    assert!(fx.control.is_paused());

    assert_eq!(scheduler.run_once().unwrap(), Iteration::Paused);
    assert_eq!(fx.status(second), JobStatus::Pending);
    assert_eq!(backend.spawned().len(), 1);

    fx.control.toggle_pause().unwrap();
    scheduler.run_once().unwrap();
    scheduler.run_once().unwrap();
    assert_eq!(
        backend.spawned_sessions(),
        vec![SessionId::for_job(first), SessionId::for_job(second), SessionId::for_job(third)]
    );
}

// =============================================================================
// Invariants
// =============================================================================

#[test]
fn test_at_most_one_running_and_only_under_lock() {
    let fx = Fixture::new();
    let ids: Vec<JobId> = (0..4).map(|i| fx.enqueue(&format!("/jobs/{}.py", i))).collect();

    let observer = Mutex::new(fx.store());
    let lock = fx.lock.clone();
    let violations = Arc::new(Mutex::new(Vec::<String>::new()));
    let seen = Arc::clone(&violations);
    let backend = FakeBackend::new().with_poll_hook(move |session| {
        let store = observer.lock().unwrap();
        let running = store.running().unwrap();
        if running.len() != 1 {
            seen.lock().unwrap().push(format!("{}: {} running", session, running.len()));
        }
        match lock.current_holder().unwrap() {
            Some(holder) if holder.job_id == session.job_id() => {}
            other => seen.lock().unwrap().push(format!("{}: lock holder {:?}", session, other)),
        }
    });
    backend.set_default(FakeRun::succeeds().with_polls(2));
    let mut scheduler = fx.scheduler(backend);

    for _ in 0..ids.len() {
        scheduler.run_once().unwrap();
    }

    assert!(violations.lock().unwrap().is_empty(), "{:?}", violations.lock().unwrap());
    assert!(fx.store().running().unwrap().is_empty());
    assert!(!fx.lock.is_held());
}

#[test]
fn test_jobs_start_in_submission_order() {
    let fx = Fixture::new();
    let ids: Vec<JobId> = (0..5).map(|i| fx.enqueue(&format!("/jobs/{}.py", i))).collect();

    let backend = FakeBackend::new();
    let mut scheduler = fx.scheduler(backend.clone());
    for _ in 0..ids.len() {
        scheduler.run_once().unwrap();
    }

    let expected: Vec<SessionId> = ids.iter().map(|id| SessionId::for_job(*id)).collect();
    assert_eq!(backend.spawned_sessions(), expected);
}

// =============================================================================
// Full loop
// =============================================================================

#[test]
fn test_run_loop_stops_after_current_job_on_shutdown() {
    let fx = Fixture::new();
    let first = fx.enqueue("/jobs/a.py");
    let second = fx.enqueue("/jobs/b.py");
    let third = fx.enqueue("/jobs/c.py");

    let control = Arc::clone(&fx.control);
    let second_session = SessionId::for_job(second);
    let backend = FakeBackend::new().with_poll_hook(move |session| {
        if *session == second_session {
            control.request_shutdown();
        }
    });
    let mut scheduler = fx.scheduler(backend);

    scheduler.run().unwrap();

    assert_eq!(fx.status(first), JobStatus::Completed);
    assert_eq!(fx.status(second), JobStatus::Completed, "in-flight job finishes");
    assert_eq!(fx.status(third), JobStatus::Pending);
    assert!(!fx.lock.is_held());
}

#[test]
fn test_run_recovers_jobs_left_running() {
    let fx = Fixture::new();
    let orphan = fx.enqueue("/jobs/orphan.py");
    fx.store().transition(orphan, JobStatus::Running, None).unwrap();

    fx.control.request_shutdown();
    let mut scheduler = fx.scheduler(FakeBackend::new());
    scheduler.run().unwrap();

    let job = fx.store().get(orphan).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
}

#[test]
fn test_run_survives_queue_cleared_mid_job() {
    let fx = Fixture::new();
    let first = fx.enqueue("/jobs/a.py");
    let second = fx.enqueue("/jobs/b.py");

    let db_path = fx.db_path.clone();
    let control = Arc::clone(&fx.control);
    let first_session = SessionId::for_job(first);
    let resubmitted = Arc::new(Mutex::new(None::<JobId>));
    let late = Arc::clone(&resubmitted);
    let backend = FakeBackend::new().with_poll_hook(move |session| {
        let mut late = late.lock().unwrap();
        if *session == first_session && late.is_none() {
            let mut store = JobStore::open(&db_path).unwrap();
            store.clear().unwrap();
            *late = Some(store.enqueue(&NewJob::new("/jobs/c.py", "/usr/bin/python3")).unwrap());
        } else if session.job_id() == *late {
            control.request_shutdown();
        }
    });
    let mut scheduler = fx.scheduler(backend.clone());

    scheduler.run().expect("clearing the queue must not stop the scheduler");

    let third = resubmitted.lock().unwrap().unwrap();
    assert!(fx.store().get(first).unwrap().is_none());
    assert!(fx.store().get(second).unwrap().is_none());
    assert_eq!(fx.status(third), JobStatus::Completed, "work queued after the clear still runs");
    assert_eq!(
        backend.spawned_sessions(),
        vec![SessionId::for_job(first), SessionId::for_job(third)]
    );
    assert_eq!(fx.sink.events_for(first), vec![JobEvent::Started, JobEvent::Completed]);
    assert!(!fx.lock.is_held());
}

#[test]
fn test_failing_notifications_do_not_change_outcome() {
    let mut fx = Fixture::new();
    fx.sink = RecordingSink::failing();
    let good = fx.enqueue("/jobs/good.py");
    let bad = fx.enqueue("/jobs/bad.py");

    let backend = FakeBackend::new();
    backend.script(&SessionId::for_job(bad), FakeRun::exits(3));
    let mut scheduler = fx.scheduler(backend);

    assert_eq!(
        scheduler.run_once().unwrap(),
        Iteration::Executed { job_id: good, status: JobStatus::Completed }
    );
    assert!(!fx.lock.is_held());
    assert_eq!(
        scheduler.run_once().unwrap(),
        Iteration::Executed { job_id: bad, status: JobStatus::Failed }
    );
    assert!(!fx.lock.is_held());

    assert_eq!(fx.status(good), JobStatus::Completed);
    assert_eq!(fx.status(bad), JobStatus::Failed);
    assert_eq!(fx.sink.events().len(), 4, "every event was still attempted");
}

#[test]
fn test_run_gives_up_when_outcome_cannot_be_recorded() {
    let fx = Fixture::new();
    let id = fx.enqueue("/jobs/a.py");

    let db_path = fx.db_path.clone();
    let dropped = AtomicBool::new(false);
    let backend = FakeBackend::new().with_poll_hook(move |_| {
        if !dropped.swap(true, Ordering::SeqCst) {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            conn.execute_batch("DROP TABLE jobs").unwrap();
        }
    });
    let mut scheduler = fx.scheduler(backend);

    let err = scheduler.run().unwrap_err();
    assert!(
        matches!(err, SchedulerError::StorageExhausted { failures: 2, .. }),
        "unexpected error: {}",
        err
    );
    assert!(!fx.lock.is_held(), "lock released even when job {} could not be finalized", id);
}

#[test]
fn test_busy_resource_keeps_job_pending_then_runs() {
    let fx = Fixture::new();
    let id = fx.enqueue("/jobs/a.py");
    let notebook = gpuq::HolderInfo::new(
        "bob",
        "jupyter",
        std::process::id(),
        gpuq::HolderKind::Interactive,
        None,
    );
    assert!(fx.lock.acquire(&notebook).unwrap());

    let mut scheduler = fx.scheduler(FakeBackend::new());
    assert_eq!(scheduler.run_once().unwrap(), Iteration::LockUnavailable { job_id: id });
    assert_eq!(fx.status(id), JobStatus::Pending);
    assert!(fx.sink.events().is_empty(), "nothing is announced for a job that did not start");

    assert!(fx.lock.release().unwrap());
    assert_eq!(
        scheduler.run_once().unwrap(),
        Iteration::Executed { job_id: id, status: JobStatus::Completed }
    );
}
