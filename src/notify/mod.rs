//! Job lifecycle notifications
//!
//! The scheduler reports `added`, `started`, `completed` and `failed` events
//! through a [`NotificationSink`]. Delivery problems are the sink's business:
//! [`deliver`] logs them and carries on. [`CommandSink`] kills commands that
//! outlive their timeout, and the scheduler only notifies after releasing
//! the resource lock.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{Job, JobId};
use crate::state::JobStatus;

/// Notification result type
pub type NotifyResult<T> = Result<T, NotifyError>;

/// Errors from delivering a notification
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("I/O error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("notification command {command} failed: {reason}")]
    Command { command: String, reason: String },
}

/// Lifecycle event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobEvent {
    Added,
    Started,
    Completed,
    Failed,
}

impl JobEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEvent::Added => "added",
            JobEvent::Started => "started",
            JobEvent::Completed => "completed",
            JobEvent::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialized form handed to file and command sinks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event: JobEvent,
    pub at: DateTime<Utc>,
    pub job_id: JobId,
    pub program: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

impl EventRecord {
    pub fn new(event: JobEvent, job: &Job, extra: Option<&str>) -> Self {
        Self {
            event,
            at: Utc::now(),
            job_id: job.id,
            program: job.program.clone(),
            status: job.status,
            owner_user: job.owner_user.clone(),
            notify_address: job.notify_address.clone(),
            error_message: job.error_message.clone(),
            extra: extra.map(str::to_string),
        }
    }
}

/// Receives lifecycle events
pub trait NotificationSink: Send {
    fn notify(&self, event: JobEvent, job: &Job, extra: Option<&str>) -> NotifyResult<()>;
}

impl<S: NotificationSink + ?Sized> NotificationSink for Box<S> {
    fn notify(&self, event: JobEvent, job: &Job, extra: Option<&str>) -> NotifyResult<()> {
        (**self).notify(event, job, extra)
    }
}

/// Send an event and swallow (but log) any delivery failure.
pub fn deliver(sink: &dyn NotificationSink, event: JobEvent, job: &Job, extra: Option<&str>) {
    if let Err(e) = sink.notify(event, job, extra) {
        tracing::warn!(job_id = job.id, %event, error = %e, "notification failed");
    }
}

/// Writes events to the tracing log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, event: JobEvent, job: &Job, extra: Option<&str>) -> NotifyResult<()> {
        tracing::info!(
            job_id = job.id,
            %event,
            program = %job.program,
            owner = job.owner_user.as_deref().unwrap_or("-"),
            extra = extra.unwrap_or(""),
            "job event"
        );
        Ok(())
    }
}

/// Appends one JSON object per event to a file
#[derive(Debug, Clone)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl NotificationSink for JsonlSink {
    fn notify(&self, event: JobEvent, job: &Job, extra: Option<&str>) -> NotifyResult<()> {
        let io_err = |source| NotifyError::Io {
            path: self.path.clone(),
            source,
        };

        let mut line = serde_json::to_string(&EventRecord::new(event, job, extra))?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        file.write_all(line.as_bytes()).map_err(io_err)
    }
}

/// Runs an external command per event, with the event JSON on stdin.
///
/// The event name and job id are also exported as `GPUQ_EVENT` and
/// `GPUQ_JOB_ID`. This is where mail delivery plugs in.
#[derive(Debug, Clone)]
pub struct CommandSink {
    argv: Vec<String>,
    timeout: Duration,
}

/// How long a notification command may run before it is killed
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

const COMMAND_POLL: Duration = Duration::from_millis(20);

impl CommandSink {
    /// `None` when `argv` is empty
    pub fn new(argv: Vec<String>) -> Option<Self> {
        if argv.is_empty() {
            None
        } else {
            Some(Self {
                argv,
                timeout: DEFAULT_COMMAND_TIMEOUT,
            })
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl NotificationSink for CommandSink {
    fn notify(&self, event: JobEvent, job: &Job, extra: Option<&str>) -> NotifyResult<()> {
        let payload = serde_json::to_vec(&EventRecord::new(event, job, extra))?;
        let command = self.argv.join(" ");
        let fail = |reason: String| NotifyError::Command {
            command: command.clone(),
            reason,
        };

        let mut child = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .env("GPUQ_EVENT", event.as_str())
            .env("GPUQ_JOB_ID", job.id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| fail(e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that ignores stdin may close it early.
            if let Err(e) = stdin.write_all(&payload) {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(fail(e.to_string()));
                }
            }
        }

        // Drained on a thread so a chatty command cannot block on a full pipe.
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf);
                buf
            })
        });

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait().map_err(|e| fail(e.to_string()))? {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(fail(format!("timed out after {:?}", self.timeout)));
                }
                None => std::thread::sleep(COMMAND_POLL),
            }
        };

        if !status.success() {
            let stderr = stderr_reader
                .and_then(|reader| reader.join().ok())
                .map(|buf| String::from_utf8_lossy(&buf).trim().to_string())
                .unwrap_or_default();
            return Err(fail(format!("{} {}", status, stderr).trim().to_string()));
        }
        Ok(())
    }
}

/// Fans one event out to several sinks
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn NotificationSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: impl NotificationSink + 'static) {
        self.sinks.push(Box::new(sink));
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl NotificationSink for MultiSink {
    /// Every sink is tried; the first error is returned.
    fn notify(&self, event: JobEvent, job: &Job, extra: Option<&str>) -> NotifyResult<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.notify(event, job, extra) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Parameters;
    use crate::mock::RecordingSink;
    use tempfile::TempDir;

    fn job() -> Job {
        Job {
            id: 5,
            program: "/home/lab/train.py".into(),
            interpreter_path: "/usr/bin/python3".into(),
            environment_name: None,
            parameters: Parameters::new(),
            status: JobStatus::Failed,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: Some(Utc::now()),
            error_message: Some("Job failed with exit code 1".into()),
            owner_user: Some("alice".into()),
            notify_address: Some("alice@lab.example".into()),
        }
    }

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let dir = TempDir::new().unwrap();
        let sink = JsonlSink::new(dir.path().join("events").join("events.jsonl"));

        sink.notify(JobEvent::Started, &job(), None).unwrap();
        sink.notify(JobEvent::Failed, &job(), Some("see log")).unwrap();

        let content = std::fs::read_to_string(sink.path()).unwrap();
        let records: Vec<EventRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event, JobEvent::Started);
        assert_eq!(records[1].event, JobEvent::Failed);
        assert_eq!(records[1].extra.as_deref(), Some("see log"));
        assert_eq!(records[1].notify_address.as_deref(), Some("alice@lab.example"));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_sink_receives_event_on_stdin() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("received.json");
        let sink = CommandSink::new(vec![
            "/bin/sh".into(),
            "-c".into(),
            format!("cat > '{}'; echo \"$GPUQ_EVENT $GPUQ_JOB_ID\" >> '{}'", out.display(), out.display()),
        ])
        .unwrap();

        sink.notify(JobEvent::Completed, &job(), None).unwrap();

        let content = std::fs::read_to_string(&out).unwrap();
        assert!(content.contains("\"event\":\"completed\""));
        assert!(content.ends_with("completed 5\n"));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_sink_failure_is_reported() {
        let sink = CommandSink::new(vec!["/bin/sh".into(), "-c".into(), "echo boom >&2; exit 3".into()]).unwrap();
        let err = sink.notify(JobEvent::Added, &job(), None).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_sink_hung_command_is_killed() {
        let sink = CommandSink::new(vec!["/bin/sh".into(), "-c".into(), "sleep 30".into()])
            .unwrap()
            .with_timeout(Duration::from_millis(200));

        let started = Instant::now();
        let err = sink.notify(JobEvent::Completed, &job(), None).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10), "notify must not wait for the command");
        assert!(err.to_string().contains("timed out"), "{}", err);
    }

    #[test]
    fn test_command_sink_requires_argv() {
        assert!(CommandSink::new(Vec::new()).is_none());
    }

    #[test]
    fn test_deliver_swallows_errors() {
        let sink = RecordingSink::failing();
        deliver(&sink, JobEvent::Started, &job(), None);
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn test_multi_sink_tries_every_sink() {
        let good = RecordingSink::new();
        let mut multi = MultiSink::new();
        multi.push(RecordingSink::failing());
        multi.push(good.clone());

        assert!(multi.notify(JobEvent::Completed, &job(), None).is_err());
        assert_eq!(good.events(), vec![(JobEvent::Completed, 5)]);
    }
}
