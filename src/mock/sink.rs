//! Recording notification sink

use std::sync::{Arc, Mutex};

use crate::job::{Job, JobId};
use crate::notify::{JobEvent, NotificationSink, NotifyError, NotifyResult};
use crate::state::JobStatus;

/// One captured notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub event: JobEvent,
    pub job_id: JobId,
    /// Job status at the moment the event was sent
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub extra: Option<String>,
}

/// Sink that keeps every event in memory
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    records: Arc<Mutex<Vec<RecordedEvent>>>,
    fail: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records events but reports every delivery as failed
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<RecordedEvent> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// `(event, job id)` pairs in delivery order
    pub fn events(&self) -> Vec<(JobEvent, JobId)> {
        self.records()
            .into_iter()
            .map(|r| (r.event, r.job_id))
            .collect()
    }

    pub fn events_for(&self, job_id: JobId) -> Vec<JobEvent> {
        self.records()
            .into_iter()
            .filter(|r| r.job_id == job_id)
            .map(|r| r.event)
            .collect()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, event: JobEvent, job: &Job, extra: Option<&str>) -> NotifyResult<()> {
        if let Ok(mut records) = self.records.lock() {
            records.push(RecordedEvent {
                event,
                job_id: job.id,
                status: job.status,
                error_message: job.error_message.clone(),
                extra: extra.map(str::to_string),
            });
        }
        if self.fail {
            return Err(NotifyError::Command {
                command: "recording-sink".to_string(),
                reason: "configured to fail".to_string(),
            });
        }
        Ok(())
    }
}
