//! Queue submission: validate, enqueue, announce.

use thiserror::Error;

use crate::job::{Job, JobError, NewJob};
use crate::notify::{deliver, JobEvent, NotificationSink};
use crate::store::{JobStore, StoreError};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid job: {0}")]
    Invalid(#[from] JobError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Validate `job`, queue it, and send the `added` event.
pub fn submit(store: &mut JobStore, job: &NewJob, sink: &dyn NotificationSink) -> Result<Job, SubmitError> {
    job.validate()?;
    let id = store.enqueue(job)?;
    let queued = store.get(id)?.ok_or(StoreError::NotFound(id))?;
    tracing::info!(job_id = id, program = %queued.program, owner = queued.owner_user.as_deref().unwrap_or("-"), "job queued");
    deliver(sink, JobEvent::Added, &queued, None);
    Ok(queued)
}
