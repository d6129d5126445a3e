//! gpuq - serial job queue for one exclusive resource
//!
//! Jobs are queued in SQLite and run one at a time by a single scheduler
//! process, which holds a cross-process lock file (see the `gpuq-lock`
//! crate) for as long as a job runs. Anything else that wants the resource,
//! such as an interactive notebook, takes the same lock.

pub mod backend;
pub mod command;
pub mod config;
pub mod job;
pub mod logging;
pub mod mock;
pub mod notify;
pub mod scheduler;
pub mod signal;
pub mod state;
pub mod store;
pub mod submit;

pub use backend::{BackendError, ExecutionBackend, ProcessBackend, SessionOutcome, TmuxBackend};
pub use command::{CommandLine, CommandTemplate, SessionId};
pub use config::{Config, ConfigError};
pub use job::{Job, JobError, JobFilter, JobId, NewJob, Parameters};
pub use notify::{JobEvent, NotificationSink};
pub use scheduler::{Iteration, Scheduler, SchedulerError, SchedulerSettings};
pub use signal::{ControlChannel, ControlState};
pub use state::{JobStatus, TerminalState};
pub use store::{JobStore, StatusCounts, StoreError};
pub use submit::{submit, SubmitError};

pub use gpuq_lock::{HolderInfo, HolderKind, ResourceLock};
