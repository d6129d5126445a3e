//! Test doubles
//!
//! - [`FakeBackend`]: scripted execution backend. Each session can be told
//!   how many polls it stays alive, what exit code it reports and what
//!   output it prints. A poll hook lets a test act while a job is "running".
//! - [`RecordingSink`]: notification sink that remembers every event.
//!
//! Both are cheap to clone and clones share state, so a test can keep one
//! handle and give the other to the scheduler.

mod backend;
mod sink;

pub use backend::{FakeBackend, FakeRun, PollHook};
pub use sink::{RecordedEvent, RecordingSink};
