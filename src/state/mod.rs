//! Job status state machine
//!
//! Jobs move PENDING → RUNNING → {COMPLETED | FAILED}. The store enforces
//! these edges on every status write.

mod job_state;

pub use job_state::{JobStatus, StatusParseError};

/// Check if a state is terminal (no further transitions possible)
pub trait TerminalState {
    fn is_terminal(&self) -> bool;
}
