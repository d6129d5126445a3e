//! Per-day job counts

use chrono::NaiveDate;

use crate::state::JobStatus;

/// Counts for one local calendar day
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
}

impl DailySummary {
    fn percent(&self, part: u64) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(part as f64 * 100.0 / self.total as f64)
        }
    }

    pub fn completed_percent(&self) -> Option<f64> {
        self.percent(self.completed)
    }

    pub fn failed_percent(&self) -> Option<f64> {
        self.percent(self.failed)
    }
}

impl std::fmt::Display for DailySummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: total {} | completed {} | failed {}",
            self.date, self.total, self.completed, self.failed
        )?;
        match (self.completed_percent(), self.failed_percent()) {
            (Some(c), Some(x)) => write!(f, " (completed {:.2}% | failed {:.2}%)", c, x),
            _ => write!(f, " (no jobs processed)"),
        }
    }
}

/// Rolling tally, reset when the date changes
#[derive(Debug, Clone)]
pub struct DailyTally {
    current: DailySummary,
}

impl DailyTally {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            current: DailySummary {
                date,
                total: 0,
                completed: 0,
                failed: 0,
            },
        }
    }

    /// A job was dequeued and started.
    pub fn record_started(&mut self) {
        self.current.total += 1;
    }

    /// A job reached a terminal status.
    pub fn record_finished(&mut self, status: JobStatus) {
        match status {
            JobStatus::Completed => self.current.completed += 1,
            JobStatus::Failed => self.current.failed += 1,
            JobStatus::Pending | JobStatus::Running => {}
        }
    }

    /// If `today` is a new day, close the old one and return its summary.
    pub fn roll_over(&mut self, today: NaiveDate) -> Option<DailySummary> {
        if today == self.current.date {
            return None;
        }
        let finished = self.current;
        *self = Self::new(today);
        Some(finished)
    }

    pub fn summary(&self) -> DailySummary {
        self.current
    }
}
