//! Adaptive idle polling
//!
//! An empty queue is checked less and less often: every `escalate_after`
//! consecutive empty checks move the poll interval one tier up, and the
//! first job seen drops it back to the first tier.

use std::time::Duration;

/// Default idle poll tiers: 30 s, 5 min, 30 min
pub const DEFAULT_IDLE_TIERS: [u64; 3] = [30, 300, 1800];

/// Default number of empty checks per tier
pub const DEFAULT_ESCALATE_AFTER: u32 = 3;

#[derive(Debug, Clone)]
pub struct Backoff {
    tiers: Vec<Duration>,
    escalate_after: u32,
    empty_checks: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            DEFAULT_IDLE_TIERS.iter().map(|s| Duration::from_secs(*s)).collect(),
            DEFAULT_ESCALATE_AFTER,
        )
    }
}

impl Backoff {
    /// Empty `tiers` falls back to the first default tier; `escalate_after`
    /// of zero is treated as one.
    pub fn new(tiers: Vec<Duration>, escalate_after: u32) -> Self {
        let tiers = if tiers.is_empty() {
            vec![Duration::from_secs(DEFAULT_IDLE_TIERS[0])]
        } else {
            tiers
        };
        Self {
            tiers,
            escalate_after: escalate_after.max(1),
            empty_checks: 0,
        }
    }

    fn tier(&self) -> usize {
        ((self.empty_checks / self.escalate_after) as usize).min(self.tiers.len() - 1)
    }

    /// Interval to wait at the current escalation level
    pub fn current(&self) -> Duration {
        self.tiers[self.tier()]
    }

    /// Shortest interval
    pub fn first(&self) -> Duration {
        self.tiers[0]
    }

    /// Count an empty check and return how long to wait before the next.
    pub fn record_empty(&mut self) -> Duration {
        self.empty_checks = self.empty_checks.saturating_add(1);
        self.current()
    }

    pub fn reset(&mut self) {
        if self.empty_checks > 0 {
            tracing::debug!(empty_checks = self.empty_checks, "idle backoff reset");
        }
        self.empty_checks = 0;
    }

    pub fn empty_checks(&self) -> u32 {
        self.empty_checks
    }
}

/// Human-friendly wait time for logs ("45 seconds", "30 minutes", "2.0 hours")
pub fn describe_wait(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs < 60.0 {
        format!("{:.0} seconds", secs)
    } else if secs < 3600.0 {
        format!("{:.0} minutes", secs / 60.0)
    } else {
        format!("{:.1} hours", secs / 3600.0)
    }
}
