//! Built-in defaults
//!
//! Everything here applies when neither the config file nor the command line
//! says otherwise.

use std::path::PathBuf;

use crate::scheduler::{DEFAULT_ESCALATE_AFTER, DEFAULT_IDLE_TIERS};

pub const CONFIG_ENV_VAR: &str = "GPUQ_CONFIG";

/// Relative to `$HOME`
pub const USER_CONFIG_PATH: &str = ".config/gpuq/config.toml";

pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

/// `$XDG_STATE_HOME/gpuq`, else `~/.local/state/gpuq`, else `./.gpuq`
pub fn state_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg).join("gpuq");
    }
    match home_dir() {
        Some(home) => home.join(".local/state/gpuq"),
        None => PathBuf::from(".gpuq"),
    }
}

pub fn lock_path() -> PathBuf {
    PathBuf::from(gpuq_lock::DEFAULT_LOCK_PATH)
}

pub fn idle_poll_seconds() -> Vec<u64> {
    DEFAULT_IDLE_TIERS.to_vec()
}

pub fn escalate_after() -> u32 {
    DEFAULT_ESCALATE_AFTER
}

pub fn paused_poll_seconds() -> u64 {
    5
}

pub fn completion_poll_seconds() -> u64 {
    5
}

pub fn lock_poll_seconds() -> u64 {
    5
}

/// Ten minutes, then the job goes back to waiting
pub fn lock_timeout_seconds() -> u64 {
    600
}

pub fn max_storage_failures() -> u32 {
    5
}

pub fn tmux_binary() -> String {
    "tmux".to_string()
}

pub fn history_limit() -> u32 {
    1_000_000
}

pub fn notify_command_timeout_seconds() -> u64 {
    30
}

pub fn log_events() -> bool {
    true
}
