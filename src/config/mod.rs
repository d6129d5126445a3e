//! Configuration file
//!
//! TOML, looked up in this order:
//! 1. `--config <path>`
//! 2. `$GPUQ_CONFIG`
//! 3. `~/.config/gpuq/config.toml`
//! 4. built-in defaults
//!
//! Every key is optional. An explicitly named file that does not exist is an
//! error; a missing user config is not.

mod defaults;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::{BackendKind, ExecutionBackend, ExitChannel, ProcessBackend, TmuxBackend};
use crate::command::{CommandTemplate, ENV_PLACEHOLDER};
use crate::notify::{CommandSink, JsonlSink, LogSink, MultiSink};
use crate::scheduler::SchedulerSettings;
use crate::signal::ControlChannel;

pub use defaults::{CONFIG_ENV_VAR, USER_CONFIG_PATH};

/// Errors from loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// File locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Control files, pid file, default database and logs
    pub state_dir: PathBuf,

    /// Default: `<state_dir>/jobs.db`
    pub db_path: Option<PathBuf>,

    /// Shared with every tool that uses the resource
    pub lock_path: PathBuf,

    /// Default: `<state_dir>/logs`
    pub log_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: defaults::state_dir(),
            db_path: None,
            lock_path: defaults::lock_path(),
            log_dir: None,
        }
    }
}

impl PathsConfig {
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join("jobs.db"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("logs"))
    }

    /// Daily scheduler logs
    pub fn runner_log_dir(&self) -> PathBuf {
        self.log_dir().join("runner")
    }

    /// Saved output of failed jobs
    pub fn session_log_dir(&self) -> PathBuf {
        self.log_dir().join("sessions")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.state_dir.join("scheduler.pid")
    }

    pub fn control_channel(&self) -> ControlChannel {
        ControlChannel::new(&self.state_dir)
    }
}

/// Scheduler timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Idle poll tiers, shortest first
    pub idle_poll_seconds: Vec<u64>,
    pub escalate_after: u32,
    pub paused_poll_seconds: u64,
    pub completion_poll_seconds: u64,
    pub lock_poll_seconds: u64,
    /// 0 waits for the lock indefinitely
    pub lock_timeout_seconds: u64,
    pub max_storage_failures: u32,
    /// Release a lock left by a scheduled holder whose process is gone
    pub reclaim_stale_lock: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_poll_seconds: defaults::idle_poll_seconds(),
            escalate_after: defaults::escalate_after(),
            paused_poll_seconds: defaults::paused_poll_seconds(),
            completion_poll_seconds: defaults::completion_poll_seconds(),
            lock_poll_seconds: defaults::lock_poll_seconds(),
            lock_timeout_seconds: defaults::lock_timeout_seconds(),
            max_storage_failures: defaults::max_storage_failures(),
            reclaim_stale_lock: false,
        }
    }
}

/// Execution backend selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub tmux_binary: String,
    /// Default: `<state_dir>/tmux.sock`
    pub tmux_socket: Option<PathBuf>,
    pub exit_channel: ExitChannel,
    pub history_limit: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            tmux_binary: defaults::tmux_binary(),
            tmux_socket: None,
            exit_channel: ExitChannel::default(),
            history_limit: defaults::history_limit(),
        }
    }
}

/// Where lifecycle events go
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotifyConfig {
    /// Log every event through tracing
    pub log: bool,
    /// Append events as JSON lines
    pub events_file: Option<PathBuf>,
    /// Run per event with the event JSON on stdin
    pub command: Vec<String>,
    /// Kill the command if it runs longer than this
    pub command_timeout_seconds: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            log: defaults::log_events(),
            events_file: None,
            command: Vec::new(),
            command_timeout_seconds: defaults::notify_command_timeout_seconds(),
        }
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub paths: PathsConfig,
    pub scheduler: SchedulerConfig,
    pub command: CommandTemplate,
    pub backend: BackendConfig,
    pub notify: NotifyConfig,
}

impl Config {
    /// `~/.config/gpuq/config.toml`, if `$HOME` is known
    pub fn default_path() -> Option<PathBuf> {
        defaults::home_dir().map(|home| home.join(USER_CONFIG_PATH))
    }

    /// Resolve and load the configuration. Also returns the file used.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let env_path = std::env::var_os(CONFIG_ENV_VAR)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        if let Some(path) = explicit.map(Path::to_path_buf).or(env_path) {
            return Ok((Self::load_file(&path)?, Some(path)));
        }

        match Self::default_path() {
            Some(path) if path.exists() => Ok((Self::load_file(&path)?, Some(path))),
            _ => Ok((Self::default(), None)),
        }
    }

    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scheduler;
        if s.idle_poll_seconds.is_empty() {
            return Err(invalid("scheduler.idle_poll_seconds", "at least one tier is required"));
        }
        if s.idle_poll_seconds.contains(&0) {
            return Err(invalid("scheduler.idle_poll_seconds", "intervals must be positive"));
        }
        for (field, value) in [
            ("scheduler.paused_poll_seconds", s.paused_poll_seconds),
            ("scheduler.completion_poll_seconds", s.completion_poll_seconds),
            ("scheduler.lock_poll_seconds", s.lock_poll_seconds),
            ("scheduler.escalate_after", u64::from(s.escalate_after)),
            ("scheduler.max_storage_failures", u64::from(s.max_storage_failures)),
            ("notify.command_timeout_seconds", self.notify.command_timeout_seconds),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }

        let activation = &self.command.env_activation;
        if !activation.is_empty() && !activation.iter().any(|t| t.contains(ENV_PLACEHOLDER)) {
            return Err(invalid(
                "command.env_activation",
                format!("template must contain {}", ENV_PLACEHOLDER),
            ));
        }

        if self.backend.kind == BackendKind::Tmux && self.backend.tmux_binary.trim().is_empty() {
            return Err(invalid("backend.tmux_binary", "must not be empty"));
        }
        if self.notify.command.first().is_some_and(|c| c.trim().is_empty()) {
            return Err(invalid("notify.command", "program must not be empty"));
        }
        Ok(())
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        let s = &self.scheduler;
        SchedulerSettings {
            idle_tiers: s.idle_poll_seconds.iter().map(|secs| Duration::from_secs(*secs)).collect(),
            escalate_after: s.escalate_after,
            paused_poll: Duration::from_secs(s.paused_poll_seconds),
            completion_poll: Duration::from_secs(s.completion_poll_seconds),
            lock_poll: Duration::from_secs(s.lock_poll_seconds),
            lock_timeout: match s.lock_timeout_seconds {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            max_storage_failures: s.max_storage_failures,
            reclaim_stale_lock: s.reclaim_stale_lock,
            session_log_dir: self.paths.session_log_dir(),
            ..SchedulerSettings::default()
        }
    }

    pub fn tmux_socket(&self) -> PathBuf {
        self.backend
            .tmux_socket
            .clone()
            .unwrap_or_else(|| self.paths.state_dir.join("tmux.sock"))
    }

    pub fn build_backend(&self) -> Box<dyn ExecutionBackend> {
        match self.backend.kind {
            BackendKind::Tmux => Box::new(
                TmuxBackend::new(
                    self.backend.tmux_binary.clone(),
                    self.tmux_socket(),
                    self.paths.state_dir.join("markers"),
                )
                .with_exit_channel(self.backend.exit_channel)
                .with_history_limit(self.backend.history_limit),
            ),
            BackendKind::Process => Box::new(ProcessBackend::new(self.paths.log_dir().join("output"))),
        }
    }

    pub fn build_sink(&self) -> MultiSink {
        let mut sink = MultiSink::new();
        if self.notify.log {
            sink.push(LogSink);
        }
        if let Some(path) = &self.notify.events_file {
            sink.push(JsonlSink::new(path.clone()));
        }
        if let Some(command) = CommandSink::new(self.notify.command.clone()) {
            sink.push(command.with_timeout(Duration::from_secs(self.notify.command_timeout_seconds)));
        }
        sink
    }
}
