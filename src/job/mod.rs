//! Job records and submission
//!
//! A job is one invocation of a script with an ordered set of scalar
//! parameters. Submissions are validated here before they reach the store,
//! so that a job that is certain to fail (missing script, missing
//! interpreter, parameters that cannot become flags) is never queued.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Duration, Utc};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::state::JobStatus;

/// Job identifier (SQLite rowid)
pub type JobId = i64;

/// Submission errors
#[derive(Debug, Error)]
pub enum JobError {
    #[error("program not found: {0}")]
    ProgramNotFound(PathBuf),

    #[error("interpreter not found: {0}")]
    InterpreterNotFound(String),

    #[error("interpreter is not executable: {0}")]
    NotExecutable(PathBuf),

    #[error("parameter name '{0}' cannot be passed as a command-line flag")]
    InvalidParameterKey(String),

    #[error("parameter '{key}' must be a string, number, boolean or null")]
    NonScalarParameter { key: String },

    #[error("parameters must be a JSON object: {0}")]
    InvalidParameters(String),

    #[error("invalid environment name '{0}'")]
    InvalidEnvironment(String),
}

fn parameter_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_.-]*$").expect("parameter key pattern is valid")
    })
}

/// Ordered mapping of parameter name to scalar value.
///
/// Insertion order is preserved through storage and back, and is the order
/// in which flags are passed to the script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters(Map<String, Value>);

impl Parameters {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Insert a parameter, rejecting non-scalar values and unsafe names.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<(), JobError> {
        let key = key.into();
        let value = value.into();
        check_parameter(&key, &value)?;
        self.0.insert(key, value);
        Ok(())
    }

    /// Builder-style [`Parameters::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<Self, JobError> {
        self.insert(key, value)?;
        Ok(self)
    }

    /// Parse a JSON object such as `{"epochs": 5, "name": "run1"}`.
    pub fn from_json_str(json: &str) -> Result<Self, JobError> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| JobError::InvalidParameters(e.to_string()))?;
        match value {
            Value::Object(map) => {
                for (key, value) in &map {
                    check_parameter(key, value)?;
                }
                Ok(Self(map))
            }
            other => Err(JobError::InvalidParameters(format!(
                "expected an object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Parse a `key=value` assignment from the command line.
    ///
    /// Values that read as JSON scalars (`5`, `0.1`, `true`, `null`) keep
    /// their type; everything else is a string.
    pub fn parse_assignment(assignment: &str) -> Result<(String, Value), JobError> {
        let (key, raw) = assignment
            .split_once('=')
            .ok_or_else(|| JobError::InvalidParameters(format!("expected key=value, got '{}'", assignment)))?;
        let key = key.trim().to_string();
        let value = match serde_json::from_str::<Value>(raw) {
            Ok(v) if is_scalar(&v) => v,
            _ => Value::String(raw.to_string()),
        };
        check_parameter(&key, &value)?;
        Ok((key, value))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serialized form used by the store
    pub fn to_json(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }

    /// Re-check every entry (used after deserializing untrusted input).
    pub fn validate(&self) -> Result<(), JobError> {
        for (key, value) in &self.0 {
            check_parameter(key, value)?;
        }
        Ok(())
    }
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn check_parameter(key: &str, value: &Value) -> Result<(), JobError> {
    if !parameter_key_pattern().is_match(key) {
        return Err(JobError::InvalidParameterKey(key.to_string()));
    }
    if !is_scalar(value) {
        return Err(JobError::NonScalarParameter { key: key.to_string() });
    }
    Ok(())
}

/// A persisted job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub program: String,
    pub interpreter_path: String,
    pub environment_name: Option<String>,
    pub parameters: Parameters,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub owner_user: Option<String>,
    pub notify_address: Option<String>,
}

impl Job {
    /// Script file name without directories
    pub fn program_name(&self) -> &str {
        Path::new(&self.program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.program)
    }

    /// Wall-clock run time, once the job has finished
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// A job about to be queued
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub program: String,
    pub interpreter_path: String,
    pub parameters: Parameters,
    pub environment_name: Option<String>,
    pub owner_user: Option<String>,
    pub notify_address: Option<String>,
}

impl NewJob {
    pub fn new(program: impl Into<String>, interpreter_path: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            interpreter_path: interpreter_path.into(),
            parameters: Parameters::new(),
            environment_name: None,
            owner_user: None,
            notify_address: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_environment(mut self, name: impl Into<String>) -> Self {
        self.environment_name = Some(name.into());
        self
    }

    pub fn with_owner(mut self, user: impl Into<String>) -> Self {
        self.owner_user = Some(user.into());
        self
    }

    pub fn with_notify_address(mut self, address: impl Into<String>) -> Self {
        self.notify_address = Some(address.into());
        self
    }

    /// Reject submissions that cannot possibly run.
    pub fn validate(&self) -> Result<(), JobError> {
        let program = Path::new(&self.program);
        if !program.is_file() {
            return Err(JobError::ProgramNotFound(program.to_path_buf()));
        }

        if let Some(env) = &self.environment_name {
            if env.is_empty() || env.chars().any(char::is_whitespace) {
                return Err(JobError::InvalidEnvironment(env.clone()));
            }
        }

        // A bare name is looked up inside the activated environment, which
        // the submitter's PATH knows nothing about.
        let bare_name = Path::new(&self.interpreter_path).components().count() == 1
            && !Path::new(&self.interpreter_path).is_absolute();
        if self.environment_name.is_some() && bare_name && !self.interpreter_path.is_empty() {
            return self.parameters.validate();
        }

        let interpreter = resolve_executable(&self.interpreter_path)
            .ok_or_else(|| JobError::InterpreterNotFound(self.interpreter_path.clone()))?;
        if !is_executable(&interpreter) {
            return Err(JobError::NotExecutable(interpreter));
        }

        self.parameters.validate()
    }
}

/// Find an executable the way a shell would: paths are taken as-is, bare
/// names are searched on `PATH`.
pub fn resolve_executable(name: &str) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }
    let candidate = Path::new(name);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|full| full.is_file())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Read-side filter for listings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub since: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Jobs created within the last `window`
    pub fn created_within(self, window: Duration) -> Self {
        self.since(Utc::now() - window)
    }
}
