//! Job command lines
//!
//! Jobs are launched from an argument vector, never from a shell string, so
//! parameter values reach the script exactly as submitted.
//!
//! Layout: `[activation prefix…] interpreter program <scheduled flag> --key value…`

use serde::{Deserialize, Serialize};

use crate::job::{Job, JobId};

/// Flag telling a script it was started by the scheduler rather than by hand
pub const DEFAULT_SCHEDULED_FLAG: &str = "--from_sql";

/// Placeholder replaced by the job's environment name
pub const ENV_PLACEHOLDER: &str = "{env}";

/// How job command lines are put together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandTemplate {
    /// Discriminator flag appended after the program path
    pub scheduled_flag: String,

    /// Prefix used when a job names an environment; `{env}` is substituted.
    /// Empty disables environment activation.
    pub env_activation: Vec<String>,
}

impl Default for CommandTemplate {
    fn default() -> Self {
        Self {
            scheduled_flag: DEFAULT_SCHEDULED_FLAG.to_string(),
            env_activation: vec![
                "conda".to_string(),
                "run".to_string(),
                "--no-capture-output".to_string(),
                "-n".to_string(),
                ENV_PLACEHOLDER.to_string(),
            ],
        }
    }
}

/// A fully resolved command: executable plus arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build the command for a queued job.
    ///
    /// String parameters are passed as-is, other scalars in their JSON form,
    /// and null parameters are left out entirely.
    pub fn for_job(job: &Job, template: &CommandTemplate) -> Self {
        let mut argv: Vec<String> = Vec::new();

        if let Some(env) = &job.environment_name {
            if !template.env_activation.is_empty() {
                argv.extend(
                    template
                        .env_activation
                        .iter()
                        .map(|token| token.replace(ENV_PLACEHOLDER, env)),
                );
            }
        }

        argv.push(job.interpreter_path.clone());
        argv.push(job.program.clone());
        if !template.scheduled_flag.is_empty() {
            argv.push(template.scheduled_flag.clone());
        }

        for (key, value) in job.parameters.iter() {
            let rendered = match value {
                serde_json::Value::Null => continue,
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            argv.push(format!("--{}", key));
            argv.push(rendered);
        }

        let program = argv.remove(0);
        Self::new(program, argv)
    }

    /// Executable followed by arguments
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Shell-quoted rendering, for logs and display only.
    pub fn display(&self) -> String {
        self.argv()
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Name of the isolated session a job runs in
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    const PREFIX: &'static str = "job_";

    /// Deterministic session name, e.g. `job_00042`
    pub fn for_job(id: JobId) -> Self {
        Self(format!("{}{:05}", Self::PREFIX, id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover the job id from a session name created by [`SessionId::for_job`].
    pub fn job_id(&self) -> Option<JobId> {
        self.0.strip_prefix(Self::PREFIX)?.parse().ok()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
