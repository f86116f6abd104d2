//! Configuration management for bansuri.
use serde::{Deserialize, Deserializer, Serialize};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::warn;

use crate::error::ConfigError;

/// Represents the structure of the configuration file.
#[derive(Debug, Deserialize, Clone)]
pub struct GlobalConfig {
    /// Configuration version.
    #[serde(default = "default_version")]
    pub version: String,
    /// Shell command template the notifier prepends to the failure message.
    #[serde(default, alias = "notify-command")]
    pub notify_command: Option<String>,
    /// Task descriptors in file order.
    #[serde(default)]
    pub scripts: Vec<TaskConfig>,
}

/// Behavior after a non-success exit in simple mode.
#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OnFail {
    /// Give up after the first failure.
    #[default]
    Stop,
    /// Retry until `max_attempts` consecutive failures.
    Restart,
}

/// Failure notification policy for a task.
#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotifyMode {
    /// Failures are silent.
    #[default]
    None,
    /// Failures are dispatched through the configured notify command.
    Mail,
}

/// Configuration for an individual task.
///
/// Descriptors are immutable once loaded and compared by value when the
/// supervisor diffs a fresh config against running tasks.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TaskConfig {
    /// Unique task name, used for diffing and dashboard control.
    #[serde(default)]
    pub name: String,
    /// Shell command line executed via `sh -c`.
    #[serde(default)]
    pub command: String,
    /// Reserved; accepted but not acted upon.
    #[serde(default)]
    pub user: Option<String>,
    /// Working directory for the child and base for relative log paths.
    #[serde(default, alias = "where")]
    pub working_directory: Option<String>,
    /// Standard 5-field cron expression.
    #[serde(default, alias = "schedule-cron")]
    pub schedule_cron: Option<String>,
    /// Fixed interval between executions; `"none"` and `"0"` mean no timer.
    #[serde(default, deserialize_with = "string_or_int")]
    pub timer: Option<String>,
    /// Maximum wall-clock duration of a single execution.
    #[serde(default, deserialize_with = "string_or_int")]
    pub timeout: Option<String>,
    /// Cap on total executions; `0` means unlimited. Ignored under cron.
    #[serde(default)]
    pub times: u32,
    /// Cap on consecutive failed retries under `on_fail = restart`.
    #[serde(default = "default_max_attempts", alias = "max-attempts")]
    pub max_attempts: u32,
    /// What to do after a non-success exit in simple mode.
    #[serde(default, alias = "on-fail")]
    pub on_fail: OnFail,
    /// Reserved; accepted but never enforced.
    #[serde(default, alias = "depends-on")]
    pub depends_on: Vec<String>,
    /// Exit codes treated as success.
    #[serde(default = "default_success_codes", alias = "success-codes")]
    pub success_codes: Vec<i32>,
    /// Reserved; accepted but not acted upon.
    #[serde(default, alias = "environment-file")]
    pub environment_file: Option<String>,
    /// Reserved; accepted but not acted upon.
    #[serde(default)]
    pub priority: Option<i64>,
    /// Path for stdout redirection; relative paths resolve under
    /// `working_directory`.
    #[serde(default)]
    pub stdout: Option<String>,
    /// Path for stderr redirection, or `"combined"` to merge into stdout.
    #[serde(default)]
    pub stderr: Option<String>,
    /// Failure notification policy.
    #[serde(default)]
    pub notify: NotifyMode,
    /// Human-readable tag carried into failure records.
    #[serde(default)]
    pub description: String,
}

fn default_version() -> String {
    "UNKNOWN".to_string()
}

fn default_max_attempts() -> u32 {
    1
}

fn default_success_codes() -> Vec<i32> {
    vec![0]
}

/// Accepts either a JSON string or an integer and stores it as a string, so
/// `"timer": 30` and `"timer": "30s"` both parse.
fn string_or_int<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    }))
}

impl TaskConfig {
    /// Whether the timer field is absent or one of the "no timer" literals.
    pub fn timer_disabled(&self) -> bool {
        match self.timer.as_deref().map(str::trim) {
            None => true,
            Some(raw) => raw.eq_ignore_ascii_case("none") || raw == "0",
        }
    }

    /// The parsed timer interval, if the timer is enabled and parseable.
    pub fn timer_interval(&self) -> Option<Duration> {
        if self.timer_disabled() {
            return None;
        }
        parse_duration(self.timer.as_deref()?)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// The parsed per-execution timeout, if configured and parseable.
    pub fn timeout_duration(&self) -> Option<Duration> {
        parse_duration(self.timeout.as_deref()?)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Whether an exit code counts as success for this task.
    pub fn is_success(&self, code: i32) -> bool {
        self.success_codes.contains(&code)
    }

    /// Resolves a redirection target against the working directory.
    pub fn resolve_path(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match &self.working_directory {
            Some(cwd) => Path::new(cwd).join(path),
            None => path.to_path_buf(),
        }
    }

    /// The resolved stdout log path, when one is configured.
    pub fn stdout_path(&self) -> Option<PathBuf> {
        self.stdout.as_deref().map(|raw| self.resolve_path(raw))
    }

    /// The resolved stderr log path. `"combined"` has no path of its own.
    pub fn stderr_path(&self) -> Option<PathBuf> {
        self.stderr
            .as_deref()
            .filter(|raw| !raw.eq_ignore_ascii_case("combined"))
            .map(|raw| self.resolve_path(raw))
    }

    /// Whether stderr should be merged onto stdout.
    pub fn stderr_combined(&self) -> bool {
        self.stderr
            .as_deref()
            .is_some_and(|raw| raw.eq_ignore_ascii_case("combined"))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Validation {
                task: self.command.clone(),
                reason: "'name' must be a non-empty string".into(),
            });
        }

        if self.command.trim().is_empty() {
            return Err(ConfigError::Validation {
                task: self.name.clone(),
                reason: "'command' must be a non-empty string".into(),
            });
        }

        let has_schedule = self.schedule_cron.is_some() || !self.timer_disabled();
        let has_dependency = !self.depends_on.is_empty();
        if !(has_schedule || has_dependency) {
            return Err(ConfigError::Validation {
                task: self.name.clone(),
                reason: "requires 'schedule-cron', 'timer' or 'depends-on'".into(),
            });
        }

        Ok(())
    }

    fn warn_reserved_fields(&self) {
        let mut reserved = Vec::new();
        if self.user.is_some() {
            reserved.push("user");
        }
        if self.priority.is_some() {
            reserved.push("priority");
        }
        if self.environment_file.is_some() {
            reserved.push("environment-file");
        }
        if !self.depends_on.is_empty() {
            reserved.push("depends-on");
        }

        if !reserved.is_empty() {
            warn!(
                "Task '{}' sets reserved field(s) {} which have no effect",
                self.name,
                reserved.join(", ")
            );
        }
    }
}

/// Parses a duration string (`"30s"`, `"5m"`, `"1h"`, or plain seconds).
pub fn parse_duration(input: &str) -> Option<u64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.chars().all(|c| c.is_ascii_digit()) {
        return trimmed.parse::<u64>().ok();
    }

    let suffix = trimmed.chars().last()?;
    let number_part = &trimmed[..trimmed.len() - suffix.len_utf8()];
    let value = number_part.trim().parse::<u64>().ok()?;

    match suffix.to_ascii_lowercase() {
        's' => Some(value),
        'm' => Some(value * 60),
        'h' => Some(value * 3600),
        _ => None,
    }
}

/// Loads and parses the configuration file, validating every descriptor.
pub fn load_config(config_path: &Path) -> Result<GlobalConfig, ConfigError> {
    let content = fs::read_to_string(config_path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let config: GlobalConfig = serde_json::from_str(&content)?;

    let mut seen = HashSet::new();
    for task in &config.scripts {
        task.validate()?;
        if !seen.insert(task.name.clone()) {
            return Err(ConfigError::Validation {
                task: task.name.clone(),
                reason: "duplicate task name".into(),
            });
        }
        task.warn_reserved_fields();
    }

    Ok(config)
}
