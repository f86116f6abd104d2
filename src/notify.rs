//! Failure notification for task runners.
use chrono::{DateTime, Local};
use std::{
    process::{Command, Stdio},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

use crate::config::{NotifyMode, TaskConfig};

/// Default cap on how long a notify command may run.
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a notifier needs to describe one failed execution.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    /// Name of the failed task.
    pub task_name: String,
    /// The command line that failed.
    pub command: String,
    /// Working directory the child ran in, if configured.
    pub working_directory: Option<String>,
    /// Exit code of the failed execution (`-1` for timeouts and spawn errors).
    pub return_code: i32,
    /// Which execution this was.
    pub attempt: u32,
    /// The task's retry cap.
    pub max_attempts: u32,
    /// When the failure was observed.
    pub timestamp: DateTime<Local>,
    /// The task's description field.
    pub description: String,
    /// Captured stdout, if any.
    pub stdout: String,
    /// Captured stderr, if any.
    pub stderr: String,
}

/// Capability for dispatching failure notifications.
pub trait Notifier: Send + Sync {
    /// Delivers the record; returns whether delivery succeeded.
    fn notify(&self, record: &FailureRecord) -> bool;
}

/// Notifier that hands the formatted failure message to a shell command.
///
/// The configured command is invoked as `<notify_command> '<message>'` through
/// the system shell, so `mail -s "task failed" ops@example.com` receives the
/// message as its final argument.
pub struct CommandNotifier {
    notify_command: String,
    timeout: Duration,
}

impl CommandNotifier {
    /// Creates a notifier with the default 30 s dispatch timeout.
    pub fn new(notify_command: impl Into<String>) -> Self {
        Self::with_timeout(notify_command, NOTIFY_TIMEOUT)
    }

    /// Creates a notifier with an explicit dispatch timeout.
    pub fn with_timeout(notify_command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            notify_command: notify_command.into(),
            timeout,
        }
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, record: &FailureRecord) -> bool {
        let message = format_message(record);
        let full_cmd = format!("{} {}", self.notify_command, shell_quote(&message));
        debug!("Dispatching failure notification for '{}'", record.task_name);

        let mut child = match Command::new("sh")
            .arg("-c")
            .arg(&full_cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                warn!("Failed to spawn notify command: {err}");
                return false;
            }
        };

        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return status.success(),
                Ok(None) => {
                    if Instant::now() >= deadline {
                        warn!(
                            "Notify command for '{}' exceeded {}s; killing it",
                            record.task_name,
                            self.timeout.as_secs()
                        );
                        let _ = child.kill();
                        let _ = child.wait();
                        return false;
                    }
                    thread::sleep(Duration::from_millis(100));
                }
                Err(err) => {
                    warn!("Failed to wait for notify command: {err}");
                    let _ = child.kill();
                    let _ = child.wait();
                    return false;
                }
            }
        }
    }
}

/// Builds the notifier for a task, or `None` when notifications are disabled.
///
/// A notifier exists iff the task requests `notify = "mail"` and the global
/// config carries a notify command.
pub fn notifier_for(
    task: &TaskConfig,
    notify_command: Option<&str>,
) -> Option<Arc<dyn Notifier>> {
    if task.notify != NotifyMode::Mail {
        return None;
    }

    match notify_command {
        Some(cmd) if !cmd.trim().is_empty() => {
            Some(Arc::new(CommandNotifier::new(cmd)))
        }
        _ => {
            warn!(
                "Task '{}' requests mail notification but no notify_command is configured; notifications disabled",
                task.name
            );
            None
        }
    }
}

/// Renders the human-readable multi-line failure message.
fn format_message(record: &FailureRecord) -> String {
    let mut lines = vec![
        "=== Task Failure ===".to_string(),
        String::new(),
        format!("Task '{}' has failed.", record.task_name),
        String::new(),
        "--- Task Details ---".to_string(),
        format!("Name:              {}", record.task_name),
        format!("Command:           {}", record.command),
        format!(
            "Working Directory: {}",
            record.working_directory.as_deref().unwrap_or("N/A")
        ),
        format!("Return Code:       {}", record.return_code),
        format!("Attempt:           {}/{}", record.attempt, record.max_attempts),
        format!(
            "Timestamp:         {}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S")
        ),
    ];

    if !record.description.is_empty() {
        lines.push(format!("Description:       {}", record.description));
    }

    if !record.stdout.is_empty() {
        lines.push(String::new());
        lines.push("--- Output ---".to_string());
        lines.push(record.stdout.trim().to_string());
    }

    if !record.stderr.is_empty() {
        lines.push(String::new());
        lines.push("--- Error ---".to_string());
        lines.push(record.stderr.trim().to_string());
    }

    lines.push(String::new());
    lines.push("---".to_string());
    lines.push("This is an automated message from orchestrator.".to_string());

    lines.join("\n")
}

/// Wraps a string in single quotes, escaping embedded single quotes so the
/// message survives shell word-splitting intact.
fn shell_quote(message: &str) -> String {
    format!("'{}'", message.replace('\'', "'\\''"))
}
