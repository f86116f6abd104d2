//! Error handling for bansuri.
use thiserror::Error;

/// Errors surfaced by the configuration loader.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading or accessing the configuration file.
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing JSON configuration.
    #[error("Invalid JSON format: {0}")]
    Parse(#[from] serde_json::Error),

    /// A task descriptor failed validation.
    #[error("Invalid task '{task}': {reason}")]
    Validation {
        /// The task name that failed validation.
        task: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// Errors surfaced while starting or driving a child process.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The child process could not be spawned.
    #[error("Failed to start task '{task}': {source}")]
    Spawn {
        /// The task whose child failed to start.
        task: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// A redirection target could not be opened.
    #[error("Failed to open log file for task '{task}': {source}")]
    Redirect {
        /// The task whose log file failed to open.
        task: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by the dashboard HTTP server.
#[derive(Debug, Error)]
pub enum DashboardError {
    /// The listen socket could not be bound.
    #[error("Failed to bind dashboard listener: {0}")]
    Bind(#[from] std::io::Error),
}
