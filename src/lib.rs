//! Lightweight task supervisor for Unix hosts.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binary (src/bin/main.rs)
// Test dependencies are only used in test code
#[cfg(test)]
use assert_cmd as _;
use ctrlc as _;
#[cfg(test)]
use predicates as _;
#[cfg(test)]
use reqwest as _;
use strum as _;
#[cfg(test)]
use tempfile as _;
use tracing_subscriber as _;

/// CLI parsing.
pub mod cli;

/// Config loading.
pub mod config;

/// Cron evaluation.
pub mod cron;

/// Browser dashboard.
pub mod dashboard;

/// Errors.
pub mod error;

/// Failure notification.
pub mod notify;

/// Process-group termination.
pub mod process;

/// Task runner.
pub mod runner;

/// Resource sampling.
pub mod sampler;

/// Config-diffing supervisor.
pub mod supervisor;
