//! Cron evaluation for scheduled tasks.
use chrono::{DateTime, TimeZone};
use cron::Schedule;
use std::str::FromStr;
use thiserror::Error;

/// Error for a cron expression the schedule parser rejected.
#[derive(Debug, Error)]
#[error("Invalid cron expression '{expression}': {reason}")]
pub struct CronParseError {
    /// The expression as it appeared in the config.
    pub expression: String,
    /// What the schedule parser disliked about it.
    pub reason: String,
}

/// A parsed cron schedule.
///
/// Config files use the standard 5-field form (minute, hour, day-of-month,
/// month, day-of-week); a seconds column is prepended before handing the
/// expression to the schedule parser, which expects six fields.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedule: Schedule,
}

impl CronSchedule {
    /// Parses a cron expression, normalizing 5-field input.
    pub fn parse(expression: &str) -> Result<Self, CronParseError> {
        let normalized = normalize_cron_expression(expression);
        let schedule = Schedule::from_str(&normalized).map_err(|e| CronParseError {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { schedule })
    }

    /// Returns the next fire time strictly after `reference`.
    pub fn next_after<Tz: TimeZone>(&self, reference: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedule.after(reference).next()
    }
}

fn normalize_cron_expression(expr: &str) -> String {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    match parts.len() {
        5 => format!("0 {}", parts.join(" ")),
        _ => parts.join(" "),
    }
}
