//! Cron expression evaluation for recurring jobs.
//!
//! Submissions carry classic five-field expressions (`m h dom mon dow`);
//! the `cron` crate wants a leading seconds column, so a `0` is prefixed.
//! Six- and seven-field expressions pass through untouched.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("invalid cron expression {expression:?}: {message}")]
    Parse { expression: String, message: String },
    #[error("cron expression {expression:?} has no upcoming fire time")]
    Exhausted { expression: String },
}

fn normalize(expression: &str) -> Result<String, CronError> {
    let trimmed = expression.trim();
    match trimmed.split_whitespace().count() {
        5 => Ok(format!("0 {trimmed}")),
        6 | 7 => Ok(trimmed.to_string()),
        n => Err(CronError::Parse {
            expression: expression.to_string(),
            message: format!("expected 5 to 7 fields, got {n}"),
        }),
    }
}

/// Parse an expression, failing submissions with bad ones early.
pub fn parse(expression: &str) -> Result<Schedule, CronError> {
    let normalized = normalize(expression)?;
    Schedule::from_str(&normalized).map_err(|e| CronError::Parse {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

/// Next fire time strictly after `after`, in UTC.
///
/// Strictness matters for the cron driver: advancing `scheduled_at` past
/// `now` guarantees one sweep window never enqueues the same job twice.
pub fn next_fire(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
    let schedule = parse(expression)?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| CronError::Exhausted {
            expression: expression.to_string(),
        })
}
