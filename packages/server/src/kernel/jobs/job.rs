//! Job and log models for scheduled callback execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    PausedRateLimited,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::PausedRateLimited => "paused_rate_limited",
        }
    }

    /// Whether the execution engine may act on a job in this state.
    ///
    /// `Running` is allowed so a double-delivered attempt can re-enter
    /// idempotently, and `PausedRateLimited` so the scheduled requeue after
    /// a rate pause can resume the job. Terminal states stay untouched.
    pub fn is_runnable(&self) -> bool {
        matches!(
            self,
            JobStatus::Queued | JobStatus::Running | JobStatus::PausedRateLimited
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "schedule_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Immediate,
    RunAt,
    Cron,
    DelayFromNow,
    Polling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_event_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobEventType {
    ExecutionStarted,
    RateLimited,
    ExecutionCompleted,
    ExecutionFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "log_error_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogErrorType {
    Transient,
    Permanent,
}

// ============================================================================
// AppUser
// ============================================================================

/// App-scoped user identity, created lazily on first submission.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct AppUser {
    pub id: i64,
    pub app_name: String,
    pub external_user_id: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Job Model
// ============================================================================

pub const DEFAULT_MAX_RETRIES: i32 = 3;
pub const DEFAULT_RETRY_BACKOFF_BASE: i64 = 60;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    // Tenant identity
    pub app_name: String,
    pub user_id: i64,
    pub account_id: String,
    #[builder(default, setter(strip_option))]
    pub board_id: Option<String>,
    pub task_type: String,

    // State
    #[builder(default)]
    pub status: JobStatus,

    // Scheduling
    pub schedule_type: ScheduleType,
    #[builder(default, setter(strip_option))]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub cron_expression: Option<String>,
    #[builder(default, setter(strip_option))]
    pub polling_interval_seconds: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub polling_state: Option<serde_json::Value>,

    // Payload: callback_url, max_retries, retry_backoff_base, caller data
    #[builder(default = serde_json::Value::Object(Default::default()))]
    pub payload: serde_json::Value,

    // Timestamps
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// The worker endpoint to invoke, if one is configured.
    ///
    /// An empty string counts as unconfigured: the attempt then completes
    /// without an HTTP call.
    pub fn callback_url(&self) -> Option<&str> {
        self.payload
            .get("callback_url")
            .and_then(|v| v.as_str())
            .filter(|url| !url.is_empty())
    }

    pub fn max_retries(&self) -> i32 {
        self.payload
            .get("max_retries")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32)
            .unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub fn retry_backoff_base(&self) -> i64 {
        self.payload
            .get("retry_backoff_base")
            .and_then(|v| v.as_i64())
            .unwrap_or(DEFAULT_RETRY_BACKOFF_BASE)
    }
}

// ============================================================================
// JobLog
// ============================================================================

/// One append-only entry per notable per-attempt event.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct JobLog {
    pub id: i64,
    pub job_id: Uuid,
    pub event_type: JobEventType,
    pub attempt_number: i32,
    pub idempotency_key: String,
    pub error_type: Option<LogErrorType>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Fields for a new log entry; `id` and `created_at` are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewJobLog {
    pub job_id: Uuid,
    pub event_type: JobEventType,
    pub attempt_number: i32,
    pub idempotency_key: String,
    pub error_type: Option<LogErrorType>,
    pub metadata: Option<serde_json::Value>,
}
