//! Submission primitives: create a job and hand it to the delayed queue.
//!
//! Each primitive writes the job in its initial state and (cron excepted)
//! submits the first delivery. The cron driver picks cron jobs up on its
//! periodic sweep instead.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::info;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::kernel::cron::{self, CronError};

use super::job::{Job, JobStatus, ScheduleType, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BACKOFF_BASE};
use super::queue::DelayedQueue;
use super::store::{JobStore, StoreError};

/// Caller-supplied configuration for a submission.
///
/// Identity fields become job columns; `callback_url`, `max_retries`,
/// `retry_backoff_base` and any `extra` keys are merged into the payload.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobConfig {
    pub app_name: String,
    pub user_id: String,
    pub account_id: String,
    #[builder(default)]
    pub board_id: Option<String>,
    pub task_type: String,
    pub callback_url: String,
    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub max_retries: i32,
    #[builder(default = DEFAULT_RETRY_BACKOFF_BASE)]
    pub retry_backoff_base: i64,
    /// Non-identity keys carried through to the payload verbatim.
    #[builder(default)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    InvalidCron(#[from] CronError),
    #[error("delay must be non-negative, got {0}")]
    NegativeDelay(i64),
    #[error("polling interval must be positive, got {0}")]
    NonPositiveInterval(i64),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to hand task to the delayed queue: {0}")]
    Queue(#[source] anyhow::Error),
}

/// Merge config metadata with caller data into the stored payload.
fn payload_from(config: &JobConfig, data: Value) -> Value {
    let mut payload = Map::new();
    payload.insert("callback_url".into(), json!(config.callback_url));
    payload.insert("max_retries".into(), json!(config.max_retries));
    payload.insert(
        "retry_backoff_base".into(),
        json!(config.retry_backoff_base),
    );
    payload.insert("data".into(), data);
    for (key, value) in &config.extra {
        payload
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }
    Value::Object(payload)
}

/// Shared capability for creating and enqueueing jobs.
pub struct Submitter {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn DelayedQueue>,
}

impl Submitter {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn DelayedQueue>) -> Self {
        Self { store, queue }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    async fn create_job(
        &self,
        config: &JobConfig,
        data: Value,
        schedule_type: ScheduleType,
    ) -> Result<Job, SubmitError> {
        let user = self
            .store
            .get_or_create_user(&config.app_name, &config.user_id)
            .await?;

        let mut job = Job::builder()
            .app_name(config.app_name.clone())
            .user_id(user.id)
            .account_id(config.account_id.clone())
            .task_type(config.task_type.clone())
            .status(JobStatus::Queued)
            .schedule_type(schedule_type)
            .payload(payload_from(config, data))
            .build();
        job.board_id = config.board_id.clone();

        Ok(job)
    }

    /// Create a job and queue it for immediate execution.
    pub async fn run_immediate(&self, config: &JobConfig, data: Value) -> Result<Uuid, SubmitError> {
        let job = self
            .create_job(config, data, ScheduleType::Immediate)
            .await?;
        let job = self.store.create_job(job).await?;

        self.queue
            .submit(job.id, 1, Duration::ZERO)
            .await
            .map_err(SubmitError::Queue)?;

        info!(job_id = %job.id, task_type = %job.task_type, "immediate job submitted");
        Ok(job.id)
    }

    /// Create a job scheduled for a specific instant.
    ///
    /// A timestamp in the past queues the job immediately.
    pub async fn run_at(
        &self,
        config: &JobConfig,
        data: Value,
        timestamp: DateTime<Utc>,
    ) -> Result<Uuid, SubmitError> {
        let mut job = self.create_job(config, data, ScheduleType::RunAt).await?;
        job.scheduled_at = Some(timestamp);
        let job = self.store.create_job(job).await?;

        let delay = (timestamp - Utc::now()).num_seconds().max(0) as u64;
        self.queue
            .submit(job.id, 1, Duration::from_secs(delay))
            .await
            .map_err(SubmitError::Queue)?;

        info!(job_id = %job.id, scheduled_at = %timestamp, "scheduled job submitted");
        Ok(job.id)
    }

    /// `run_at(now + duration_seconds)`.
    pub async fn run_after_delay(
        &self,
        config: &JobConfig,
        data: Value,
        duration_seconds: i64,
    ) -> Result<Uuid, SubmitError> {
        if duration_seconds < 0 {
            return Err(SubmitError::NegativeDelay(duration_seconds));
        }
        let timestamp = Utc::now() + chrono::Duration::seconds(duration_seconds);
        self.run_at(config, data, timestamp).await
    }

    /// Create a recurring job; the cron driver enqueues it when due.
    ///
    /// Invalid expressions fail the submission: a cron job without a valid
    /// cursor would never become schedulable.
    pub async fn run_cron(
        &self,
        config: &JobConfig,
        data: Value,
        cron_expression: &str,
    ) -> Result<Uuid, SubmitError> {
        let first_fire = cron::next_fire(cron_expression, Utc::now())?;

        let mut job = self.create_job(config, data, ScheduleType::Cron).await?;
        job.cron_expression = Some(cron_expression.to_string());
        job.scheduled_at = Some(first_fire);
        let job = self.store.create_job(job).await?;

        info!(
            job_id = %job.id,
            cron = cron_expression,
            first_fire = %first_fire,
            "cron job submitted"
        );
        Ok(job.id)
    }

    /// Create a self-rescheduling polling job and queue its first run.
    pub async fn run_polling(
        &self,
        config: &JobConfig,
        data: Value,
        interval_seconds: i64,
    ) -> Result<Uuid, SubmitError> {
        if interval_seconds <= 0 {
            return Err(SubmitError::NonPositiveInterval(interval_seconds));
        }

        let mut job = self.create_job(config, data, ScheduleType::Polling).await?;
        job.polling_interval_seconds = Some(interval_seconds as i32);
        job.polling_state = Some(json!({}));
        let job = self.store.create_job(job).await?;

        self.queue
            .submit(job.id, 1, Duration::ZERO)
            .await
            .map_err(SubmitError::Queue)?;

        info!(
            job_id = %job.id,
            interval_seconds,
            "polling job submitted"
        );
        Ok(job.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> JobConfig {
        JobConfig::builder()
            .app_name("app_a")
            .user_id("user-1")
            .account_id("acct-1")
            .task_type("bulk_insert")
            .callback_url("http://worker.local/jobs/bulk_insert")
            .build()
    }

    #[test]
    fn payload_merges_config_and_data() {
        let config = sample_config();
        let payload = payload_from(&config, json!({"x": 1}));

        assert_eq!(payload["callback_url"], "http://worker.local/jobs/bulk_insert");
        assert_eq!(payload["max_retries"], DEFAULT_MAX_RETRIES);
        assert_eq!(payload["retry_backoff_base"], DEFAULT_RETRY_BACKOFF_BASE);
        assert_eq!(payload["data"], json!({"x": 1}));
    }

    #[test]
    fn extra_keys_never_clobber_reserved_ones() {
        let mut config = sample_config();
        config
            .extra
            .insert("max_retries".into(), json!(99));
        config.extra.insert("origin".into(), json!("webhook"));

        let payload = payload_from(&config, json!({}));
        assert_eq!(payload["max_retries"], DEFAULT_MAX_RETRIES);
        assert_eq!(payload["origin"], "webhook");
    }
}
