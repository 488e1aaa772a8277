//! The job runner: one entry point per queue delivery.
//!
//! `Executor::run(job_id, attempt_number)` drives a single attempt through
//! the lifecycle state machine:
//!
//! ```text
//! pending ─┐
//!          ▼
//!       queued ──► running ──► completed            (terminal for one-shot)
//!          ▲         │  │  │
//!          │         │  │  └──► failed              (terminal)
//!          │         │  └────► paused_rate_limited ─┐
//!          │         │                              │ requeued after retry_after
//!          │         └──► queued (polling not done, cron)
//!          │                                        │
//!          └────────────────────────────────────────┘
//!       cancelled                                   (set only by external API)
//! ```
//!
//! Every state-producing step writes exactly one log row per
//! `(job, attempt, event)` via upsert-no-overwrite keys, so a redelivered or
//! replayed attempt converges instead of duplicating. Nothing escapes to the
//! queue except an explicit requeue; all other paths end in a store write
//! and a clean return.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::kernel::callback::{CallbackClient, CallbackError, CallbackResponse};
use crate::kernel::rate_limit::RateLimiter;
use crate::kernel::status_hub::StatusHub;

use super::job::{Job, JobEventType, JobStatus, LogErrorType, NewJobLog, ScheduleType};
use super::queue::DelayedQueue;
use super::store::{JobStore, StoreError};

/// Cap on the exponential backoff between transient retries.
pub const MAX_RETRY_DELAY_SECONDS: i64 = 3600;

// ============================================================================
// Idempotency keys
// ============================================================================

fn started_key(job_id: Uuid, attempt: i32) -> String {
    format!("{job_id}::started::{attempt}")
}

fn rate_limit_key(job_id: Uuid, attempt: i32) -> String {
    format!("{job_id}::rate_limit::{attempt}")
}

fn completed_key(job_id: Uuid, attempt: i32) -> String {
    format!("{job_id}::completed::{attempt}")
}

fn failure_key(job_id: Uuid, attempt: i32) -> String {
    format!("{job_id}::failure::{attempt}")
}

fn exception_key(job_id: Uuid, attempt: i32) -> String {
    format!("{job_id}::exception::{attempt}")
}

/// Key sent to the worker so it can dedupe redelivered attempts.
pub fn external_idempotency_key(job_id: Uuid, attempt: i32) -> String {
    format!("{job_id}_{attempt}")
}

/// `min(base * 2^(n-1), 3600)` seconds for the attempt that failed.
pub fn retry_delay(backoff_base: i64, attempt: i32) -> Duration {
    let exponent = (attempt - 1).clamp(0, 30) as u32;
    let seconds = backoff_base
        .saturating_mul(1i64 << exponent)
        .clamp(0, MAX_RETRY_DELAY_SECONDS);
    Duration::from_secs(seconds as u64)
}

fn stream_log(event_type: JobEventType) -> Value {
    json!({
        "event_type": event_type,
        "metadata": null,
        "created_at": Utc::now().to_rfc3339(),
    })
}

// ============================================================================
// Executor
// ============================================================================

/// The execution engine. All capabilities are pluggable so attempts can be
/// driven hermetically in tests.
pub struct Executor {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn DelayedQueue>,
    rate_limiter: Arc<dyn RateLimiter>,
    callback: Arc<dyn CallbackClient>,
    hub: StatusHub,
}

impl Executor {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn DelayedQueue>,
        rate_limiter: Arc<dyn RateLimiter>,
        callback: Arc<dyn CallbackClient>,
        hub: StatusHub,
    ) -> Self {
        Self {
            store,
            queue,
            rate_limiter,
            callback,
            hub,
        }
    }

    /// Run one attempt for a job. Invoked by the queue runner per delivery.
    ///
    /// Errors returned here are store failures from the pre-callback steps;
    /// everything after the callback resolves to a store write internally.
    pub async fn run(&self, job_id: Uuid, attempt_number: i32) -> Result<()> {
        // 1. Load & guard. A second delivery of the same attempt observes
        // `running` and re-enters idempotently; terminal and cancelled jobs
        // are left untouched.
        let mut job = match self.store.load_job(job_id).await {
            Ok(job) => job,
            Err(StoreError::NotFound) => {
                debug!(job_id = %job_id, "job vanished before delivery, skipping");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if !job.status.is_runnable() {
            debug!(
                job_id = %job_id,
                status = job.status.as_str(),
                "job not runnable, skipping delivery"
            );
            return Ok(());
        }

        let max_retries = job.max_retries();
        let backoff_base = job.retry_backoff_base();

        // 2. Mark running and log the start of this attempt.
        self.store
            .update_status(job_id, JobStatus::Running)
            .await?;
        job.status = JobStatus::Running;
        self.hub
            .publish_update(job_id, Some(JobStatus::Running), None)
            .await;

        self.store
            .insert_log_if_absent(NewJobLog {
                job_id,
                event_type: JobEventType::ExecutionStarted,
                attempt_number,
                idempotency_key: started_key(job_id, attempt_number),
                error_type: None,
                metadata: None,
            })
            .await?;
        self.hub
            .publish_update(
                job_id,
                Some(JobStatus::Running),
                Some(stream_log(JobEventType::ExecutionStarted)),
            )
            .await;

        // 3. Rate limit. A denial pauses the job and requeues the *same*
        // attempt number; pauses never consume retries.
        let decision = self.rate_limiter.check(&job.account_id).await?;
        if !decision.allowed {
            self.store
                .update_status(job_id, JobStatus::PausedRateLimited)
                .await?;
            self.hub
                .publish_update(job_id, Some(JobStatus::PausedRateLimited), None)
                .await;

            self.store
                .insert_log_if_absent(NewJobLog {
                    job_id,
                    event_type: JobEventType::RateLimited,
                    attempt_number,
                    idempotency_key: rate_limit_key(job_id, attempt_number),
                    error_type: None,
                    metadata: Some(json!({"wait_seconds": decision.retry_after_seconds})),
                })
                .await?;

            info!(
                job_id = %job_id,
                account_id = %job.account_id,
                wait_seconds = decision.retry_after_seconds,
                "attempt paused by rate limit"
            );

            self.queue
                .submit(
                    job_id,
                    attempt_number,
                    Duration::from_secs(decision.retry_after_seconds),
                )
                .await?;
            return Ok(());
        }

        // 4. Invoke the worker callback. No URL configured means the attempt
        // succeeds vacuously with no response to interpret.
        let response = match job.callback_url() {
            None => None,
            Some(url) => {
                let external_key = external_idempotency_key(job_id, attempt_number);
                let mut body = json!({
                    "idempotency_key": external_key,
                    "payload": job.payload.clone(),
                });
                if job.schedule_type == ScheduleType::Polling {
                    body["job_id"] = json!(job_id);
                    body["polling_state"] =
                        job.polling_state.clone().unwrap_or_else(|| json!({}));
                }

                match self.callback.call(url, &body).await {
                    Ok(response) => Some(response),
                    Err(err) => {
                        return self
                            .handle_callback_failure(
                                &job,
                                attempt_number,
                                &err,
                                max_retries,
                                backoff_base,
                            )
                            .await;
                    }
                }
            }
        };

        // 5. Interpret the reply. Unexpected failures while finalizing are
        // routed through the generic handler and retried as transient.
        match self.finish_attempt(&mut job, attempt_number, response).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.handle_execution_failure(&job, attempt_number, &err, max_retries, backoff_base)
                    .await
            }
        }
    }

    /// Success path: polling continuation, completion, cron re-park.
    async fn finish_attempt(
        &self,
        job: &mut Job,
        attempt_number: i32,
        response: Option<CallbackResponse>,
    ) -> Result<()> {
        let polling_interval = job.polling_interval_seconds.unwrap_or(0);

        if job.schedule_type == ScheduleType::Polling && polling_interval > 0 {
            if let Some(response) = response {
                return self
                    .finish_polling_attempt(job, attempt_number, response, polling_interval)
                    .await;
            }
        }

        // Non-polling (or no callback): mark completed.
        self.store
            .update_status(job.id, JobStatus::Completed)
            .await?;
        self.store
            .insert_log_if_absent(NewJobLog {
                job_id: job.id,
                event_type: JobEventType::ExecutionCompleted,
                attempt_number,
                idempotency_key: completed_key(job.id, attempt_number),
                error_type: None,
                metadata: None,
            })
            .await?;
        self.hub
            .publish_update(
                job.id,
                Some(JobStatus::Completed),
                Some(stream_log(JobEventType::ExecutionCompleted)),
            )
            .await;

        info!(
            job_id = %job.id,
            task_type = %job.task_type,
            attempt = attempt_number,
            "job completed"
        );

        // Cron jobs re-park for the driver's next fire instead of
        // terminating.
        if job.schedule_type == ScheduleType::Cron {
            self.store.update_status(job.id, JobStatus::Queued).await?;
            self.hub
                .publish_update(job.id, Some(JobStatus::Queued), None)
                .await;
        }

        Ok(())
    }

    /// Stateful polling: carry `polling_state` forward; only `done == true`
    /// finalizes, anything else (including non-JSON bodies) reschedules a
    /// fresh attempt chain.
    async fn finish_polling_attempt(
        &self,
        job: &mut Job,
        attempt_number: i32,
        response: CallbackResponse,
        polling_interval: i32,
    ) -> Result<()> {
        let body = response.body.unwrap_or_else(|| json!({}));

        if let Some(new_state) = body.get("polling_state") {
            job.polling_state = Some(new_state.clone());
        }
        let done = body.get("done").and_then(|v| v.as_bool()).unwrap_or(false);

        if done {
            self.store
                .update_polling(job.id, JobStatus::Completed, job.polling_state.clone())
                .await?;
            self.store
                .insert_log_if_absent(NewJobLog {
                    job_id: job.id,
                    event_type: JobEventType::ExecutionCompleted,
                    attempt_number,
                    idempotency_key: completed_key(job.id, attempt_number),
                    error_type: None,
                    metadata: None,
                })
                .await?;
            self.hub
                .publish_update(
                    job.id,
                    Some(JobStatus::Completed),
                    Some(stream_log(JobEventType::ExecutionCompleted)),
                )
                .await;

            info!(job_id = %job.id, attempt = attempt_number, "polling job completed");
            return Ok(());
        }

        self.store
            .update_polling(job.id, JobStatus::Queued, job.polling_state.clone())
            .await?;
        self.hub
            .publish_update(job.id, Some(JobStatus::Queued), None)
            .await;

        // A continuation is a new logical invocation, not a retry: the
        // attempt chain restarts at 1.
        self.queue
            .submit(job.id, 1, Duration::from_secs(polling_interval as u64))
            .await?;

        debug!(
            job_id = %job.id,
            interval_seconds = polling_interval,
            "polling job rescheduled"
        );
        Ok(())
    }

    /// Callback failures: classify, log, and either retry with backoff or
    /// finalize as failed.
    async fn handle_callback_failure(
        &self,
        job: &Job,
        attempt_number: i32,
        error: &CallbackError,
        max_retries: i32,
        backoff_base: i64,
    ) -> Result<()> {
        let transient = error.is_transient();
        let error_type = if transient {
            LogErrorType::Transient
        } else {
            LogErrorType::Permanent
        };

        self.store
            .insert_log_if_absent(NewJobLog {
                job_id: job.id,
                event_type: JobEventType::ExecutionFailed,
                attempt_number,
                idempotency_key: failure_key(job.id, attempt_number),
                error_type: Some(error_type),
                metadata: Some(json!({
                    "message": error.to_string(),
                    "status_code": error.status_code(),
                })),
            })
            .await?;
        self.hub
            .publish_update(
                job.id,
                Some(job.status),
                Some(stream_log(JobEventType::ExecutionFailed)),
            )
            .await;

        // `attempt <= max_retries` deliberately allows max_retries + 1 total
        // attempts: the initial run plus max_retries retries.
        if transient && attempt_number <= max_retries {
            let delay = retry_delay(backoff_base, attempt_number);
            warn!(
                job_id = %job.id,
                attempt = attempt_number,
                delay_seconds = delay.as_secs(),
                error = %error,
                "callback failed, retrying"
            );
            self.queue
                .submit(job.id, attempt_number + 1, delay)
                .await?;
        } else {
            warn!(
                job_id = %job.id,
                attempt = attempt_number,
                error = %error,
                "callback failed permanently"
            );
            self.store.update_status(job.id, JobStatus::Failed).await?;
            self.hub
                .publish_update(job.id, Some(JobStatus::Failed), None)
                .await;
        }

        Ok(())
    }

    /// Unexpected failures while finalizing an attempt: always treated as
    /// transient, same retry limit.
    async fn handle_execution_failure(
        &self,
        job: &Job,
        attempt_number: i32,
        error: &anyhow::Error,
        max_retries: i32,
        backoff_base: i64,
    ) -> Result<()> {
        self.store
            .insert_log_if_absent(NewJobLog {
                job_id: job.id,
                event_type: JobEventType::ExecutionFailed,
                attempt_number,
                idempotency_key: exception_key(job.id, attempt_number),
                error_type: Some(LogErrorType::Transient),
                metadata: Some(json!({"message": error.to_string()})),
            })
            .await?;
        self.hub
            .publish_update(
                job.id,
                Some(job.status),
                Some(stream_log(JobEventType::ExecutionFailed)),
            )
            .await;

        if attempt_number <= max_retries {
            let delay = retry_delay(backoff_base, attempt_number);
            warn!(
                job_id = %job.id,
                attempt = attempt_number,
                delay_seconds = delay.as_secs(),
                error = %error,
                "attempt errored, retrying"
            );
            self.queue
                .submit(job.id, attempt_number + 1, delay)
                .await?;
        } else {
            warn!(
                job_id = %job.id,
                attempt = attempt_number,
                error = %error,
                "attempt errored with no retries left"
            );
            self.store.update_status(job.id, JobStatus::Failed).await?;
            self.hub
                .publish_update(job.id, Some(JobStatus::Failed), None)
                .await;
        }

        Ok(())
    }
}
