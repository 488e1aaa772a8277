//! Job infrastructure: scheduling, queueing and callback execution.
//!
//! This module provides the kernel-level machinery for durable jobs:
//! - [`JobStore`] / [`PostgresJobStore`] - durable record of jobs and logs
//! - [`DelayedQueue`] / [`TokioDelayedQueue`] - abstract delayed task queue
//! - [`Submitter`] - submission primitives that create and enqueue jobs
//! - [`Executor`] - the job runner invoked once per queue delivery
//! - [`HandlerRegistry`] - maps `(app_name, task_type)` to submissions
//! - cron driver - periodic sweep for recurring jobs
//!
//! # Architecture
//!
//! ```text
//! HTTP ingress ─► HandlerRegistry ─► Submitter
//!     │                                 └─► JobStore insert + DelayedQueue.submit
//!     │
//! QueueRunner (per delivery)
//!     ├─► Executor::run(job_id, attempt)
//!     │       ├─► RateLimiter.check(account_id)
//!     │       ├─► CallbackClient.call(callback_url, body)
//!     │       ├─► JobStore log writes (idempotency keys)
//!     │       └─► StatusHub.publish_update
//!     └─► requeue on retry / rate pause / polling continuation
//!
//! CronDriver (every 60 s)
//!     └─► query_due_cron_jobs ─► DelayedQueue.submit + cursor advance
//! ```

pub mod cron_driver;
mod executor;
pub mod handlers;
mod job;
mod queue;
mod registry;
mod store;
mod submit;
pub mod testing;

pub use executor::{external_idempotency_key, retry_delay, Executor, MAX_RETRY_DELAY_SECONDS};
pub use job::{
    AppUser, Job, JobEventType, JobLog, JobStatus, LogErrorType, NewJobLog, ScheduleType,
    DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BACKOFF_BASE,
};
pub use queue::{DelayedQueue, Delivery, QueueRunner, QueueRunnerConfig, TokioDelayedQueue};
pub use registry::{DispatchError, HandlerRegistry, ScheduleRequest, SubmitRequest};
pub use store::{JobStore, PostgresJobStore, StoreError};
pub use submit::{JobConfig, SubmitError, Submitter};
