//! app_a's job submission handlers.
//!
//! Each task type pins its own worker callback route and retry policy:
//! bulk inserts retry aggressively, while archive, cron and polling flows
//! get fewer, slower retries. A handler that receives a schedule shape it
//! does not expect falls back to an immediate run.

use std::sync::Arc;

use uuid::Uuid;

use crate::kernel::jobs::{
    HandlerRegistry, JobConfig, ScheduleRequest, SubmitError, SubmitRequest, Submitter,
};

fn config_for(
    request: &SubmitRequest,
    worker_base_url: &str,
    max_retries: i32,
    retry_backoff_base: i64,
) -> JobConfig {
    JobConfig::builder()
        .app_name(request.app_name.clone())
        .user_id(request.user_id.clone())
        .account_id(request.account_id.clone())
        .board_id(request.board_id.clone())
        .task_type(request.task_type.clone())
        .callback_url(format!(
            "{}/internal/jobs/{}",
            worker_base_url.trim_end_matches('/'),
            request.task_type
        ))
        .max_retries(max_retries)
        .retry_backoff_base(retry_backoff_base)
        .build()
}

/// Handle bulk_excel_insert: always runs immediately.
pub async fn handle_bulk_excel_insert(
    request: SubmitRequest,
    submitter: Arc<Submitter>,
    worker_base_url: String,
) -> Result<Uuid, SubmitError> {
    let config = config_for(&request, &worker_base_url, 3, 60);
    submitter.run_immediate(&config, request.data).await
}

/// Handle delayed_archive: runs at a point in time or after a delay.
pub async fn handle_delayed_archive(
    request: SubmitRequest,
    submitter: Arc<Submitter>,
    worker_base_url: String,
) -> Result<Uuid, SubmitError> {
    let config = config_for(&request, &worker_base_url, 2, 120);

    match request.schedule {
        ScheduleRequest::RunAt { timestamp } => {
            submitter.run_at(&config, request.data, timestamp).await
        }
        ScheduleRequest::DelayFromNow { duration_seconds } => {
            submitter
                .run_after_delay(&config, request.data, duration_seconds)
                .await
        }
        _ => submitter.run_immediate(&config, request.data).await,
    }
}

/// Handle scheduled_cron_task: recurring work on a cron expression.
pub async fn handle_scheduled_cron_task(
    request: SubmitRequest,
    submitter: Arc<Submitter>,
    worker_base_url: String,
) -> Result<Uuid, SubmitError> {
    let config = config_for(&request, &worker_base_url, 2, 120);

    match request.schedule {
        ScheduleRequest::Cron { expression } => {
            submitter.run_cron(&config, request.data, &expression).await
        }
        _ => submitter.run_immediate(&config, request.data).await,
    }
}

/// Handle polling_task: repeats at a fixed interval until the worker
/// reports done.
pub async fn handle_polling_task(
    request: SubmitRequest,
    submitter: Arc<Submitter>,
    worker_base_url: String,
) -> Result<Uuid, SubmitError> {
    let config = config_for(&request, &worker_base_url, 2, 120);

    match request.schedule {
        ScheduleRequest::Polling { interval_seconds } => {
            submitter
                .run_polling(&config, request.data, interval_seconds)
                .await
        }
        _ => submitter.run_immediate(&config, request.data).await,
    }
}

/// Register all app_a job handlers with the registry.
///
/// Call this at startup to register handlers for all app_a tasks.
pub fn register_app_a_jobs(registry: &mut HandlerRegistry, worker_base_url: &str) {
    let base = worker_base_url.to_string();
    registry.register("app_a", "bulk_excel_insert", move |request, submitter| {
        handle_bulk_excel_insert(request, submitter, base.clone())
    });

    let base = worker_base_url.to_string();
    registry.register("app_a", "delayed_archive", move |request, submitter| {
        handle_delayed_archive(request, submitter, base.clone())
    });

    let base = worker_base_url.to_string();
    registry.register("app_a", "scheduled_cron_task", move |request, submitter| {
        handle_scheduled_cron_task(request, submitter, base.clone())
    });

    let base = worker_base_url.to_string();
    registry.register("app_a", "polling_task", move |request, submitter| {
        handle_polling_task(request, submitter, base.clone())
    });
}
