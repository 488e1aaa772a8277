//! Built-in submission handlers.
//!
//! The default handler routes any `(app_name, task_type)` to the scheduling
//! primitive matching the request's schedule shape, with the worker callback
//! derived from the task type. Apps register sharper handlers on top when
//! they need their own retry policy or callback routing.

use std::sync::Arc;

use uuid::Uuid;

use super::registry::{HandlerRegistry, ScheduleRequest, SubmitRequest};
use super::submit::{JobConfig, SubmitError, Submitter};

fn config_for(request: &SubmitRequest, worker_base_url: &str) -> JobConfig {
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
        .build()
}

async fn submit_with_schedule(
    request: SubmitRequest,
    submitter: Arc<Submitter>,
    worker_base_url: String,
) -> Result<Uuid, SubmitError> {
    let config = config_for(&request, &worker_base_url);

    match request.schedule {
        ScheduleRequest::Immediate => submitter.run_immediate(&config, request.data).await,
        ScheduleRequest::RunAt { timestamp } => {
            submitter.run_at(&config, request.data, timestamp).await
        }
        ScheduleRequest::Cron { expression } => {
            submitter.run_cron(&config, request.data, &expression).await
        }
        ScheduleRequest::DelayFromNow { duration_seconds } => {
            submitter
                .run_after_delay(&config, request.data, duration_seconds)
                .await
        }
        ScheduleRequest::Polling { interval_seconds } => {
            submitter
                .run_polling(&config, request.data, interval_seconds)
                .await
        }
    }
}

/// Register the schedule-driven default handler.
pub fn register_default_handlers(registry: &mut HandlerRegistry, worker_base_url: &str) {
    let base = worker_base_url.to_string();
    registry.register_default(move |request, submitter| {
        submit_with_schedule(request, submitter, base.clone())
    });
}
