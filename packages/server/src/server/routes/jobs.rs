//! Job submission and status endpoints.
//!
//! POST /api/jobs/create  – validate, resolve a handler, schedule a job
//! GET  /api/jobs/:id/status – job row plus the latest log entries

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;
use uuid::Uuid;

use crate::kernel::jobs::{
    DispatchError, ScheduleRequest, StoreError, SubmitError, SubmitRequest,
};
use crate::server::app::AxumAppState;

const SCHEDULE_TYPES: [&str; 5] = ["immediate", "run_at", "cron", "delay_from_now", "polling"];

/// Raw request body; `schedule` stays untyped until validation.
#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub app_name: String,
    pub user_id: String,
    pub account_id: String,
    #[serde(default)]
    pub board_id: Option<String>,
    pub task_type: String,
    pub schedule: Value,
    #[serde(default)]
    pub data: Option<Value>,
}

/// RFC 3339 with offset, or a naive timestamp interpreted in local time;
/// either way the result is normalized to UTC.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        if let Some(local) = Local.from_local_datetime(&naive).earliest() {
            return Ok(local.with_timezone(&Utc));
        }
    }

    Err(format!(
        "schedule.timestamp must be a valid ISO 8601 datetime, got {raw:?}"
    ))
}

fn integer_field(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn validate_schedule(schedule: &Value) -> Result<ScheduleRequest, String> {
    let Some(object) = schedule.as_object() else {
        return Err("schedule must be an object".to_string());
    };

    let stype = object.get("type").and_then(|t| t.as_str()).unwrap_or("");
    if !SCHEDULE_TYPES.contains(&stype) {
        return Err(format!(
            "schedule.type must be one of: {}",
            SCHEDULE_TYPES.join(", ")
        ));
    }

    match stype {
        "immediate" => Ok(ScheduleRequest::Immediate),
        "run_at" => {
            let raw = object
                .get("timestamp")
                .and_then(|t| t.as_str())
                .filter(|t| !t.is_empty())
                .ok_or("schedule.timestamp required for type run_at")?;
            let timestamp = parse_timestamp(raw)?;
            Ok(ScheduleRequest::RunAt { timestamp })
        }
        "cron" => {
            let expression = object
                .get("expression")
                .and_then(|e| e.as_str())
                .filter(|e| !e.is_empty())
                .ok_or("schedule.expression required for type cron")?;
            Ok(ScheduleRequest::Cron {
                expression: expression.to_string(),
            })
        }
        "delay_from_now" => {
            let raw = object
                .get("duration_seconds")
                .ok_or("schedule.duration_seconds required for type delay_from_now")?;
            let duration_seconds = integer_field(raw)
                .ok_or("schedule.duration_seconds must be an integer")?;
            if duration_seconds < 0 {
                return Err("schedule.duration_seconds must be >= 0".to_string());
            }
            Ok(ScheduleRequest::DelayFromNow { duration_seconds })
        }
        "polling" => {
            let raw = object
                .get("interval_seconds")
                .ok_or("schedule.interval_seconds required for type polling")?;
            let interval_seconds = integer_field(raw)
                .ok_or("schedule.interval_seconds must be an integer")?;
            if interval_seconds <= 0 {
                return Err("schedule.interval_seconds must be > 0".to_string());
            }
            Ok(ScheduleRequest::Polling { interval_seconds })
        }
        _ => unreachable!("schedule type checked above"),
    }
}

impl CreateJobRequest {
    pub fn validate(self) -> Result<SubmitRequest, Vec<String>> {
        let mut errors = Vec::new();

        for (field, value) in [
            ("app_name", &self.app_name),
            ("user_id", &self.user_id),
            ("account_id", &self.account_id),
            ("task_type", &self.task_type),
        ] {
            if value.trim().is_empty() {
                errors.push(format!("{field} must not be blank"));
            }
        }

        let schedule = match validate_schedule(&self.schedule) {
            Ok(schedule) => Some(schedule),
            Err(e) => {
                errors.push(e);
                None
            }
        };

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(SubmitRequest {
            app_name: self.app_name,
            user_id: self.user_id,
            account_id: self.account_id,
            board_id: self.board_id,
            task_type: self.task_type,
            schedule: schedule.expect("validated above"),
            data: self.data.unwrap_or_else(|| json!({})),
        })
    }
}

pub async fn create_job_handler(
    Extension(state): Extension<AxumAppState>,
    Json(body): Json<CreateJobRequest>,
) -> Response {
    let request = match body.validate() {
        Ok(request) => request,
        Err(errors) => {
            return (StatusCode::BAD_REQUEST, Json(json!({"errors": errors}))).into_response();
        }
    };

    let deps = &state.deps;
    match deps
        .registry
        .dispatch(request, deps.submitter.clone())
        .await
    {
        Ok(id) => (StatusCode::CREATED, Json(json!({"id": id}))).into_response(),
        Err(DispatchError::NotFound {
            app_name,
            task_type,
        }) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("no handler registered for {app_name}/{task_type}")})),
        )
            .into_response(),
        Err(DispatchError::Submit(e @ SubmitError::InvalidCron(_)))
        | Err(DispatchError::Submit(e @ SubmitError::NegativeDelay(_)))
        | Err(DispatchError::Submit(e @ SubmitError::NonPositiveInterval(_))) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"errors": [e.to_string()]})),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "job submission failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal error"})),
            )
                .into_response()
        }
    }
}

pub async fn job_status_handler(
    Extension(state): Extension<AxumAppState>,
    Path(job_id): Path<Uuid>,
) -> Response {
    let deps = &state.deps;

    let job = match deps.store.load_job(job_id).await {
        Ok(job) => job,
        Err(StoreError::NotFound) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "job not found"})),
            )
                .into_response();
        }
        Err(e) => {
            error!(job_id = %job_id, error = %e, "failed to load job");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let logs = match deps.store.list_recent_logs(job_id, 20).await {
        Ok(logs) => logs,
        Err(e) => {
            error!(job_id = %job_id, error = %e, "failed to list job logs");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let logs: Vec<Value> = logs
        .into_iter()
        .map(|log| {
            json!({
                "event_type": log.event_type,
                "attempt_number": log.attempt_number,
                "error_type": log.error_type,
                "metadata": log.metadata,
                "created_at": log.created_at.to_rfc3339(),
            })
        })
        .collect();

    Json(json!({
        "job_id": job.id,
        "status": job.status,
        "task_type": job.task_type,
        "created_at": job.created_at.to_rfc3339(),
        "scheduled_at": job.scheduled_at.map(|at| at.to_rfc3339()),
        "logs": logs,
    }))
    .into_response()
}
