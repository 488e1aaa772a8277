//! In-memory doubles for driving the engine without Postgres or a worker.
//!
//! [`MemoryJobStore`] implements the full [`JobStore`] contract over locked
//! maps; [`RecordingQueue`] captures queue submissions for inspection and
//! manual pumping; [`ScriptedCallbackClient`] plays back a programmed
//! sequence of worker replies while recording request bodies.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::kernel::callback::{CallbackClient, CallbackError, CallbackResponse};

use super::job::{AppUser, Job, JobLog, JobStatus, NewJobLog};
use super::queue::DelayedQueue;
use super::store::{JobStore, StoreError};

pub use crate::kernel::rate_limit::MemoryRateLimiter;

// ============================================================================
// MemoryJobStore
// ============================================================================

/// In-memory job store with the same uniqueness semantics as Postgres.
#[derive(Default)]
pub struct MemoryJobStore {
    users: RwLock<HashMap<(String, String), AppUser>>,
    jobs: RwLock<HashMap<Uuid, Job>>,
    logs: RwLock<Vec<JobLog>>,
    next_user_id: AtomicI64,
    next_log_id: AtomicI64,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot a job for assertions.
    pub fn job(&self, id: Uuid) -> Option<Job> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    /// All jobs, in no particular order.
    pub fn jobs(&self) -> Vec<Job> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// All log entries for a job, oldest first.
    pub fn logs_for(&self, job_id: Uuid) -> Vec<JobLog> {
        self.logs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|l| l.job_id == job_id)
            .cloned()
            .collect()
    }

    /// Directly overwrite a job, e.g. to simulate external cancellation.
    pub fn put_job(&self, job: Job) {
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.id, job);
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get_or_create_user(
        &self,
        app_name: &str,
        external_user_id: &str,
    ) -> Result<AppUser, StoreError> {
        let key = (app_name.to_string(), external_user_id.to_string());
        let mut users = self.users.write().unwrap_or_else(|e| e.into_inner());

        if let Some(user) = users.get(&key) {
            return Ok(user.clone());
        }

        let user = AppUser {
            id: self.next_user_id.fetch_add(1, Ordering::SeqCst) + 1,
            app_name: app_name.to_string(),
            external_user_id: external_user_id.to_string(),
            created_at: Utc::now(),
        };
        users.insert(key, user.clone());
        Ok(user)
    }

    async fn create_job(&self, job: Job) -> Result<Job, StoreError> {
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.id, job.clone());
        Ok(job)
    }

    async fn load_job(&self, id: Uuid) -> Result<Job, StoreError> {
        self.job(id).ok_or(StoreError::NotFound)
    }

    async fn update_status(&self, id: Uuid, status: JobStatus) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        job.status = status;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn update_schedule(
        &self,
        id: Uuid,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        job.scheduled_at = scheduled_at;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn update_polling(
        &self,
        id: Uuid,
        status: JobStatus,
        polling_state: Option<Value>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        job.status = status;
        job.polling_state = polling_state;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_log_if_absent(&self, log: NewJobLog) -> Result<(JobLog, bool), StoreError> {
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = logs
            .iter()
            .find(|l| l.idempotency_key == log.idempotency_key)
        {
            return Ok((existing.clone(), false));
        }

        let row = JobLog {
            id: self.next_log_id.fetch_add(1, Ordering::SeqCst) + 1,
            job_id: log.job_id,
            event_type: log.event_type,
            attempt_number: log.attempt_number,
            idempotency_key: log.idempotency_key,
            error_type: log.error_type,
            metadata: log.metadata,
            created_at: Utc::now(),
        };
        logs.push(row.clone());
        Ok((row, true))
    }

    async fn query_due_cron_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let mut due: Vec<Job> = jobs
            .values()
            .filter(|j| {
                j.schedule_type == super::job::ScheduleType::Cron
                    && j.status == JobStatus::Queued
                    && j.scheduled_at.map(|at| at <= now).unwrap_or(false)
                    && j.cron_expression
                        .as_deref()
                        .map(|e| !e.is_empty())
                        .unwrap_or(false)
            })
            .cloned()
            .collect();
        due.sort_by_key(|j| j.scheduled_at);
        Ok(due)
    }

    async fn list_recent_logs(
        &self,
        job_id: Uuid,
        limit: i64,
    ) -> Result<Vec<JobLog>, StoreError> {
        let logs = self.logs.read().unwrap_or_else(|e| e.into_inner());
        let mut recent: Vec<JobLog> = logs.iter().filter(|l| l.job_id == job_id).cloned().collect();
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        recent.truncate(limit as usize);
        Ok(recent)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

// ============================================================================
// RecordingQueue
// ============================================================================

/// One captured queue submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedSubmission {
    pub job_id: Uuid,
    pub attempt_number: i32,
    pub delay: Duration,
}

/// Queue double that records submissions instead of delivering them.
///
/// Tests drain the recorded submissions and invoke the executor themselves,
/// which makes redelivery, replay and timing assertions deterministic.
#[derive(Default)]
pub struct RecordingQueue {
    submissions: RwLock<Vec<QueuedSubmission>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submissions(&self) -> Vec<QueuedSubmission> {
        self.submissions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn submission_count(&self) -> usize {
        self.submissions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Remove and return all captured submissions, oldest first.
    pub fn drain(&self) -> Vec<QueuedSubmission> {
        std::mem::take(&mut *self.submissions.write().unwrap_or_else(|e| e.into_inner()))
    }
}

#[async_trait]
impl DelayedQueue for RecordingQueue {
    async fn submit(&self, job_id: Uuid, attempt_number: i32, delay: Duration) -> Result<()> {
        self.submissions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(QueuedSubmission {
                job_id,
                attempt_number,
                delay,
            });
        Ok(())
    }
}

// ============================================================================
// ScriptedCallbackClient
// ============================================================================

/// Callback double that replays a scripted sequence of worker replies.
pub struct ScriptedCallbackClient {
    script: Mutex<VecDeque<Result<CallbackResponse, CallbackError>>>,
    requests: RwLock<Vec<(String, Value)>>,
}

impl ScriptedCallbackClient {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            requests: RwLock::new(Vec::new()),
        }
    }

    /// Queue a 2xx reply with an optional JSON body.
    pub fn push_success(&self, body: Option<Value>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Ok(CallbackResponse { status: 200, body }));
    }

    /// Queue a non-2xx reply.
    pub fn push_http_error(&self, status: u16) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Err(CallbackError::Http { status }));
    }

    /// Queue a transport failure.
    pub fn push_transport_error(&self, message: &str) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Err(CallbackError::Transport(message.to_string())));
    }

    /// Bodies sent to the worker, in call order.
    pub fn requests(&self) -> Vec<(String, Value)> {
        self.requests
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Default for ScriptedCallbackClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CallbackClient for ScriptedCallbackClient {
    async fn call(&self, url: &str, body: &Value) -> Result<CallbackResponse, CallbackError> {
        self.requests
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((url.to_string(), body.clone()));

        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(Ok(CallbackResponse {
                status: 200,
                body: None,
            }))
    }
}
