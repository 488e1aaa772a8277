//! End-to-end engine scenarios over in-memory capabilities.
//!
//! Each test drives the executor exactly the way the queue runner would:
//! submissions are captured by a recording queue, and the test pumps the
//! resulting deliveries into `Executor::run` by hand so timing and replay
//! are deterministic.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use server_core::kernel::jobs::testing::{
    MemoryJobStore, MemoryRateLimiter, QueuedSubmission, RecordingQueue, ScriptedCallbackClient,
};
use server_core::kernel::jobs::{
    Executor, JobConfig, JobEventType, JobStatus, LogErrorType, ScheduleType, Submitter,
};
use server_core::kernel::StatusHub;

struct Harness {
    store: Arc<MemoryJobStore>,
    queue: Arc<RecordingQueue>,
    callback: Arc<ScriptedCallbackClient>,
    hub: StatusHub,
    submitter: Submitter,
    executor: Executor,
}

fn harness() -> Harness {
    harness_with_rate_limit(u64::MAX)
}

fn harness_with_rate_limit(limit: u64) -> Harness {
    let store = Arc::new(MemoryJobStore::new());
    let queue = Arc::new(RecordingQueue::new());
    let limiter = Arc::new(MemoryRateLimiter::with_limit(limit));
    let callback = Arc::new(ScriptedCallbackClient::new());
    let hub = StatusHub::new();

    let submitter = Submitter::new(store.clone(), queue.clone());
    let executor = Executor::new(
        store.clone(),
        queue.clone(),
        limiter,
        callback.clone(),
        hub.clone(),
    );

    Harness {
        store,
        queue,
        callback,
        hub,
        submitter,
        executor,
    }
}

fn config() -> JobConfig {
    JobConfig::builder()
        .app_name("app_a")
        .user_id("user-1")
        .account_id("acct-1")
        .task_type("bulk_insert")
        .callback_url("http://worker.local/internal/jobs/bulk_insert")
        .build()
}

/// Pump every captured delivery through the executor, collecting new ones
/// as they appear, until the queue is drained.
async fn pump(h: &Harness) -> Vec<QueuedSubmission> {
    let mut processed = Vec::new();
    loop {
        let batch = h.queue.drain();
        if batch.is_empty() {
            break;
        }
        for delivery in batch {
            h.executor
                .run(delivery.job_id, delivery.attempt_number)
                .await
                .unwrap();
            processed.push(delivery);
        }
    }
    processed
}

// ============================================================================
// Scenario: immediate success
// ============================================================================

#[tokio::test]
async fn immediate_job_completes_on_first_attempt() {
    let h = harness();
    h.callback.push_success(None);

    let id = h
        .submitter
        .run_immediate(&config(), json!({"x": 1}))
        .await
        .unwrap();

    let submissions = h.queue.drain();
    assert_eq!(
        submissions,
        vec![QueuedSubmission {
            job_id: id,
            attempt_number: 1,
            delay: Duration::ZERO,
        }]
    );

    h.executor.run(id, 1).await.unwrap();

    let job = h.store.job(id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.schedule_type, ScheduleType::Immediate);

    let logs = h.store.logs_for(id);
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].event_type, JobEventType::ExecutionStarted);
    assert_eq!(logs[0].attempt_number, 1);
    assert_eq!(logs[1].event_type, JobEventType::ExecutionCompleted);
    assert_eq!(logs[1].attempt_number, 1);

    // The worker saw the per-attempt external key and the merged payload.
    let requests = h.callback.requests();
    assert_eq!(requests.len(), 1);
    let (url, body) = &requests[0];
    assert_eq!(url, "http://worker.local/internal/jobs/bulk_insert");
    assert_eq!(body["idempotency_key"], format!("{id}_1"));
    assert_eq!(body["payload"]["data"], json!({"x": 1}));

    // Nothing further was queued.
    assert_eq!(h.queue.submission_count(), 0);
}

#[tokio::test]
async fn job_without_callback_url_completes_without_calling_worker() {
    let h = harness();
    let mut cfg = config();
    cfg.callback_url = String::new();

    let id = h.submitter.run_immediate(&cfg, json!({})).await.unwrap();
    h.queue.drain();
    h.executor.run(id, 1).await.unwrap();

    assert_eq!(h.store.job(id).unwrap().status, JobStatus::Completed);
    assert_eq!(h.callback.call_count(), 0);
}

// ============================================================================
// Scenario: run-at in the future
// ============================================================================

#[tokio::test]
async fn run_at_schedules_with_the_remaining_delay() {
    let h = harness();
    let at = Utc::now() + chrono::Duration::seconds(120);

    let id = h
        .submitter
        .run_at(&config(), json!({}), at)
        .await
        .unwrap();

    let job = h.store.job(id).unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.schedule_type, ScheduleType::RunAt);
    assert_eq!(job.scheduled_at, Some(at));

    let submissions = h.queue.drain();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].attempt_number, 1);
    let delay = submissions[0].delay.as_secs();
    assert!((118..=120).contains(&delay), "delay was {delay}s");
}

// ============================================================================
// Scenario: transient retry then success
// ============================================================================

#[tokio::test]
async fn transient_failure_retries_with_backoff_then_succeeds() {
    let h = harness();
    h.callback.push_http_error(503);
    h.callback.push_success(None);

    let id = h
        .submitter
        .run_immediate(&config(), json!({}))
        .await
        .unwrap();

    // Attempt 1 fails with 503.
    let first = h.queue.drain();
    assert_eq!(first[0].attempt_number, 1);
    h.executor.run(id, 1).await.unwrap();

    // The retry carries attempt 2 after the base backoff of 60 s.
    let retries = h.queue.drain();
    assert_eq!(
        retries,
        vec![QueuedSubmission {
            job_id: id,
            attempt_number: 2,
            delay: Duration::from_secs(60),
        }]
    );

    // Attempt 2 succeeds.
    h.executor.run(id, 2).await.unwrap();
    assert_eq!(h.store.job(id).unwrap().status, JobStatus::Completed);

    let logs = h.store.logs_for(id);
    let kinds: Vec<(JobEventType, i32)> = logs
        .iter()
        .map(|l| (l.event_type, l.attempt_number))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (JobEventType::ExecutionStarted, 1),
            (JobEventType::ExecutionFailed, 1),
            (JobEventType::ExecutionStarted, 2),
            (JobEventType::ExecutionCompleted, 2),
        ]
    );

    let failure = &logs[1];
    assert_eq!(failure.error_type, Some(LogErrorType::Transient));
    let metadata = failure.metadata.as_ref().unwrap();
    assert_eq!(metadata["status_code"], 503);

    // Both callback bodies carried distinct external keys.
    let requests = h.callback.requests();
    assert_eq!(requests[0].1["idempotency_key"], format!("{id}_1"));
    assert_eq!(requests[1].1["idempotency_key"], format!("{id}_2"));
}

#[tokio::test]
async fn backoff_doubles_across_consecutive_failures() {
    let h = harness();
    h.callback.push_http_error(503);
    h.callback.push_http_error(503);
    h.callback.push_success(None);

    let id = h
        .submitter
        .run_immediate(&config(), json!({}))
        .await
        .unwrap();
    h.queue.drain();

    h.executor.run(id, 1).await.unwrap();
    let retry1 = h.queue.drain();
    assert_eq!(retry1[0].delay, Duration::from_secs(60));

    h.executor.run(id, 2).await.unwrap();
    let retry2 = h.queue.drain();
    assert_eq!(retry2[0].delay, Duration::from_secs(120));
    assert_eq!(retry2[0].attempt_number, 3);

    h.executor.run(id, 3).await.unwrap();
    assert_eq!(h.store.job(id).unwrap().status, JobStatus::Completed);
}

// ============================================================================
// Scenario: permanent failure
// ============================================================================

#[tokio::test]
async fn permanent_failure_finalizes_without_retry() {
    let h = harness();
    h.callback.push_http_error(400);

    let id = h
        .submitter
        .run_immediate(&config(), json!({}))
        .await
        .unwrap();
    h.queue.drain();
    h.executor.run(id, 1).await.unwrap();

    assert_eq!(h.store.job(id).unwrap().status, JobStatus::Failed);
    assert_eq!(h.queue.submission_count(), 0);

    let logs = h.store.logs_for(id);
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[1].event_type, JobEventType::ExecutionFailed);
    assert_eq!(logs[1].error_type, Some(LogErrorType::Permanent));
    assert_eq!(logs[1].metadata.as_ref().unwrap()["status_code"], 400);
}

#[tokio::test]
async fn retries_exhaust_after_max_retries_plus_one_attempts() {
    let h = harness();
    for _ in 0..3 {
        h.callback.push_http_error(503);
    }

    let mut cfg = config();
    cfg.max_retries = 1;

    let id = h.submitter.run_immediate(&cfg, json!({})).await.unwrap();
    let processed = pump(&h).await;

    // Initial attempt plus max_retries retries: two total deliveries.
    assert_eq!(processed.len(), 2);
    assert_eq!(processed[1].attempt_number, 2);
    assert_eq!(h.store.job(id).unwrap().status, JobStatus::Failed);
    assert_eq!(h.callback.call_count(), 2);
}

// ============================================================================
// Scenario: rate-limited pause
// ============================================================================

#[tokio::test]
async fn rate_limited_attempt_pauses_and_requeues_same_attempt() {
    let h = harness_with_rate_limit(0);

    let id = h
        .submitter
        .run_immediate(&config(), json!({}))
        .await
        .unwrap();
    h.queue.drain();
    h.executor.run(id, 1).await.unwrap();

    let job = h.store.job(id).unwrap();
    assert_eq!(job.status, JobStatus::PausedRateLimited);

    // No callback was attempted.
    assert_eq!(h.callback.call_count(), 0);

    let logs = h.store.logs_for(id);
    assert_eq!(logs[1].event_type, JobEventType::RateLimited);
    let wait = logs[1].metadata.as_ref().unwrap()["wait_seconds"]
        .as_u64()
        .unwrap();
    assert!((1..=60).contains(&wait));

    // Requeued with the *same* attempt number: pauses never consume retries.
    let requeued = h.queue.drain();
    assert_eq!(requeued.len(), 1);
    assert_eq!(requeued[0].attempt_number, 1);
    assert_eq!(requeued[0].delay.as_secs(), wait);
}

#[tokio::test]
async fn paused_job_resumes_as_attempt_one_when_window_frees() {
    let h = harness_with_rate_limit(0);
    let id = h
        .submitter
        .run_immediate(&config(), json!({}))
        .await
        .unwrap();
    h.queue.drain();
    h.executor.run(id, 1).await.unwrap();
    assert_eq!(
        h.store.job(id).unwrap().status,
        JobStatus::PausedRateLimited
    );

    let requeued = h.queue.drain();
    assert_eq!(requeued[0].attempt_number, 1);

    // Redelivery lands once the window has capacity again.
    let callback = Arc::new(ScriptedCallbackClient::new());
    callback.push_success(None);
    let resumed_executor = Executor::new(
        h.store.clone(),
        h.queue.clone(),
        Arc::new(MemoryRateLimiter::new()),
        callback.clone(),
        h.hub.clone(),
    );

    resumed_executor.run(id, 1).await.unwrap();

    let job = h.store.job(id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(callback.call_count(), 1);

    // Attempt number never advanced past 1.
    let logs = h.store.logs_for(id);
    assert!(logs.iter().all(|l| l.attempt_number == 1));
    assert!(logs
        .iter()
        .any(|l| l.event_type == JobEventType::ExecutionCompleted));
}

// ============================================================================
// Scenario: polling two-step
// ============================================================================

#[tokio::test]
async fn polling_job_carries_state_and_completes_when_done() {
    let h = harness();
    h.callback.push_success(Some(
        json!({"polling_state": {"last_row_index": 100}, "done": false}),
    ));
    h.callback.push_success(Some(
        json!({"polling_state": {"last_row_index": 200}, "done": true}),
    ));

    let id = h
        .submitter
        .run_polling(&config(), json!({}), 10)
        .await
        .unwrap();

    // First poll: not done, state carried, rescheduled after the interval
    // as a fresh attempt chain.
    let first = h.queue.drain();
    assert_eq!(first[0].attempt_number, 1);
    h.executor.run(id, 1).await.unwrap();

    let job = h.store.job(id).unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.polling_state, Some(json!({"last_row_index": 100})));

    let continuation = h.queue.drain();
    assert_eq!(
        continuation,
        vec![QueuedSubmission {
            job_id: id,
            attempt_number: 1,
            delay: Duration::from_secs(10),
        }]
    );

    // Second poll: done.
    h.executor.run(id, 1).await.unwrap();

    let job = h.store.job(id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.polling_state, Some(json!({"last_row_index": 200})));

    let completed: Vec<_> = h
        .store
        .logs_for(id)
        .into_iter()
        .filter(|l| l.event_type == JobEventType::ExecutionCompleted)
        .collect();
    assert_eq!(completed.len(), 1);
    assert_eq!(h.queue.submission_count(), 0);

    // Both polls carried job_id and the prior polling state.
    let requests = h.callback.requests();
    assert_eq!(requests[0].1["polling_state"], json!({}));
    assert_eq!(requests[0].1["job_id"], json!(id));
    assert_eq!(
        requests[1].1["polling_state"],
        json!({"last_row_index": 100})
    );
}

#[tokio::test]
async fn polling_tolerates_missing_done_and_state_fields() {
    let h = harness();
    // Worker returns junk without done/polling_state: treated as not done,
    // state unchanged.
    h.callback.push_success(Some(json!({"something": "else"})));

    let id = h
        .submitter
        .run_polling(&config(), json!({}), 5)
        .await
        .unwrap();
    h.queue.drain();
    h.executor.run(id, 1).await.unwrap();

    let job = h.store.job(id).unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.polling_state, Some(json!({})));
    assert_eq!(h.queue.submission_count(), 1);
}

// ============================================================================
// Cron jobs re-park instead of terminating
// ============================================================================

#[tokio::test]
async fn cron_job_returns_to_queued_after_completion() {
    let h = harness();
    h.callback.push_success(None);

    let id = h
        .submitter
        .run_cron(&config(), json!({}), "*/5 * * * *")
        .await
        .unwrap();

    // The submitter never queues cron jobs directly.
    assert_eq!(h.queue.submission_count(), 0);

    // Simulate the driver firing a due job.
    h.executor.run(id, 1).await.unwrap();

    let job = h.store.job(id).unwrap();
    assert_eq!(job.status, JobStatus::Queued);

    let logs = h.store.logs_for(id);
    assert!(logs
        .iter()
        .any(|l| l.event_type == JobEventType::ExecutionCompleted));
}

// ============================================================================
// Idempotent replay
// ============================================================================

#[tokio::test]
async fn replaying_a_delivery_for_a_finished_job_is_a_noop() {
    let h = harness();
    h.callback.push_success(None);

    let id = h
        .submitter
        .run_immediate(&config(), json!({}))
        .await
        .unwrap();
    h.queue.drain();
    h.executor.run(id, 1).await.unwrap();

    let logs_before = h.store.logs_for(id);
    assert_eq!(h.callback.call_count(), 1);

    // The queue redelivers: the guard sees a terminal status and returns.
    h.executor.run(id, 1).await.unwrap();

    assert_eq!(h.store.logs_for(id).len(), logs_before.len());
    assert_eq!(h.callback.call_count(), 1);
    assert_eq!(h.store.job(id).unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn double_delivery_of_a_running_attempt_converges() {
    let h = harness();
    h.callback.push_success(None);
    h.callback.push_success(None);

    let id = h
        .submitter
        .run_immediate(&config(), json!({}))
        .await
        .unwrap();
    h.queue.drain();

    // Simulate the job already being mid-attempt when a duplicate arrives.
    let mut job = h.store.job(id).unwrap();
    job.status = JobStatus::Running;
    h.store.put_job(job);

    h.executor.run(id, 1).await.unwrap();

    // Logs converge on one row per (attempt, kind); the worker may see the
    // duplicate but receives the same external key for dedupe.
    let started: Vec<_> = h
        .store
        .logs_for(id)
        .into_iter()
        .filter(|l| l.event_type == JobEventType::ExecutionStarted)
        .collect();
    assert_eq!(started.len(), 1);
    assert_eq!(h.store.job(id).unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn cancelled_job_is_left_untouched() {
    let h = harness();

    let id = h
        .submitter
        .run_immediate(&config(), json!({}))
        .await
        .unwrap();
    h.queue.drain();

    // External API cancelled the job before delivery.
    let mut job = h.store.job(id).unwrap();
    job.status = JobStatus::Cancelled;
    h.store.put_job(job);

    h.executor.run(id, 1).await.unwrap();

    assert_eq!(h.store.job(id).unwrap().status, JobStatus::Cancelled);
    assert!(h.store.logs_for(id).is_empty());
    assert_eq!(h.callback.call_count(), 0);
}

#[tokio::test]
async fn missing_job_delivery_is_skipped_cleanly() {
    let h = harness();
    h.executor.run(uuid::Uuid::new_v4(), 1).await.unwrap();
    assert_eq!(h.callback.call_count(), 0);
}

// ============================================================================
// Status stream
// ============================================================================

#[tokio::test]
async fn lifecycle_transitions_are_published_to_subscribers() {
    let h = harness();
    h.callback.push_success(None);

    let id = h
        .submitter
        .run_immediate(&config(), json!({}))
        .await
        .unwrap();

    let mut rx = h.hub.subscribe(id).await;
    h.queue.drain();
    h.executor.run(id, 1).await.unwrap();

    let mut statuses = Vec::new();
    while let Ok(message) = rx.try_recv() {
        assert_eq!(message["event"], "job_update");
        if let Some(status) = message["status"].as_str() {
            statuses.push(status.to_string());
        }
    }

    assert!(statuses.contains(&"running".to_string()));
    assert_eq!(statuses.last().unwrap(), "completed");
}

// ============================================================================
// Invariants across a mixed run
// ============================================================================

#[tokio::test]
async fn idempotency_keys_stay_globally_unique() {
    let h = harness();
    h.callback.push_http_error(503);
    h.callback.push_success(None);
    h.callback.push_http_error(400);

    let job_a = h
        .submitter
        .run_immediate(&config(), json!({}))
        .await
        .unwrap();
    let job_b = h
        .submitter
        .run_immediate(&config(), json!({}))
        .await
        .unwrap();

    pump(&h).await;

    let mut keys: Vec<String> = h
        .store
        .logs_for(job_a)
        .into_iter()
        .chain(h.store.logs_for(job_b))
        .map(|l| l.idempotency_key)
        .collect();
    let total = keys.len();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), total);
}
