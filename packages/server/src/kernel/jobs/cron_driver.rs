//! Periodic sweep that enqueues due cron jobs and advances their cursor.
//!
//! The sweep runs every 60 seconds. For each due job it submits a fresh
//! attempt chain to the delayed queue, then moves `scheduled_at` strictly
//! past `now` so the same window never enqueues twice. Cron parse failures
//! are logged and skipped; the driver itself never crashes on a bad job.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{debug, info, warn};

use crate::kernel::cron;

use super::queue::DelayedQueue;
use super::store::JobStore;

/// One sweep pass. Returns the number of jobs enqueued.
pub async fn enqueue_due_cron_jobs(
    store: &Arc<dyn JobStore>,
    queue: &Arc<dyn DelayedQueue>,
    now: DateTime<Utc>,
) -> Result<usize> {
    let due = store.query_due_cron_jobs(now).await?;
    let count = due.len();

    for job in due {
        queue
            .submit(job.id, 1, std::time::Duration::ZERO)
            .await?;

        let Some(expression) = job.cron_expression.as_deref() else {
            // query_due_cron_jobs filters these out; guard anyway.
            continue;
        };

        match cron::next_fire(expression, now) {
            Ok(next) => {
                store.update_schedule(job.id, Some(next)).await?;
                debug!(job_id = %job.id, next_fire = %next, "cron cursor advanced");
            }
            Err(e) => {
                // Leave the cursor alone; the job stays eligible next sweep.
                warn!(job_id = %job.id, error = %e, "cron advancement failed");
            }
        }
    }

    Ok(count)
}

/// Start the periodic driver. Fires at second 0 of every minute.
pub async fn start_cron_driver(
    store: Arc<dyn JobStore>,
    queue: Arc<dyn DelayedQueue>,
) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let sweep = CronJob::new_async("0 * * * * *", move |_uuid, _lock| {
        let store = store.clone();
        let queue = queue.clone();
        Box::pin(async move {
            match enqueue_due_cron_jobs(&store, &queue, Utc::now()).await {
                Ok(0) => {}
                Ok(count) => info!(count, "cron sweep enqueued due jobs"),
                Err(e) => tracing::error!(error = %e, "cron sweep failed"),
            }
        })
    })?;

    scheduler.add(sweep).await?;
    scheduler.start().await?;

    info!("cron driver started (sweep every 60 seconds)");
    Ok(scheduler)
}
