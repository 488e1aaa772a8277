//! Delayed task queue feeding the execution engine.
//!
//! The engine never talks to a concrete broker: it sees [`DelayedQueue`],
//! which accepts `(job_id, attempt_number, delay)` and promises at-least-once
//! redelivery after the delay. [`TokioDelayedQueue`] is the in-process
//! implementation; [`QueueRunner`] is the long-running service that drains
//! deliveries and hands each one to the executor.
//!
//! ```text
//! Submitter / Executor / CronDriver
//!     │  submit(job_id, attempt, delay)
//!     ▼
//! TokioDelayedQueue ── sleep(delay) ──► mpsc channel
//!                                           │
//!                                           ▼
//!                                      QueueRunner ──► Executor::run(job_id, attempt)
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::executor::Executor;

/// One pending invocation of the execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub job_id: Uuid,
    /// 1-based position within the current retry chain.
    pub attempt_number: i32,
}

/// Abstract delayed task queue.
///
/// Every `submit` produces exactly one independent future delivery, no
/// earlier than `delay` after the call. No ordering is guaranteed across
/// jobs and redelivery may duplicate; the engine's status guard and
/// idempotency keys absorb both.
#[async_trait]
pub trait DelayedQueue: Send + Sync {
    async fn submit(&self, job_id: Uuid, attempt_number: i32, delay: Duration) -> Result<()>;
}

/// In-process queue backed by timer tasks and an mpsc channel.
#[derive(Clone)]
pub struct TokioDelayedQueue {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl TokioDelayedQueue {
    /// Create the queue and the receiving end for a [`QueueRunner`].
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl DelayedQueue for TokioDelayedQueue {
    async fn submit(&self, job_id: Uuid, attempt_number: i32, delay: Duration) -> Result<()> {
        let delivery = Delivery {
            job_id,
            attempt_number,
        };

        if delay.is_zero() {
            return self
                .tx
                .send(delivery)
                .map_err(|_| anyhow!("delayed queue is shut down"));
        }

        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(delivery).is_err() {
                debug!(job_id = %delivery.job_id, "queue receiver gone, dropping delivery");
            }
        });

        Ok(())
    }
}

/// Configuration for the queue runner.
#[derive(Debug, Clone)]
pub struct QueueRunnerConfig {
    /// Worker ID for this instance, used in logs.
    pub worker_id: String,
}

impl Default for QueueRunnerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("runner-{}", Uuid::new_v4()),
        }
    }
}

/// Background service that dispatches queue deliveries to the executor.
///
/// Attempts run concurrently across jobs; each delivery gets its own task.
/// Within one job, concurrent attempts are possible only on double delivery,
/// which the executor tolerates.
pub struct QueueRunner {
    rx: mpsc::UnboundedReceiver<Delivery>,
    executor: Arc<Executor>,
    config: QueueRunnerConfig,
}

impl QueueRunner {
    pub fn new(rx: mpsc::UnboundedReceiver<Delivery>, executor: Arc<Executor>) -> Self {
        Self {
            rx,
            executor,
            config: QueueRunnerConfig::default(),
        }
    }

    pub fn with_config(
        rx: mpsc::UnboundedReceiver<Delivery>,
        executor: Arc<Executor>,
        config: QueueRunnerConfig,
    ) -> Self {
        Self {
            rx,
            executor,
            config,
        }
    }

    /// Run until the channel closes or shutdown is requested.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        info!(worker_id = %self.config.worker_id, "queue runner starting");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = self.rx.recv() => {
                    let Some(delivery) = delivery else { break };

                    debug!(
                        job_id = %delivery.job_id,
                        attempt = delivery.attempt_number,
                        "delivery received"
                    );

                    let executor = self.executor.clone();
                    tokio::spawn(async move {
                        if let Err(e) = executor
                            .run(delivery.job_id, delivery.attempt_number)
                            .await
                        {
                            error!(
                                job_id = %delivery.job_id,
                                attempt = delivery.attempt_number,
                                error = %e,
                                "attempt aborted on store failure"
                            );
                        }
                    });
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "queue runner stopped");
        Ok(())
    }
}
