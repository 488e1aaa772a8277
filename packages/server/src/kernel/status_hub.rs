//! In-process pub/sub hub for live job status updates.
//!
//! Per-job broadcast channels feed the SSE endpoint. Publishing is
//! best-effort and fire-and-forget: a publish with no subscribers is a
//! no-op, and no failure here may affect job execution.
//!
//! Producers (the execution engine):
//!   hub.publish_update(job_id, Some(JobStatus::Running), None).await;
//!
//! Consumers (SSE endpoint):
//!   let rx = hub.subscribe(job_id).await;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use super::jobs::JobStatus;

/// Topic-keyed broadcast hub for `job_update` events.
///
/// Thread-safe, cloneable. Message payloads are `serde_json::Value` in the
/// shape `{event: "job_update", status, log}`.
#[derive(Clone)]
pub struct StatusHub {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<Value>>>>,
    capacity: usize,
}

impl StatusHub {
    /// Default capacity of 256 buffered messages per job channel.
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    fn topic(job_id: Uuid) -> String {
        format!("job:{job_id}")
    }

    /// Publish a state transition and/or log event for a job.
    ///
    /// Never blocks on slow consumers and never fails: send errors (no
    /// active receivers) are ignored.
    pub async fn publish_update(&self, job_id: Uuid, status: Option<JobStatus>, log: Option<Value>) {
        let message = json!({
            "event": "job_update",
            "status": status,
            "log": log,
        });

        let channels = self.channels.read().await;
        if let Some(tx) = channels.get(&Self::topic(job_id)) {
            let _ = tx.send(message);
        }
    }

    /// Subscribe to a job's updates. Creates the channel if needed.
    pub async fn subscribe(&self, job_id: Uuid) -> broadcast::Receiver<Value> {
        let mut channels = self.channels.write().await;
        let tx = channels
            .entry(Self::topic(job_id))
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        tx.subscribe()
    }

    /// Remove channels with zero subscribers (housekeeping).
    pub async fn cleanup(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, tx| tx.receiver_count() > 0);
    }
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}
