//! Central dependency container for the server.
//!
//! Every external capability sits behind a trait so the HTTP surface and
//! the engine can be driven with in-memory doubles in tests.

use std::sync::Arc;

use super::callback::CallbackClient;
use super::jobs::{DelayedQueue, HandlerRegistry, JobStore, Submitter};
use super::rate_limit::RateLimiter;
use super::status_hub::StatusHub;

/// Server dependencies shared by routes and background services.
#[derive(Clone)]
pub struct ServerDeps {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn DelayedQueue>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub callback: Arc<dyn CallbackClient>,
    /// In-process pub/sub hub feeding the SSE status stream.
    pub status_hub: StatusHub,
    pub submitter: Arc<Submitter>,
    pub registry: Arc<HandlerRegistry>,
}

impl ServerDeps {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn DelayedQueue>,
        rate_limiter: Arc<dyn RateLimiter>,
        callback: Arc<dyn CallbackClient>,
        status_hub: StatusHub,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        let submitter = Arc::new(Submitter::new(store.clone(), queue.clone()));
        Self {
            store,
            queue,
            rate_limiter,
            callback,
            status_hub,
            submitter,
            registry,
        }
    }
}
