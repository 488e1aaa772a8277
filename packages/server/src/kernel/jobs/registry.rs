//! Handler registry mapping submissions to scheduling primitives.
//!
//! Ingress hands a validated [`SubmitRequest`] to the registry, which looks
//! up a handler by `(app_name, task_type)`. Handlers are boxed async
//! closures over the shared [`Submitter`]: they decide the callback URL,
//! retry policy and which primitive to use, then return the new job id.
//! A registered default handler catches submissions no app claims.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::submit::{SubmitError, Submitter};

/// Validated schedule shape from the ingress API.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleRequest {
    Immediate,
    RunAt { timestamp: DateTime<Utc> },
    Cron { expression: String },
    DelayFromNow { duration_seconds: i64 },
    Polling { interval_seconds: i64 },
}

/// Validated submission payload handed to handlers.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub app_name: String,
    pub user_id: String,
    pub account_id: String,
    pub board_id: Option<String>,
    pub task_type: String,
    pub schedule: ScheduleRequest,
    pub data: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no handler registered for {app_name}/{task_type}")]
    NotFound {
        app_name: String,
        task_type: String,
    },
    #[error(transparent)]
    Submit(#[from] SubmitError),
}

/// Type alias for the boxed async handler.
type BoxedHandler = Box<
    dyn Fn(SubmitRequest, Arc<Submitter>) -> Pin<Box<dyn Future<Output = Result<Uuid, SubmitError>> + Send>>
        + Send
        + Sync,
>;

/// Registry of submission handlers keyed by `(app_name, task_type)`.
///
/// Apps register their handlers at startup; the ingress route resolves and
/// dispatches without knowing any app specifics.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, String), BoxedHandler>,
    default: Option<BoxedHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            default: None,
        }
    }

    fn boxed<F, Fut>(handler: F) -> BoxedHandler
    where
        F: Fn(SubmitRequest, Arc<Submitter>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Uuid, SubmitError>> + Send + 'static,
    {
        Box::new(move |request, submitter| Box::pin(handler(request, submitter)))
    }

    /// Register a handler for a specific `(app_name, task_type)`.
    pub fn register<F, Fut>(&mut self, app_name: &str, task_type: &str, handler: F)
    where
        F: Fn(SubmitRequest, Arc<Submitter>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Uuid, SubmitError>> + Send + 'static,
    {
        self.handlers.insert(
            (app_name.to_string(), task_type.to_string()),
            Self::boxed(handler),
        );
    }

    /// Register the fallback used when no specific handler matches.
    pub fn register_default<F, Fut>(&mut self, handler: F)
    where
        F: Fn(SubmitRequest, Arc<Submitter>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Uuid, SubmitError>> + Send + 'static,
    {
        self.default = Some(Self::boxed(handler));
    }

    pub fn is_registered(&self, app_name: &str, task_type: &str) -> bool {
        self.handlers
            .contains_key(&(app_name.to_string(), task_type.to_string()))
    }

    /// Resolve and run the handler for a submission.
    pub async fn dispatch(
        &self,
        request: SubmitRequest,
        submitter: Arc<Submitter>,
    ) -> Result<Uuid, DispatchError> {
        let key = (request.app_name.clone(), request.task_type.clone());

        let handler = self
            .handlers
            .get(&key)
            .or(self.default.as_ref())
            .ok_or_else(|| DispatchError::NotFound {
                app_name: key.0,
                task_type: key.1,
            })?;

        Ok(handler(request, submitter).await?)
    }
}
