//! Outbound HTTP client for worker callbacks.
//!
//! All work is delegated over HTTP: the engine POSTs a JSON body to the
//! job's `callback_url` and interprets the reply. Failures are classified as
//! transient (worth a retry slot) or permanent (finalizes the job).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// A 2xx reply from the worker.
#[derive(Debug, Clone)]
pub struct CallbackResponse {
    pub status: u16,
    /// Parsed JSON body; `None` when the worker returned no JSON. Polling
    /// jobs read `done` and `polling_state` from here.
    pub body: Option<Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    /// Connection, DNS or timeout failure; no response was received.
    #[error("worker request failed: {0}")]
    Transport(String),
    /// The worker answered with a non-2xx status.
    #[error("worker returned HTTP {status}")]
    Http { status: u16 },
}

impl CallbackError {
    /// Transient errors consume a retry slot; permanent ones finalize the
    /// job as failed. Transport failures and 5xx/408/429 are transient.
    pub fn is_transient(&self) -> bool {
        match self {
            CallbackError::Transport(_) => true,
            CallbackError::Http { status } => {
                *status >= 500 || *status == 408 || *status == 429
            }
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            CallbackError::Transport(_) => None,
            CallbackError::Http { status } => Some(*status),
        }
    }
}

#[async_trait]
pub trait CallbackClient: Send + Sync {
    async fn call(&self, url: &str, body: &Value) -> Result<CallbackResponse, CallbackError>;
}

/// Reqwest-backed client with the hard per-call timeout.
pub struct HttpCallbackClient {
    client: reqwest::Client,
}

impl HttpCallbackClient {
    pub fn new() -> Self {
        Self::with_timeout(CALLBACK_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client options are static");
        Self { client }
    }
}

impl Default for HttpCallbackClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CallbackClient for HttpCallbackClient {
    async fn call(&self, url: &str, body: &Value) -> Result<CallbackResponse, CallbackError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| CallbackError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CallbackError::Http {
                status: status.as_u16(),
            });
        }

        // Non-JSON bodies are tolerated; polling fields then take defaults.
        let body = response.json::<Value>().await.ok();

        Ok(CallbackResponse {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_transient() {
        let err = CallbackError::Transport("connection refused".into());
        assert!(err.is_transient());
        assert_eq!(err.status_code(), None);
    }

    #[test]
    fn server_errors_and_throttles_are_transient() {
        for status in [500, 502, 503, 504, 408, 429] {
            let err = CallbackError::Http { status };
            assert!(err.is_transient(), "{status} should be transient");
            assert_eq!(err.status_code(), Some(status));
        }
    }

    #[test]
    fn other_client_errors_are_permanent() {
        for status in [400, 401, 403, 404, 409, 422] {
            let err = CallbackError::Http { status };
            assert!(!err.is_transient(), "{status} should be permanent");
        }
    }
}
