//! Durable asynchronous job scheduler and execution dispatcher.
//!
//! Jobs arrive over the HTTP API, are persisted with their schedule and
//! payload, and at the right time an external worker endpoint is invoked
//! over HTTP to do the work. The kernel tracks per-attempt history,
//! enforces per-account rate limits, retries transient failures with
//! exponential backoff, supports cron and polling jobs, and streams live
//! status updates over SSE.

pub mod apps;
pub mod config;
pub mod kernel;
pub mod server;

pub use config::Config;
