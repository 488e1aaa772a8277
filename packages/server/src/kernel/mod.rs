// Kernel: infrastructure shared by the HTTP surface and background services

pub mod callback;
pub mod cron;
pub mod deps;
pub mod jobs;
pub mod rate_limit;
pub mod status_hub;

pub use callback::{CallbackClient, CallbackError, CallbackResponse, HttpCallbackClient};
pub use deps::ServerDeps;
pub use rate_limit::{
    MemoryRateLimiter, RateDecision, RateLimiter, RedisRateLimiter, MAX_CALLS_PER_WINDOW,
    WINDOW_SECONDS,
};
pub use status_hub::StatusHub;
