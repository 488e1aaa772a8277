//! Per-account fixed-window rate limiting.
//!
//! The counter lives outside the process (Redis) so every engine worker sees
//! the same window. The engine consults the limiter once per attempt, at the
//! top of execution; a denial is a status transition, not an error, and does
//! not consume a retry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

pub const WINDOW_SECONDS: u64 = 60;
pub const MAX_CALLS_PER_WINDOW: u64 = 90;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Seconds until the window frees up; meaningful only when denied.
    pub retry_after_seconds: u64,
}

impl RateDecision {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after_seconds: 0,
        }
    }

    pub fn denied(retry_after_seconds: u64) -> Self {
        Self {
            allowed: false,
            // A zero or negative TTL would requeue into the same full window.
            retry_after_seconds: retry_after_seconds.max(1),
        }
    }
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, account_id: &str) -> Result<RateDecision>;
}

/// Redis-backed fixed-window counter: INCR, set TTL on the first event of a
/// window, deny with the remaining TTL once the cap is exceeded.
pub struct RedisRateLimiter {
    conn: ConnectionManager,
    window_seconds: u64,
    max_calls: u64,
}

impl RedisRateLimiter {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            window_seconds: WINDOW_SECONDS,
            max_calls: MAX_CALLS_PER_WINDOW,
        }
    }

    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self::new(conn))
    }

    fn key(account_id: &str) -> String {
        format!("rate_limit:{account_id}")
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn check(&self, account_id: &str) -> Result<RateDecision> {
        let key = Self::key(account_id);
        let mut conn = self.conn.clone();

        let count: u64 = conn.incr(&key, 1u64).await?;
        if count == 1 {
            let _: bool = conn.expire(&key, self.window_seconds as i64).await?;
        }

        if count > self.max_calls {
            let ttl: i64 = conn.ttl(&key).await?;
            return Ok(RateDecision::denied(ttl.max(1) as u64));
        }

        Ok(RateDecision::allowed())
    }
}

/// In-process fixed-window counter with the same semantics.
///
/// Used in development when no Redis is configured, and by tests. Not
/// suitable for multi-worker deployments.
pub struct MemoryRateLimiter {
    windows: Mutex<HashMap<String, (u64, Instant)>>,
    window: Duration,
    max_calls: u64,
}

impl MemoryRateLimiter {
    pub fn new() -> Self {
        Self::with_limit(MAX_CALLS_PER_WINDOW)
    }

    /// Override the per-window cap (tests exercise the denial path with a
    /// small cap instead of issuing 91 calls).
    pub fn with_limit(max_calls: u64) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            window: Duration::from_secs(WINDOW_SECONDS),
            max_calls,
        }
    }
}

impl Default for MemoryRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn check(&self, account_id: &str) -> Result<RateDecision> {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());

        let entry = windows
            .entry(account_id.to_string())
            .or_insert((0, now));

        if now.duration_since(entry.1) >= self.window {
            *entry = (0, now);
        }

        entry.0 += 1;

        if entry.0 > self.max_calls {
            let remaining = self.window.saturating_sub(now.duration_since(entry.1));
            return Ok(RateDecision::denied(remaining.as_secs()));
        }

        Ok(RateDecision::allowed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_the_cap() {
        let limiter = MemoryRateLimiter::with_limit(3);

        for _ in 0..3 {
            assert!(limiter.check("acct-1").await.unwrap().allowed);
        }
    }

    #[tokio::test]
    async fn denies_past_the_cap_with_wait_hint() {
        let limiter = MemoryRateLimiter::with_limit(2);

        limiter.check("acct-1").await.unwrap();
        limiter.check("acct-1").await.unwrap();

        let decision = limiter.check("acct-1").await.unwrap();
        assert!(!decision.allowed);
        assert!(decision.retry_after_seconds >= 1);
        assert!(decision.retry_after_seconds <= WINDOW_SECONDS);
    }

    #[tokio::test]
    async fn accounts_are_counted_independently() {
        let limiter = MemoryRateLimiter::with_limit(1);

        assert!(limiter.check("acct-1").await.unwrap().allowed);
        assert!(!limiter.check("acct-1").await.unwrap().allowed);
        assert!(limiter.check("acct-2").await.unwrap().allowed);
    }

    #[test]
    fn denied_decision_clamps_wait_to_at_least_one_second() {
        assert_eq!(RateDecision::denied(0).retry_after_seconds, 1);
        assert_eq!(RateDecision::denied(42).retry_after_seconds, 42);
    }
}
