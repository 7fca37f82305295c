//! Issuance rate limiting
//!
//! The limiter is a precondition hook on magic-link issuance. Counters are
//! ephemeral: losing them on restart only resets the windows.
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::Error;
use crate::config::RateLimitConfig;

#[async_trait]
pub trait RateLimiter: Send + Sync + 'static {
    /// Record one request against `key`, failing with [`Error::RateLimited`]
    /// once the key is over its allowance.
    async fn check(&self, key: &str) -> Result<(), Error>;

    /// Forget counters whose window has elapsed. Returns how many were dropped.
    async fn purge_expired(&self, _now: DateTime<Utc>) -> usize {
        0
    }
}

pub fn email_key(email: &str) -> String {
    format!("magic:email:{email}")
}

pub fn ip_key(ip: &str) -> String {
    format!("magic:ip:{ip}")
}

/// Allows every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRateLimit;

#[async_trait]
impl RateLimiter for NoRateLimit {
    async fn check(&self, _key: &str) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: DateTime<Utc>,
    count: u32,
}

/// Checks between automatic purges of elapsed windows
const PURGE_INTERVAL: u64 = 1024;

/// Fixed-window counter per key.
///
/// Elapsed windows are dropped every [`PURGE_INTERVAL`] checks and on
/// [`RateLimiter::purge_expired`], so one-off keys do not accumulate.
#[derive(Debug)]
pub struct FixedWindowRateLimiter {
    max_requests: u32,
    window: Duration,
    windows: DashMap<String, Window>,
    checks: AtomicU64,
}

impl FixedWindowRateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: DashMap::new(),
            checks: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_requests, config.window)
    }

    pub fn check_at(&self, key: &str, now: DateTime<Utc>) -> Result<(), Error> {
        // Must run before the entry guard below is taken.
        if (self.checks.fetch_add(1, Ordering::Relaxed) + 1) % PURGE_INTERVAL == 0 {
            let purged = self.purge_expired_at(now);
            tracing::debug!(purged, "Purged elapsed rate limit windows");
        }

        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });

        if now - entry.started_at >= self.window {
            *entry = Window {
                started_at: now,
                count: 0,
            };
        }

        if entry.count >= self.max_requests {
            return Err(Error::RateLimited(key.to_string()));
        }

        entry.count += 1;
        Ok(())
    }

    /// Drop windows that have fully elapsed.
    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, window| now - window.started_at < self.window);
        before.saturating_sub(self.windows.len())
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[async_trait]
impl RateLimiter for FixedWindowRateLimiter {
    async fn check(&self, key: &str) -> Result<(), Error> {
        self.check_at(key, Utc::now())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        self.purge_expired_at(now)
    }
}
