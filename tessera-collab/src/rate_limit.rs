//! Per-connection sliding window rate limiter.
//!
//! Owned by the connection's reader task, so there is no shared state and no
//! locking. Two horizons are enforced together: a short burst window (one
//! second) and a sustained window (one minute).

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Message budgets for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimits {
    pub per_second: usize,
    pub per_minute: usize,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            per_second: 50,
            per_minute: 1200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("rate limit of {limit} messages per {window:?} exceeded, retry in {retry_after:?}")]
pub struct Throttled {
    pub retry_after: Duration,
    pub limit: usize,
    pub window: Duration,
}

impl Throttled {
    pub fn retry_after_ms(&self) -> u64 {
        (self.retry_after.as_millis() as u64).max(1)
    }
}

struct Window {
    span: Duration,
    limit: usize,
    hits: VecDeque<Instant>,
}

impl Window {
    fn new(span: Duration, limit: usize) -> Self {
        Self {
            span,
            limit,
            hits: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.hits.front() {
            if now.saturating_duration_since(oldest) >= self.span {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    fn check(&mut self, now: Instant) -> Result<(), Throttled> {
        self.prune(now);
        if self.hits.len() < self.limit {
            return Ok(());
        }
        let oldest = self.hits.front().copied().unwrap_or(now);
        Err(Throttled {
            retry_after: (oldest + self.span).saturating_duration_since(now),
            limit: self.limit,
            window: self.span,
        })
    }
}

pub struct RateLimiter {
    second: Window,
    minute: Window,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            second: Window::new(Duration::from_secs(1), limits.per_second),
            minute: Window::new(Duration::from_secs(60), limits.per_minute),
        }
    }

    /// Check and record one message at the current time.
    pub fn check_and_record(&mut self) -> Result<(), Throttled> {
        self.check_at(Instant::now())
    }

    /// Check and record one message at `now`. Rejected messages are not
    /// counted against either window.
    pub fn check_at(&mut self, now: Instant) -> Result<(), Throttled> {
        match (self.second.check(now), self.minute.check(now)) {
            (Ok(()), Ok(())) => {
                self.second.hits.push_back(now);
                self.minute.hits.push_back(now);
                Ok(())
            }
            (Err(a), Err(b)) => Err(if a.retry_after >= b.retry_after { a } else { b }),
            (Err(e), _) | (_, Err(e)) => Err(e),
        }
    }

    /// Messages currently counted in the one-second window.
    pub fn in_flight(&self) -> usize {
        self.second.hits.len()
    }
}
