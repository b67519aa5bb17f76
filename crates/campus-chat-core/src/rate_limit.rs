//! Fixed-window, per-identity rate limiting.
//!
//! Each identity gets a bucket `{window_start, count}`. Admission is a
//! single check-and-increment under one lock, so concurrent requests for
//! the same identity cannot both take the last slot. A bucket whose window
//! has elapsed is reset on the next attempt; there is no background sweep.
//!
//! Rejected attempts are counted. Within a window the counter keeps
//! growing past the ceiling, which records attempt volume without ever
//! admitting an extra request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::{PipelineError, PipelineResult};

/// Admission control keyed by caller identity.
pub trait RateLimiter: Send + Sync {
    /// Admit one request for `identity_key` or fail with
    /// [`PipelineError::RateLimited`].
    fn admit(&self, identity_key: &str) -> PipelineResult<()>;
}

/// Millisecond clock, injectable for tests.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

/// A clock that only moves when told to.
#[derive(Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn advance_ms(&self, delta: i64) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug)]
struct Bucket {
    window_start: i64,
    count: u32,
}

pub struct InMemoryRateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    window_ms: i64,
    max_requests: u32,
    clock: Arc<dyn Clock>,
}

impl InMemoryRateLimiter {
    pub fn new(window_secs: u64, max_requests: u32) -> Self {
        Self::with_clock(window_secs, max_requests, Arc::new(SystemClock))
    }

    pub fn with_clock(window_secs: u64, max_requests: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            window_ms: (window_secs.max(1) as i64) * 1000,
            max_requests,
            clock,
        }
    }

    /// Current attempt count in the live window for `identity_key`.
    pub fn count(&self, identity_key: &str) -> u32 {
        let now = self.clock.now_ms();
        let buckets = self.buckets.lock();
        match buckets.get(identity_key) {
            Some(b) if now - b.window_start < self.window_ms => b.count,
            _ => 0,
        }
    }

    /// Drop buckets whose window has elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, b| now - b.window_start < self.window_ms);
        before - buckets.len()
    }
}

impl RateLimiter for InMemoryRateLimiter {
    fn admit(&self, identity_key: &str) -> PipelineResult<()> {
        let now = self.clock.now_ms();
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(identity_key.to_string())
            .or_insert_with(|| Bucket {
                window_start: now,
                count: 0,
            });

        if now - bucket.window_start >= self.window_ms {
            bucket.window_start = now;
            bucket.count = 0;
        }

        bucket.count = bucket.count.saturating_add(1);

        if bucket.count > self.max_requests {
            let remaining_ms = (bucket.window_start + self.window_ms - now).max(0);
            let retry_after_secs = ((remaining_ms + 999) / 1000).max(1) as u64;
            return Err(PipelineError::RateLimited { retry_after_secs });
        }

        Ok(())
    }
}
