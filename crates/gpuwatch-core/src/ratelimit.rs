use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// Bucket key for requests that carry no caller identity.
pub const GLOBAL_BUCKET: &str = "global";

/// Buckets untouched for this long are dropped on the next prune.
const IDLE_EVICTION: Duration = Duration::from_secs(600);
const PRUNE_EVERY: u64 = 256;

#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    tokens: f64,
    updated: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Allowed,
    Rejected { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// Per-caller token buckets. A capacity of zero turns the limiter off.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: DashMap<String, TokenBucket>,
    checks: AtomicU64,
    rejected_total: AtomicU64,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_per_sec: refill_per_sec.max(0.0),
            buckets: DashMap::new(),
            checks: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.capacity > 0.0
    }

    pub fn rejected_total(&self) -> u64 {
        self.rejected_total.load(Ordering::Relaxed)
    }

    pub fn tracked_callers(&self) -> usize {
        self.buckets.len()
    }

    pub fn admit(&self, caller: Option<&str>) -> Admission {
        self.admit_at(caller, Instant::now())
    }

    /// Take one token from `caller`'s bucket as of `now`.
    pub fn admit_at(&self, caller: Option<&str>, now: Instant) -> Admission {
        if !self.enabled() {
            return Admission::Allowed;
        }
        let key = caller.filter(|c| !c.is_empty()).unwrap_or(GLOBAL_BUCKET);

        if self.checks.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.prune(now);
        }

        let admission = {
            let mut bucket = self.buckets.entry(key.to_string()).or_insert(TokenBucket {
                tokens: self.capacity,
                updated: now,
            });
            let elapsed = now.saturating_duration_since(bucket.updated).as_secs_f64();
            let tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            if tokens >= 1.0 {
                *bucket = TokenBucket {
                    tokens: tokens - 1.0,
                    updated: now,
                };
                Admission::Allowed
            } else {
                *bucket = TokenBucket {
                    tokens,
                    updated: now,
                };
                Admission::Rejected {
                    retry_after: self.time_to_next_token(tokens),
                }
            }
        };

        if let Admission::Rejected { retry_after } = admission {
            self.rejected_total.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(caller=%key, retry_after_ms=retry_after.as_millis() as u64, "rate limited");
        }
        admission
    }

    /// Drop buckets idle for longer than the eviction window.
    pub fn prune(&self, now: Instant) {
        self.buckets
            .retain(|_, b| now.saturating_duration_since(b.updated) < IDLE_EVICTION);
    }

    fn time_to_next_token(&self, tokens: f64) -> Duration {
        if self.refill_per_sec <= 0.0 {
            return IDLE_EVICTION;
        }
        let secs = ((1.0 - tokens) / self.refill_per_sec).max(0.0);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(IDLE_EVICTION)
            .max(Duration::from_millis(1))
    }
}
