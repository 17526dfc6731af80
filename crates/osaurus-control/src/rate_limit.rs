//! Token-bucket admission control
//!
//! One bucket per string key (client IP or agent address). Refill is
//! continuous at `capacity / window` tokens per millisecond on a monotone
//! clock, so wall-clock jumps never mint tokens. A maintenance task evicts
//! buckets untouched for longer than twice the window.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::trace;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A keyed token-bucket rate limiter.
pub struct RateLimiter {
    capacity: f64,
    window: Duration,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity: f64::from(capacity),
            window,
            buckets: DashMap::new(),
        }
    }

    /// Admit or refuse one event for `key`.
    ///
    /// A fresh key starts its bucket at `capacity − 1` and is admitted.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        match self.buckets.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(Bucket {
                    tokens: self.capacity - 1.0,
                    last_refill: now,
                });
                true
            }
            Entry::Occupied(mut slot) => {
                let bucket = slot.get_mut();
                let elapsed_ms =
                    now.saturating_duration_since(bucket.last_refill).as_millis() as f64;
                let rate = self.capacity / self.window.as_millis() as f64;
                bucket.tokens = (bucket.tokens + elapsed_ms * rate).min(self.capacity);
                bucket.last_refill = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    true
                } else {
                    trace!(key, "rate limited");
                    false
                }
            }
        }
    }

    /// Drop buckets untouched for longer than twice the refill window.
    pub fn evict_stale(&self) {
        let threshold = self.window * 2;
        self.buckets
            .retain(|_, bucket| bucket.last_refill.elapsed() < threshold);
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Periodic stale-bucket eviction. Runs until the handle is aborted.
    pub fn spawn_eviction_task(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.evict_stale();
            }
        })
    }
}
