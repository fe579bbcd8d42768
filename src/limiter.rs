//! Per-source outbound rate limiting.
//!
//! Continuous token bucket: each source gets `quota` tokens per rolling
//! 60-second window, replenished fractionally rather than in bursts, so
//! a waiting caller always has a bounded wake-up time and can never
//! deadlock behind a window boundary.
//!
//! Fairness: callers queue on the per-source async mutex and hold it
//! across their wait, so tokens are granted in lock-acquisition order
//! (FIFO up to the tokio mutex waiter-queue wake order).

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// External source identifier. Each source has an independent quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceId {
    Marketplace,
    Auction,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(per_minute: u32) -> Self {
        let capacity = per_minute.max(1) as f64;
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Time until one full token is available, assuming no refill since
    /// the last `refill` call.
    fn time_to_token(&self) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec)
    }
}

/// Blocks callers until a token is available under the per-source quota.
pub struct RateLimiter {
    marketplace: Mutex<Bucket>,
    auction: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(marketplace_per_minute: u32, auction_per_minute: u32) -> Self {
        Self {
            marketplace: Mutex::new(Bucket::new(marketplace_per_minute)),
            auction: Mutex::new(Bucket::new(auction_per_minute)),
        }
    }

    /// Wait for and consume one token for `source`.
    ///
    /// The bucket lock is held across the wait so queued callers are
    /// served in order; the wait itself is a plain timer, computed from
    /// the continuous refill rate.
    pub async fn acquire(&self, source: SourceId) {
        let bucket = match source {
            SourceId::Marketplace => &self.marketplace,
            SourceId::Auction => &self.auction,
        };

        let mut guard = bucket.lock().await;
        loop {
            guard.refill(Instant::now());
            if guard.tokens >= 1.0 {
                guard.tokens -= 1.0;
                trace!(?source, remaining = guard.tokens, "rate token granted");
                return;
            }
            let wait = guard.time_to_token();
            trace!(?source, wait_ms = wait.as_millis() as u64, "rate limited, waiting");
            tokio::time::sleep(wait).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
