//! Global bandwidth throttle shared by every connection
//!
//! A token bucket: tokens are bytes, the bucket holds at most one second worth
//! of the configured rate and refills continuously. Connections ask for a quota
//! before each socket read, so all accounts share one budget.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Smallest quota handed out while throttled; keeps reads from degenerating
/// into single-byte syscalls at low rates
pub const MIN_QUOTA: u64 = 1024;

#[derive(Debug)]
struct Bucket {
    // bytes per second, 0 = unlimited
    rate: AtomicU64,
    tokens: AtomicU64,
    // nanoseconds since `epoch()`
    stamp: AtomicU64,
}

/// Shared token bucket; clones refer to the same budget
#[derive(Clone, Debug)]
pub struct Throttle {
    bucket: Arc<Bucket>,
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Throttle {
    /// Create a throttle (None = unlimited)
    ///
    /// # Examples
    ///
    /// ```
    /// use usenet_engine::throttle::Throttle;
    ///
    /// let throttle = Throttle::new(Some(2 * 1024 * 1024));
    /// assert_eq!(throttle.limit(), Some(2 * 1024 * 1024));
    ///
    /// throttle.set_limit(None);
    /// assert!(throttle.limit().is_none());
    /// ```
    #[must_use]
    pub fn new(limit: Option<u64>) -> Self {
        let rate = limit.unwrap_or(0);
        Self {
            bucket: Arc::new(Bucket {
                rate: AtomicU64::new(rate),
                tokens: AtomicU64::new(rate),
                stamp: AtomicU64::new(now_nanos()),
            }),
        }
    }

    /// Change the rate; takes effect for the next quota request
    pub fn set_limit(&self, limit: Option<u64>) {
        let rate = limit.unwrap_or(0);
        let previous = self.bucket.rate.swap(rate, Ordering::SeqCst);
        if rate > previous {
            self.bucket.tokens.fetch_add(rate - previous, Ordering::SeqCst);
        } else {
            // never hold more than one second worth of the new rate
            self.bucket.tokens.fetch_min(rate, Ordering::SeqCst);
        }
    }

    /// Current rate (None = unlimited)
    pub fn limit(&self) -> Option<u64> {
        match self.bucket.rate.load(Ordering::Relaxed) {
            0 => None,
            rate => Some(rate),
        }
    }

    /// Whether a limit is active
    pub fn is_enabled(&self) -> bool {
        self.limit().is_some()
    }

    /// Take up to `wanted` bytes of quota without waiting
    ///
    /// Returns how many bytes may be transferred now; zero when the bucket is
    /// empty. Unlimited throttles always grant everything.
    pub fn give_quota(&self, wanted: u64) -> u64 {
        if wanted == 0 || !self.is_enabled() {
            return wanted;
        }
        self.refill();
        loop {
            let tokens = self.bucket.tokens.load(Ordering::SeqCst);
            let grant = wanted.min(tokens);
            if grant == 0 {
                return 0;
            }
            if self
                .bucket
                .tokens
                .compare_exchange(tokens, tokens - grant, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return grant;
            }
        }
    }

    /// Wait until at least part of `wanted` bytes may be transferred
    ///
    /// Returns the granted quota, which is at least one byte and at most
    /// `wanted`. The caller transfers that much and asks again.
    pub async fn acquire(&self, wanted: u64) -> u64 {
        loop {
            let grant = self.give_quota(wanted);
            if grant > 0 {
                return grant;
            }
            let rate = self.bucket.rate.load(Ordering::Relaxed).max(1);
            let needed = wanted.min(MIN_QUOTA);
            let wait_ms = needed.saturating_mul(1000) / rate;
            // re-check at least every 100ms so rate changes apply quickly
            tokio::time::sleep(Duration::from_millis(wait_ms.clamp(5, 100))).await;
        }
    }

    /// Wait until all of `bytes` have been granted
    pub async fn acquire_all(&self, bytes: u64) {
        let mut remaining = bytes;
        while remaining > 0 {
            remaining -= self.acquire(remaining).await;
        }
    }

    fn refill(&self) {
        let rate = self.bucket.rate.load(Ordering::Relaxed);
        if rate == 0 {
            return;
        }
        let now = now_nanos();
        let last = self.bucket.stamp.load(Ordering::SeqCst);
        let elapsed = now.saturating_sub(last);
        let earned = (u128::from(rate) * u128::from(elapsed) / 1_000_000_000) as u64;
        if earned == 0 {
            return;
        }
        if self
            .bucket
            .stamp
            .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = self
                .bucket
                .tokens
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
                    Some(t.saturating_add(earned).min(rate))
                });
        }
    }
}

fn now_nanos() -> u64 {
    static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}
