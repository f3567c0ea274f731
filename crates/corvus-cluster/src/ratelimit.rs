//! Token-bucket byte limiter for migration streams.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A byte-rate limiter. Callers request a number of bytes before sending;
/// the call tells them how long to sleep first. Requests larger than one
/// burst are split, so a single huge batch cannot starve the clock.
pub struct RateLimiter {
    inner: Mutex<Bucket>,
}

struct Bucket {
    bytes_per_sec: u64,
    /// At most one second's worth of credit accumulates.
    burst: u64,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        let bytes_per_sec = bytes_per_sec.max(1);
        Self {
            inner: Mutex::new(Bucket {
                bytes_per_sec,
                burst: bytes_per_sec,
                tokens: bytes_per_sec as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Changes the rate. A zero rate is ignored, matching the semantics of
    /// runtime `config set` on the migration rate.
    pub fn set_bytes_per_sec(&self, bytes_per_sec: u64) {
        if bytes_per_sec == 0 {
            return;
        }
        let mut bucket = self.inner.lock().unwrap();
        bucket.bytes_per_sec = bytes_per_sec;
        bucket.burst = bytes_per_sec;
        bucket.tokens = bucket.tokens.min(bytes_per_sec as f64);
    }

    /// Takes `bytes` of credit and returns how long the caller must wait
    /// before sending. Zero when the bucket covers the request.
    pub fn request(&self, bytes: u64) -> Duration {
        let mut bucket = self.inner.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.last_refill = now;
        bucket.tokens =
            (bucket.tokens + elapsed * bucket.bytes_per_sec as f64).min(bucket.burst as f64);

        bucket.tokens -= bytes as f64;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / bucket.bytes_per_sec as f64)
        }
    }

    /// Async convenience: request and sleep out the debt.
    pub async fn throttle(&self, bytes: u64) {
        let wait = self.request(bytes);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}
