//! Token-bucket rate limiting

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Allows bursts up to one second's worth of requests, then `rate` per
/// second. Shared by every job that calls the same engine.
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    capacity: f64,
    refill_rate: f64,
}

impl RateLimiter {
    pub fn new(requests_per_second: u32) -> Self {
        let rate = f64::from(requests_per_second.max(1));
        Self {
            bucket: Mutex::new(Bucket {
                tokens: rate,
                last_refill: Instant::now(),
            }),
            capacity: rate,
            refill_rate: rate,
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.capacity);
        bucket.last_refill = now;
    }

    /// Wait for one token.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.refill_rate)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Take a token if one is available right now.
    pub async fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
