use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Duration, Instant};

use crate::registry::source_loader::RateLimitsSpec;

/// Token-bucket throttle for outbound page requests.
///
/// `acquire` suspends until one request token is available and, when a
/// concurrency cap is configured, a slot is free. No token is consumed
/// before the permit is granted, so a caller that drops a pending
/// `acquire` future (run cancellation) has taken nothing. The returned
/// permit holds the concurrency slot until the request finishes.
///
/// All waiting goes through `tokio::time`, so tests drive the limiter with
/// a paused clock.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Option<Mutex<TokenBucket>>,
    slots: Option<Arc<Semaphore>>,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RatePermit {
    _slot: Option<OwnedSemaphorePermit>,
}

impl RateLimiter {
    pub fn new(limits: &RateLimitsSpec) -> Self {
        let bucket = limits.requests_per_min.map(|rpm| {
            let rpm = rpm.max(1);
            let capacity = f64::from(limits.burst.unwrap_or(rpm).max(1));
            Mutex::new(TokenBucket {
                tokens: capacity,
                capacity,
                refill_per_sec: f64::from(rpm) / 60.0,
                last_refill: Instant::now(),
            })
        });
        let slots = limits
            .concurrency
            .map(|c| Arc::new(Semaphore::new(c.max(1) as usize)));
        Self { bucket, slots }
    }

    /// Unlimited passthrough (tests, unconfigured sources).
    pub fn unlimited() -> Self {
        Self::new(&RateLimitsSpec::default())
    }

    pub async fn acquire(&self) -> RatePermit {
        let slot = match &self.slots {
            Some(sem) => Some(sem.clone().acquire_owned().await.expect("semaphore closed")),
            None => None,
        };

        if let Some(bucket) = &self.bucket {
            loop {
                let wait = {
                    let mut b = bucket.lock().await;
                    let now = Instant::now();
                    let elapsed = now.duration_since(b.last_refill).as_secs_f64();
                    b.tokens = (b.tokens + elapsed * b.refill_per_sec).min(b.capacity);
                    b.last_refill = now;
                    if b.tokens >= 1.0 {
                        b.tokens -= 1.0;
                        None
                    } else {
                        let need = 1.0 - b.tokens;
                        Some(Duration::from_secs_f64((need / b.refill_per_sec).max(0.001)))
                    }
                };
                match wait {
                    None => break,
                    Some(delay) => tokio::time::sleep(delay).await,
                }
            }
        }

        RatePermit { _slot: slot }
    }
}
