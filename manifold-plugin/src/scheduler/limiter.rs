//! Token-bucket rate limiting for handler calls.
//!
//! One bucket is shared across the read and write paths. Each
//! handler invocation takes one token; when the bucket is empty the
//! caller waits for a refill, but never past its deadline. Starved
//! callers skip their work for the tick rather than piling up.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

pub struct RateLimiter {
    /// Tokens added per second.
    rate: f64,

    /// Bucket capacity.
    capacity: f64,

    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    refilled: Instant,
}

impl RateLimiter {
    /// Creates a limiter adding `rate` tokens per second with a
    /// burst capacity of `burst` (zero falls back to the rate). The
    /// bucket starts full.
    pub fn new(rate: f64, burst: usize) -> RateLimiter {
        let capacity = if burst == 0 {
            rate.max(1.0)
        } else {
            burst as f64
        };

        RateLimiter {
            rate,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                refilled: Instant::now(),
            }),
        }
    }

    // Refills by elapsed time and tries to take one token. On
    // failure, returns how long until a token will be available.

    fn try_acquire(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let elapsed = now.duration_since(state.refilled).as_secs_f64();

        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.refilled = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64(
                (1.0 - state.tokens) / self.rate,
            ))
        }
    }

    /// Takes one token, waiting for a refill if necessary but never
    /// past `deadline`. Returns `false` when the deadline would be
    /// exceeded; the caller is expected to skip its work and log.
    pub async fn acquire(&self, deadline: Instant) -> bool {
        loop {
            match self.try_acquire() {
                Ok(()) => return true,
                Err(wait) => {
                    let now = Instant::now();

                    if now + wait > deadline {
                        return false;
                    }
                    tokio::time::sleep(wait).await
                }
            }
        }
    }
}
