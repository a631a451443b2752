//! Token-bucket rate limiter, one bucket per data source.
//!
//! Callers block (up to an acquisition timeout) until a token is available
//! rather than failing immediately. The bucket is an explicitly constructed,
//! injectable service — tests get a fresh instance each time.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::catalog::RatePolicy;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket: refills at `qps` tokens/sec up to `burst`.
#[derive(Debug)]
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(policy: RatePolicy) -> Self {
        // A bucket starts full so the first burst goes through unthrottled.
        Self {
            qps: policy.qps.max(0.001),
            burst: policy.burst.max(1.0),
            state: Mutex::new(BucketState {
                tokens: policy.burst.max(1.0),
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.qps).min(self.burst);
        state.last_refill = Instant::now();
    }

    /// Take one token if available right now.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Block until a token is available or `timeout` expires.
    ///
    /// Returns false only on timeout. Waiting happens outside the lock so
    /// concurrent acquirers make independent progress.
    pub fn acquire(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap();
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return true;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.qps)
            };

            let now = Instant::now();
            if now + wait > deadline {
                return false;
            }
            std::thread::sleep(wait);
        }
    }
}
