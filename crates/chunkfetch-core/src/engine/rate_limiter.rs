//! Token bucket speed limiter
//!
//! Gates range issuance for one download. The bucket holds a tenth of a
//! second of budget, capped at one slice, so the bytes admitted in any
//! one-second window stay within the limit plus that burst.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Largest amount taken from the bucket in one step
const MAX_SLICE: u64 = 16 * 1024;

/// The burst allowance is `limit / BURST_DIVISOR`
const BURST_DIVISOR: u64 = 10;

/// Longest single sleep while waiting for a refill, keeps `set_limit` responsive
const MAX_WAIT: Duration = Duration::from_millis(50);

/// Per-download rate limiter using a token bucket
#[derive(Clone)]
pub struct SpeedLimiter {
    state: Arc<Mutex<LimiterState>>,
}

struct LimiterState {
    /// Maximum tokens (bytes) in the bucket
    capacity: u64,
    /// Current available tokens
    tokens: f64,
    /// Last token refill time
    last_refill: Instant,
    /// Tokens added per second (the speed limit, 0 = unlimited)
    refill_rate: u64,
}

impl LimiterState {
    fn is_unlimited(&self) -> bool {
        self.refill_rate == 0
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            let new_tokens = elapsed * self.refill_rate as f64;
            self.tokens = (self.tokens + new_tokens).min(self.capacity as f64);
            self.last_refill = now;
        }
    }
}

/// Bucket size for a limit: never zero, never more than one slice
fn burst_for(bytes_per_second: u64) -> u64 {
    (bytes_per_second / BURST_DIVISOR).clamp(1, MAX_SLICE)
}

impl SpeedLimiter {
    /// Create a limiter admitting `bytes_per_second` (0 = unlimited)
    pub fn new(bytes_per_second: u64) -> Self {
        let capacity = if bytes_per_second == 0 { 0 } else { burst_for(bytes_per_second) };
        Self {
            state: Arc::new(Mutex::new(LimiterState {
                capacity,
                tokens: capacity as f64, // Start with full bucket
                last_refill: Instant::now(),
                refill_rate: bytes_per_second,
            })),
        }
    }

    /// Create a limiter that never waits
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Current limit in bytes per second (0 = unlimited)
    pub async fn limit(&self) -> u64 {
        self.state.lock().await.refill_rate
    }

    /// Update the speed limit of a live limiter
    pub async fn set_limit(&self, bytes_per_second: u64) {
        let mut state = self.state.lock().await;
        if bytes_per_second == 0 {
            state.capacity = 0;
            state.refill_rate = 0;
            state.tokens = 0.0;
            return;
        }

        let capacity = burst_for(bytes_per_second);
        if state.is_unlimited() {
            // Fresh budget when throttling starts
            state.tokens = capacity as f64;
        } else {
            state.refill();
            state.tokens = state.tokens.min(capacity as f64);
        }
        state.capacity = capacity;
        state.refill_rate = bytes_per_second;
        state.last_refill = Instant::now();
    }

    /// Wait until `bytes` tokens have been admitted.
    ///
    /// Budget is taken in slices so several ranges of one download share
    /// the bucket fairly. Dropping the future stops waiting.
    pub async fn acquire(&self, bytes: u64) {
        let mut remaining = bytes;

        while remaining > 0 {
            let wait_time = {
                let mut state = self.state.lock().await;

                if state.is_unlimited() {
                    return;
                }

                state.refill();

                let slice = remaining.min(MAX_SLICE).min(state.capacity);
                if state.tokens >= slice as f64 {
                    state.tokens -= slice as f64;
                    remaining -= slice;
                    continue;
                }

                let needed = slice as f64 - state.tokens;
                let wait_secs = needed / state.refill_rate as f64;
                Duration::from_secs_f64(wait_secs).min(MAX_WAIT)
            };

            // Wait outside the lock so other ranges can also check
            tokio::time::sleep(wait_time.max(Duration::from_millis(1))).await;
        }
    }

    /// Take `bytes` tokens if available right now. Requests larger than
    /// the burst allowance never succeed here; use [`acquire`](Self::acquire).
    pub async fn try_acquire(&self, bytes: u64) -> bool {
        let mut state = self.state.lock().await;

        if state.is_unlimited() {
            return true;
        }

        state.refill();

        if state.tokens >= bytes as f64 {
            state.tokens -= bytes as f64;
            true
        } else {
            false
        }
    }
}
