// throttle.rs — Token bucket for control-plane writes.
//
// Every mutating store operation takes one token. The bucket holds at most
// `burst` tokens and refills at `per_second`. An empty bucket rejects the
// write with `StoreError::Throttled` and a retry hint; nothing is queued.
// The decision path never touches the bucket.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThrottleConfig {
    pub burst: u32,
    /// Tokens added per second. Zero or less disables throttling.
    pub per_second: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            burst: 20,
            per_second: 10.0,
        }
    }
}

impl ThrottleConfig {
    pub fn unlimited() -> Self {
        Self {
            burst: 0,
            per_second: 0.0,
        }
    }
}

struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

pub struct WriteThrottle {
    config: ThrottleConfig,
    bucket: Mutex<Bucket>,
}

impl WriteThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            bucket: Mutex::new(Bucket {
                tokens: f64::from(config.burst),
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Take one token or fail with a retry hint.
    pub fn acquire(&self) -> Result<(), StoreError> {
        if self.config.per_second <= 0.0 {
            return Ok(());
        }
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens =
            (bucket.tokens + elapsed * self.config.per_second).min(f64::from(self.config.burst));
        bucket.refilled_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let wait = (1.0 - bucket.tokens) / self.config.per_second;
            tracing::warn!(retry_after_secs = wait, "control-plane write throttled");
            Err(StoreError::Throttled {
                retry_after_ms: retry_after_ms(wait),
            })
        }
    }
}

/// Whole milliseconds, rounded up. Waits too long for a `Duration`
/// saturate at `u64::MAX`.
fn retry_after_ms(wait_secs: f64) -> u64 {
    Duration::try_from_secs_f64(wait_secs).map_or(u64::MAX, |wait| {
        u64::try_from(wait.as_micros().div_ceil(1000)).unwrap_or(u64::MAX)
    })
}
