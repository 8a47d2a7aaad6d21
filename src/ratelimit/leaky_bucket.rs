use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use crate::backend::Backend;
use crate::ratelimit::{
    cas_backoff, decode_pair, encode_pair, wait_duration, Decision, Limiter, MAX_CAS_ATTEMPTS,
};
use crate::types::Result;

/// Leaky bucket: each admission adds one unit of water, the bucket drains
/// at `leak_rate` per second, and a full bucket means waiting for enough
/// water to leak out. State is `(level, last_leak_ts)` updated under CAS.
#[derive(Debug)]
pub struct LeakyBucket {
    backend: Arc<dyn Backend>,
    capacity: f64,
    leak_rate: f64,
    state_ttl: Duration,
    contention_wait: Duration,
}

impl LeakyBucket {
    /// Create a leaky bucket with the given capacity and drain rate
    #[must_use]
    pub fn new(
        backend: Arc<dyn Backend>,
        capacity: f64,
        leak_rate: f64,
        state_ttl: Duration,
        contention_wait: Duration,
    ) -> Self {
        LeakyBucket {
            backend,
            capacity,
            leak_rate,
            state_ttl,
            contention_wait,
        }
    }

    /// Apply the leak since `last` to `level`
    fn drained(&self, level: f64, last: f64, now: f64) -> f64 {
        (level - (now - last).max(0.0) * self.leak_rate).max(0.0)
    }
}

#[async_trait]
impl Limiter for LeakyBucket {
    async fn try_acquire(&self, key: &str, now: f64) -> Result<Decision> {
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let raw = self.backend.get(key).await?;
            let (level, last) = raw
                .as_deref()
                .and_then(decode_pair)
                .unwrap_or((0.0, now));
            let level = self.drained(level, last, now);
            if level + 1.0 > self.capacity {
                return Ok(Decision::Retry(wait_duration(
                    (level + 1.0 - self.capacity) / self.leak_rate,
                )));
            }
            let next = encode_pair(level + 1.0, now)?;
            if self
                .backend
                .cas(key, raw.as_deref(), &next, self.state_ttl)
                .await?
            {
                return Ok(Decision::Admitted);
            }
            cas_backoff(attempt).await;
        }
        debug!("leaky bucket `{key}` contended for {MAX_CAS_ATTEMPTS} attempts");
        Ok(Decision::Retry(self.contention_wait))
    }

    async fn check(&self, key: &str, now: f64) -> Result<Decision> {
        let (level, last) = self
            .backend
            .get(key)
            .await?
            .as_deref()
            .and_then(decode_pair)
            .unwrap_or((0.0, now));
        let level = self.drained(level, last, now);
        if level + 1.0 <= self.capacity {
            Ok(Decision::Admitted)
        } else {
            Ok(Decision::Retry(wait_duration(
                (level + 1.0 - self.capacity) / self.leak_rate,
            )))
        }
    }

    fn horizon(&self) -> Duration {
        Duration::from_secs_f64(self.capacity / self.leak_rate)
    }
}
