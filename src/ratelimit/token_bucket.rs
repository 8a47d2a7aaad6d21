use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use crate::backend::Backend;
use crate::ratelimit::{
    cas_backoff, decode_pair, encode_pair, wait_duration, Decision, Limiter, MAX_CAS_ATTEMPTS,
};
use crate::types::Result;

/// Token bucket: starts full, refills at `fill_rate` tokens per second up
/// to `capacity`, each admission spends one token. State is
/// `(tokens, last_fill_ts)` updated under CAS.
#[derive(Debug)]
pub struct TokenBucket {
    backend: Arc<dyn Backend>,
    capacity: f64,
    fill_rate: f64,
    state_ttl: Duration,
    contention_wait: Duration,
}

impl TokenBucket {
    /// Create a token bucket with the given capacity and refill rate
    #[must_use]
    pub fn new(
        backend: Arc<dyn Backend>,
        capacity: f64,
        fill_rate: f64,
        state_ttl: Duration,
        contention_wait: Duration,
    ) -> Self {
        TokenBucket {
            backend,
            capacity,
            fill_rate,
            state_ttl,
            contention_wait,
        }
    }

    fn refilled(&self, tokens: f64, last: f64, now: f64) -> f64 {
        (tokens + (now - last).max(0.0) * self.fill_rate).min(self.capacity)
    }
}

#[async_trait]
impl Limiter for TokenBucket {
    async fn try_acquire(&self, key: &str, now: f64) -> Result<Decision> {
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let raw = self.backend.get(key).await?;
            let (tokens, last) = raw
                .as_deref()
                .and_then(decode_pair)
                .unwrap_or((self.capacity, now));
            let tokens = self.refilled(tokens, last, now);
            if tokens < 1.0 {
                return Ok(Decision::Retry(wait_duration(
                    (1.0 - tokens) / self.fill_rate,
                )));
            }
            let next = encode_pair(tokens - 1.0, now)?;
            if self
                .backend
                .cas(key, raw.as_deref(), &next, self.state_ttl)
                .await?
            {
                return Ok(Decision::Admitted);
            }
            cas_backoff(attempt).await;
        }
        debug!("token bucket `{key}` contended for {MAX_CAS_ATTEMPTS} attempts");
        Ok(Decision::Retry(self.contention_wait))
    }

    async fn check(&self, key: &str, now: f64) -> Result<Decision> {
        let (tokens, last) = self
            .backend
            .get(key)
            .await?
            .as_deref()
            .and_then(decode_pair)
            .unwrap_or((self.capacity, now));
        let tokens = self.refilled(tokens, last, now);
        if tokens >= 1.0 {
            Ok(Decision::Admitted)
        } else {
            Ok(Decision::Retry(wait_duration(
                (1.0 - tokens) / self.fill_rate,
            )))
        }
    }

    fn horizon(&self) -> Duration {
        Duration::from_secs_f64(self.capacity / self.fill_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::test_utils::ManualClock;
    use crate::clock::Clock;

    fn limiter(capacity: f64, fill_rate: f64) -> (TokenBucket, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000.0));
        let backend = Arc::new(MemoryBackend::new(Duration::ZERO, clock.clone()));
        (
            TokenBucket::new(
                backend,
                capacity,
                fill_rate,
                Duration::from_secs(60),
                Duration::from_millis(250),
            ),
            clock,
        )
    }

    #[tokio::test]
    async fn test_bucket_starts_full() {
        let (limiter, clock) = limiter(5.0, 10.0);
        let now = clock.now();
        for _ in 0..5 {
            assert_eq!(limiter.try_acquire("k", now).await.unwrap(), Decision::Admitted);
        }
        let Decision::Retry(wait) = limiter.try_acquire("k", now).await.unwrap() else {
            panic!("expected retry");
        };
        // one token refills in 1/fill_rate seconds
        assert!((wait.as_secs_f64() - 0.1).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_refill_is_capped_at_capacity() {
        let (limiter, clock) = limiter(2.0, 100.0);
        let now = clock.now();
        assert_eq!(limiter.try_acquire("k", now).await.unwrap(), Decision::Admitted);
        assert_eq!(limiter.try_acquire("k", now).await.unwrap(), Decision::Admitted);
        // a long idle period refills to capacity, not beyond
        clock.advance(1_000.0);
        let now = clock.now();
        assert_eq!(limiter.try_acquire("k", now).await.unwrap(), Decision::Admitted);
        assert_eq!(limiter.try_acquire("k", now).await.unwrap(), Decision::Admitted);
        assert!(matches!(
            limiter.try_acquire("k", now).await.unwrap(),
            Decision::Retry(_)
        ));
    }

    #[tokio::test]
    async fn test_steady_rate_after_burst() {
        let (limiter, clock) = limiter(1.0, 2.0);
        assert_eq!(
            limiter.try_acquire("k", clock.now()).await.unwrap(),
            Decision::Admitted
        );
        assert!(matches!(
            limiter.try_acquire("k", clock.now()).await.unwrap(),
            Decision::Retry(_)
        ));
        clock.advance(0.5);
        assert_eq!(
            limiter.try_acquire("k", clock.now()).await.unwrap(),
            Decision::Admitted
        );
    }
}
