use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use crate::backend::Backend;
use crate::ratelimit::{cas_backoff, wait_duration, Decision, Limiter, MAX_CAS_ATTEMPTS};
use crate::types::{ErrorKind, Result};

/// Generic cell rate algorithm: virtual scheduling with a single piece of
/// state, the theoretical arrival time. The emission interval is `period`;
/// the delay tolerance `period * limit` allows bursts of `limit`.
#[derive(Debug)]
pub struct Gcra {
    backend: Arc<dyn Backend>,
    period: f64,
    tolerance: f64,
    state_ttl: Duration,
    contention_wait: Duration,
}

impl Gcra {
    /// Create a GCRA limiter with the given emission interval and burst limit
    #[must_use]
    pub fn new(
        backend: Arc<dyn Backend>,
        period: Duration,
        limit: u64,
        state_ttl: Duration,
        contention_wait: Duration,
    ) -> Self {
        let period = period.as_secs_f64();
        #[allow(clippy::cast_precision_loss)]
        let tolerance = period * limit as f64;
        Gcra {
            backend,
            period,
            tolerance,
            state_ttl,
            contention_wait,
        }
    }

    fn decide(&self, tat: f64, now: f64) -> (f64, Decision) {
        let new_tat = tat.max(now) + self.period;
        if new_tat - now <= self.tolerance {
            (new_tat, Decision::Admitted)
        } else {
            (tat, Decision::Retry(wait_duration(new_tat - now - self.tolerance)))
        }
    }
}

fn decode_tat(bytes: &[u8]) -> Option<f64> {
    bincode::deserialize(bytes).ok()
}

fn encode_tat(tat: f64) -> Result<Vec<u8>> {
    bincode::serialize(&tat).map_err(ErrorKind::Encode)
}

#[async_trait]
impl Limiter for Gcra {
    async fn try_acquire(&self, key: &str, now: f64) -> Result<Decision> {
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let raw = self.backend.get(key).await?;
            let tat = raw.as_deref().and_then(decode_tat).unwrap_or(now);
            let (new_tat, decision) = self.decide(tat, now);
            if decision != Decision::Admitted {
                return Ok(decision);
            }
            let next = encode_tat(new_tat)?;
            if self
                .backend
                .cas(key, raw.as_deref(), &next, self.state_ttl)
                .await?
            {
                return Ok(Decision::Admitted);
            }
            cas_backoff(attempt).await;
        }
        debug!("gcra `{key}` contended for {MAX_CAS_ATTEMPTS} attempts");
        Ok(Decision::Retry(self.contention_wait))
    }

    async fn check(&self, key: &str, now: f64) -> Result<Decision> {
        let tat = self
            .backend
            .get(key)
            .await?
            .as_deref()
            .and_then(decode_tat)
            .unwrap_or(now);
        let (_, decision) = self.decide(tat, now);
        Ok(decision)
    }

    fn horizon(&self) -> Duration {
        Duration::from_secs_f64(self.tolerance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::test_utils::ManualClock;
    use crate::clock::Clock;

    fn limiter(period: f64, limit: u64) -> (Gcra, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000.0));
        let backend = Arc::new(MemoryBackend::new(Duration::ZERO, clock.clone()));
        (
            Gcra::new(
                backend,
                Duration::from_secs_f64(period),
                limit,
                Duration::from_secs(60),
                Duration::from_millis(250),
            ),
            clock,
        )
    }

    #[tokio::test]
    async fn test_burst_then_spacing() {
        let (limiter, clock) = limiter(2.0, 3);
        let now = clock.now();
        // burst of `limit`
        for _ in 0..3 {
            assert_eq!(limiter.try_acquire("k", now).await.unwrap(), Decision::Admitted);
        }
        // the fourth must wait one emission interval
        let Decision::Retry(wait) = limiter.try_acquire("k", now).await.unwrap() else {
            panic!("expected retry");
        };
        assert!((wait.as_secs_f64() - 2.0).abs() < 0.01);

        // after the interval exactly one more fits
        clock.advance(2.0);
        let now = clock.now();
        assert_eq!(limiter.try_acquire("k", now).await.unwrap(), Decision::Admitted);
        assert!(matches!(
            limiter.try_acquire("k", now).await.unwrap(),
            Decision::Retry(_)
        ));
    }

    #[tokio::test]
    async fn test_long_idle_resets_burst() {
        let (limiter, clock) = limiter(1.0, 2);
        let now = clock.now();
        assert_eq!(limiter.try_acquire("k", now).await.unwrap(), Decision::Admitted);
        assert_eq!(limiter.try_acquire("k", now).await.unwrap(), Decision::Admitted);
        clock.advance(60.0);
        let now = clock.now();
        assert_eq!(limiter.try_acquire("k", now).await.unwrap(), Decision::Admitted);
        assert_eq!(limiter.try_acquire("k", now).await.unwrap(), Decision::Admitted);
        assert!(matches!(
            limiter.try_acquire("k", now).await.unwrap(),
            Decision::Retry(_)
        ));
    }

    #[tokio::test]
    async fn test_check_does_not_advance_tat() {
        let (limiter, clock) = limiter(1.0, 1);
        let now = clock.now();
        assert_eq!(limiter.check("k", now).await.unwrap(), Decision::Admitted);
        assert_eq!(limiter.check("k", now).await.unwrap(), Decision::Admitted);
        assert_eq!(limiter.try_acquire("k", now).await.unwrap(), Decision::Admitted);
        assert!(matches!(
            limiter.check("k", now).await.unwrap(),
            Decision::Retry(_)
        ));
    }
}
