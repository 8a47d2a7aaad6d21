use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{Backend, ZsetAdmission};
use crate::ratelimit::{wait_duration, Decision, Limiter};
use crate::types::Result;

/// Sliding-window log: one timestamped member per admission, pruned as the
/// window moves. Exact, at the cost of one stored member per admission.
#[derive(Debug)]
pub struct SlidingWindow {
    backend: Arc<dyn Backend>,
    limit: u64,
    window: f64,
    state_ttl: Duration,
    /// Disambiguates members created in the same clock instant
    sequence: AtomicU64,
}

impl SlidingWindow {
    /// Create a sliding window admitting `limit` requests per `window`
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, limit: u64, window: Duration, state_ttl: Duration) -> Self {
        SlidingWindow {
            backend,
            limit,
            window: window.as_secs_f64(),
            state_ttl,
            sequence: AtomicU64::new(0),
        }
    }

    fn retry_after(&self, oldest: f64, now: f64) -> Decision {
        Decision::Retry(wait_duration((oldest + self.window) - now))
    }
}

#[async_trait]
impl Limiter for SlidingWindow {
    async fn try_acquire(&self, key: &str, now: f64) -> Result<Decision> {
        let cutoff = now - self.window;
        let member = format!(
            "{now:.9}:{}",
            self.sequence.fetch_add(1, Ordering::Relaxed)
        );
        match self
            .backend
            .zprunecard_insert(key, cutoff, self.limit, now, &member, self.state_ttl)
            .await?
        {
            ZsetAdmission::Inserted => Ok(Decision::Admitted),
            ZsetAdmission::Full { oldest } => Ok(self.retry_after(oldest, now)),
        }
    }

    async fn check(&self, key: &str, now: f64) -> Result<Decision> {
        let cutoff = now - self.window;
        self.backend
            .zremrangebyscore(key, f64::NEG_INFINITY, cutoff)
            .await?;
        let count = self
            .backend
            .zcount(key, f64::NEG_INFINITY, f64::INFINITY)
            .await?;
        if count < self.limit {
            return Ok(Decision::Admitted);
        }
        let oldest = self.backend.zfirst(key).await?.unwrap_or(now);
        Ok(self.retry_after(oldest, now))
    }

    fn horizon(&self) -> Duration {
        Duration::from_secs_f64(self.window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::test_utils::ManualClock;
    use crate::clock::Clock;

    fn limiter(limit: u64, window: f64) -> (SlidingWindow, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000.0));
        let backend = Arc::new(MemoryBackend::new(Duration::ZERO, clock.clone()));
        (
            SlidingWindow::new(
                backend,
                limit,
                Duration::from_secs_f64(window),
                Duration::from_secs(60),
            ),
            clock,
        )
    }

    #[tokio::test]
    async fn test_admits_up_to_limit() {
        let (limiter, clock) = limiter(3, 1.0);
        let now = clock.now();
        for _ in 0..3 {
            assert_eq!(limiter.try_acquire("k", now).await.unwrap(), Decision::Admitted);
        }
        let Decision::Retry(wait) = limiter.try_acquire("k", now).await.unwrap() else {
            panic!("expected retry");
        };
        assert!((wait.as_secs_f64() - 1.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_window_slides() {
        let (limiter, clock) = limiter(2, 1.0);
        assert_eq!(
            limiter.try_acquire("k", clock.now()).await.unwrap(),
            Decision::Admitted
        );
        clock.advance(0.6);
        assert_eq!(
            limiter.try_acquire("k", clock.now()).await.unwrap(),
            Decision::Admitted
        );
        // first admission still in the window
        assert!(matches!(
            limiter.try_acquire("k", clock.now()).await.unwrap(),
            Decision::Retry(_)
        ));
        // ...but falls out once a full window has passed since it
        clock.advance(0.5);
        assert_eq!(
            limiter.try_acquire("k", clock.now()).await.unwrap(),
            Decision::Admitted
        );
    }

    #[tokio::test]
    async fn test_check_does_not_consume() {
        let (limiter, clock) = limiter(1, 10.0);
        let now = clock.now();
        assert_eq!(limiter.check("k", now).await.unwrap(), Decision::Admitted);
        assert_eq!(limiter.check("k", now).await.unwrap(), Decision::Admitted);
        assert_eq!(limiter.try_acquire("k", now).await.unwrap(), Decision::Admitted);
        assert!(matches!(
            limiter.check("k", now).await.unwrap(),
            Decision::Retry(_)
        ));
    }

    #[tokio::test]
    async fn test_keys_are_independent()  {
        let (limiter, clock) = limiter(1, 10.0);
        let now = clock.now();
        assert_eq!(limiter.try_acquire("a", now).await.unwrap(), Decision::Admitted);
        assert_eq!(limiter.try_acquire("b", now).await.unwrap(), Decision::Admitted);
    }
}
