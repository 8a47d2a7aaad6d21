use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{parse_number, Backend};
use crate::ratelimit::{wait_duration, Decision, Limiter};
use crate::types::Result;

/// Fixed-window counter. Windows are aligned to multiples of the window
/// length, so consecutive windows are disjoint; the counter for a window
/// is keyed by its index and bumped with the backend's atomic `incr`.
#[derive(Debug)]
pub struct FixedWindow {
    backend: Arc<dyn Backend>,
    limit: u64,
    window: f64,
    state_ttl: Duration,
}

impl FixedWindow {
    /// Create a fixed window admitting `limit` requests per aligned `window`
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, limit: u64, window: Duration, state_ttl: Duration) -> Self {
        FixedWindow {
            backend,
            limit,
            window: window.as_secs_f64(),
            state_ttl,
        }
    }

    /// The window containing `now`: its counter key and start time
    fn bucket(&self, key: &str, now: f64) -> (String, f64) {
        let index = (now / self.window).floor();
        #[allow(clippy::cast_possible_truncation)]
        let counter_key = format!("{key}:{}", index as i64);
        (counter_key, index * self.window)
    }
}

#[async_trait]
impl Limiter for FixedWindow {
    async fn try_acquire(&self, key: &str, now: f64) -> Result<Decision> {
        let (counter_key, window_start) = self.bucket(key, now);
        let count = self
            .backend
            .incr(&counter_key, 1.0, self.state_ttl)
            .await?;
        #[allow(clippy::cast_precision_loss)]
        let limit = self.limit as f64;
        if count <= limit {
            Ok(Decision::Admitted)
        } else {
            Ok(Decision::Retry(wait_duration(
                (window_start + self.window) - now,
            )))
        }
    }

    async fn check(&self, key: &str, now: f64) -> Result<Decision> {
        let (counter_key, window_start) = self.bucket(key, now);
        let count = self
            .backend
            .get(&counter_key)
            .await?
            .map_or(0.0, |bytes| parse_number(&bytes));
        #[allow(clippy::cast_precision_loss)]
        let limit = self.limit as f64;
        if count < limit {
            Ok(Decision::Admitted)
        } else {
            Ok(Decision::Retry(wait_duration(
                (window_start + self.window) - now,
            )))
        }
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

    fn limiter(limit: u64, window: f64, start: f64) -> (FixedWindow, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        let backend = Arc::new(MemoryBackend::new(Duration::ZERO, clock.clone()));
        (
            FixedWindow::new(
                backend,
                limit,
                Duration::from_secs_f64(window),
                Duration::from_secs(60),
            ),
            clock,
        )
    }

    #[tokio::test]
    async fn test_windows_are_aligned_and_disjoint() {
        // now = 105 sits in the [100, 110) window
        let (limiter, clock) = limiter(2, 10.0, 105.0);
        assert_eq!(
            limiter.try_acquire("k", clock.now()).await.unwrap(),
            Decision::Admitted
        );
        assert_eq!(
            limiter.try_acquire("k", clock.now()).await.unwrap(),
            Decision::Admitted
        );
        let Decision::Retry(wait) = limiter.try_acquire("k", clock.now()).await.unwrap() else {
            panic!("expected retry");
        };
        // retry points at the start of the next aligned window
        assert!((wait.as_secs_f64() - 5.0).abs() < 0.01);

        clock.advance(5.0);
        assert_eq!(
            limiter.try_acquire("k", clock.now()).await.unwrap(),
            Decision::Admitted
        );
    }

    #[tokio::test]
    async fn test_denied_attempts_do_not_poison_the_next_window() {
        let (limiter, clock) = limiter(1, 10.0, 100.0);
        assert_eq!(
            limiter.try_acquire("k", clock.now()).await.unwrap(),
            Decision::Admitted
        );
        for _ in 0..5 {
            assert!(matches!(
                limiter.try_acquire("k", clock.now()).await.unwrap(),
                Decision::Retry(_)
            ));
        }
        clock.advance(10.0);
        assert_eq!(
            limiter.try_acquire("k", clock.now()).await.unwrap(),
            Decision::Admitted
        );
    }

    #[tokio::test]
    async fn test_check_does_not_consume() {
        let (limiter, clock) = limiter(1, 10.0, 100.0);
        let now = clock.now();
        assert_eq!(limiter.check("k", now).await.unwrap(), Decision::Admitted);
        assert_eq!(limiter.try_acquire("k", now).await.unwrap(), Decision::Admitted);
        assert!(matches!(
            limiter.check("k", now).await.unwrap(),
            Decision::Retry(_)
        ));
        let _ = clock;
    }
}
