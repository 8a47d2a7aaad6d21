//! Admission control.
//!
//! Five algorithms share one contract: `try_acquire(key, now)` either
//! admits the caller, asks it to retry after a wait, or rejects it
//! outright. All state lives in the session's [`Backend`], whose atomic
//! operations are the only synchronization the algorithms rely on.

mod fixed_window;
mod gcra;
mod leaky_bucket;
mod sliding_window;
mod token_bucket;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::Backend;
use crate::clock::Clock;
use crate::fingerprint::limiter_keys;
use crate::types::{ErrorKind, Request, Result};

pub use fixed_window::FixedWindow;
pub use gcra::Gcra;
pub use leaky_bucket::LeakyBucket;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

/// Waits below this floor are clamped to zero and re-attempted immediately
const MIN_RETRY_WAIT: Duration = Duration::from_millis(1);

/// How often a CAS-based algorithm retries on contention before giving up
/// for one polling interval
pub(crate) const MAX_CAS_ATTEMPTS: u32 = 8;

/// The outcome of an admission attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// The request may proceed
    Admitted,
    /// The request must wait before retrying
    Retry(Duration),
    /// The request was refused (`raise_errors` mode)
    Rejected,
}

/// A rate-limiting strategy over a single key.
///
/// `try_acquire` consumes capacity on admission; `check` estimates the
/// decision without consuming anything and is used for the later scopes
/// once an earlier scope already returned a retry.
#[async_trait]
pub trait Limiter: Send + Sync + fmt::Debug {
    /// Attempt to consume one unit of capacity for `key` at time `now`
    async fn try_acquire(&self, key: &str, now: f64) -> Result<Decision>;

    /// Estimate the decision for `key` at time `now` without consuming
    /// capacity
    async fn check(&self, key: &str, now: f64) -> Result<Decision>;

    /// The timescale after which idle state for a key can be discarded
    /// without affecting future admissions
    fn horizon(&self) -> Duration;
}

/// Algorithm selector with its parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LimiterKind {
    /// At most `limit` admissions in any window of the given length
    SlidingWindow {
        /// Maximum admissions per window
        limit: u64,
        /// Window length
        window: Duration,
    },
    /// At most `limit` admissions per aligned window
    FixedWindow {
        /// Maximum admissions per window
        limit: u64,
        /// Window length
        window: Duration,
    },
    /// A bucket that drains at `leak_rate` per second and rejects when full
    LeakyBucket {
        /// Bucket capacity
        capacity: f64,
        /// Drain rate, per second
        leak_rate: f64,
    },
    /// A bucket refilled at `fill_rate` tokens per second
    TokenBucket {
        /// Maximum tokens held
        capacity: f64,
        /// Refill rate, tokens per second
        fill_rate: f64,
    },
    /// Generic cell rate: emission interval `period`, burst `limit`
    Gcra {
        /// Emission interval
        period: Duration,
        /// Burst tolerance, in emissions
        limit: u64,
    },
}

impl LimiterKind {
    /// The selector name, matching the configuration surface
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            LimiterKind::SlidingWindow { .. } => "slidingwindow",
            LimiterKind::FixedWindow { .. } => "fixedwindow",
            LimiterKind::LeakyBucket { .. } => "leakybucket",
            LimiterKind::TokenBucket { .. } => "tokenbucket",
            LimiterKind::Gcra { .. } => "gcra",
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let problem = match *self {
            LimiterKind::SlidingWindow { limit, window }
            | LimiterKind::FixedWindow { limit, window } => {
                if limit == 0 {
                    Some("limit must be at least 1")
                } else if window.is_zero() {
                    Some("window must be positive")
                } else {
                    None
                }
            }
            LimiterKind::LeakyBucket {
                capacity,
                leak_rate,
            } => {
                if capacity < 1.0 {
                    Some("capacity must be at least 1")
                } else if leak_rate <= 0.0 || !leak_rate.is_finite() {
                    Some("leak_rate must be positive")
                } else {
                    None
                }
            }
            LimiterKind::TokenBucket {
                capacity,
                fill_rate,
            } => {
                if capacity < 1.0 {
                    Some("capacity must be at least 1")
                } else if fill_rate <= 0.0 || !fill_rate.is_finite() {
                    Some("fill_rate must be positive")
                } else {
                    None
                }
            }
            LimiterKind::Gcra { period, limit } => {
                if limit == 0 {
                    Some("limit must be at least 1")
                } else if period.is_zero() {
                    Some("period must be positive")
                } else {
                    None
                }
            }
        };
        match problem {
            Some(problem) => Err(ErrorKind::InvalidConfig(format!(
                "{}: {problem}",
                self.name()
            ))),
            None => Ok(()),
        }
    }

    /// The algorithm's natural horizon: the window for window algorithms,
    /// capacity over rate for buckets, the delay tolerance for GCRA
    #[must_use]
    pub fn horizon(&self) -> Duration {
        match *self {
            LimiterKind::SlidingWindow { window, .. }
            | LimiterKind::FixedWindow { window, .. } => window,
            LimiterKind::LeakyBucket {
                capacity,
                leak_rate,
            } => Duration::from_secs_f64(capacity / leak_rate),
            LimiterKind::TokenBucket {
                capacity,
                fill_rate,
            } => Duration::from_secs_f64(capacity / fill_rate),
            LimiterKind::Gcra { period, limit } => period.saturating_mul(u32::try_from(limit).unwrap_or(u32::MAX)),
        }
    }

    /// Build the strategy over `backend`. Idle state is kept for
    /// `max(horizon, cache_timeout)`; CAS algorithms surface
    /// `Retry(contention_wait)` after exhausting their attempts.
    pub(crate) fn build(
        self,
        backend: Arc<dyn Backend>,
        cache_timeout: Duration,
        contention_wait: Duration,
    ) -> Box<dyn Limiter> {
        let state_ttl = self.horizon().max(cache_timeout);
        match self {
            LimiterKind::SlidingWindow { limit, window } => {
                Box::new(SlidingWindow::new(backend, limit, window, state_ttl))
            }
            LimiterKind::FixedWindow { limit, window } => {
                Box::new(FixedWindow::new(backend, limit, window, state_ttl))
            }
            LimiterKind::LeakyBucket {
                capacity,
                leak_rate,
            } => Box::new(LeakyBucket::new(
                backend,
                capacity,
                leak_rate,
                state_ttl,
                contention_wait,
            )),
            LimiterKind::TokenBucket {
                capacity,
                fill_rate,
            } => Box::new(TokenBucket::new(
                backend,
                capacity,
                fill_rate,
                state_ttl,
                contention_wait,
            )),
            LimiterKind::Gcra { period, limit } => Box::new(Gcra::new(
                backend,
                period,
                limit,
                state_ttl,
                contention_wait,
            )),
        }
    }
}

/// The admission engine: one strategy applied across the configured
/// scopes (global, then per-host, then per-endpoint).
pub struct RateLimiter {
    limiter: Box<dyn Limiter>,
    clock: Arc<dyn Clock>,
    prefix: String,
    per_host: bool,
    per_endpoint: bool,
    raise_errors: bool,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limiter", &self.limiter)
            .field("prefix", &self.prefix)
            .field("per_host", &self.per_host)
            .field("per_endpoint", &self.per_endpoint)
            .field("raise_errors", &self.raise_errors)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub(crate) fn new(
        limiter: Box<dyn Limiter>,
        clock: Arc<dyn Clock>,
        prefix: String,
        per_host: bool,
        per_endpoint: bool,
        raise_errors: bool,
    ) -> Self {
        RateLimiter {
            limiter,
            clock,
            prefix,
            per_host,
            per_endpoint,
            raise_errors,
        }
    }

    /// Acquire all configured scope keys for `request`.
    ///
    /// Scopes are evaluated in a fixed order; after the first `Retry` the
    /// remaining scopes are only estimated (no capacity is consumed) and
    /// the maximum of the waits is returned. Under `raise_errors` a retry
    /// becomes [`Decision::Rejected`].
    ///
    /// # Errors
    ///
    /// Returns an error when a backend operation fails.
    pub async fn acquire(&self, request: &Request) -> Result<Decision> {
        let now = self.clock.now();
        let keys = limiter_keys(&self.prefix, request, self.per_host, self.per_endpoint);
        let mut max_wait: Option<Duration> = None;
        for (_, key) in &keys {
            let decision = if max_wait.is_none() {
                self.limiter.try_acquire(key, now).await?
            } else {
                self.limiter.check(key, now).await?
            };
            match decision {
                Decision::Admitted => {}
                Decision::Retry(wait) => {
                    if max_wait.map_or(true, |current| wait > current) {
                        max_wait = Some(wait);
                    }
                }
                Decision::Rejected => return Ok(Decision::Rejected),
            }
        }
        match max_wait {
            None => Ok(Decision::Admitted),
            Some(_) if self.raise_errors => Ok(Decision::Rejected),
            Some(wait) if wait < MIN_RETRY_WAIT => Ok(Decision::Retry(Duration::ZERO)),
            Some(wait) => Ok(Decision::Retry(wait)),
        }
    }

    /// Drop all limiter state under this engine's prefix
    ///
    /// # Errors
    ///
    /// Returns an error when the backend delete fails.
    pub async fn clear(&self, backend: &dyn Backend) -> Result<()> {
        backend.clear(&format!("{}:ratelimit:", self.prefix)).await
    }
}

/// Convert a wait in seconds to a `Duration`, clamping negatives to zero
pub(crate) fn wait_duration(seconds: f64) -> Duration {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::from_secs_f64(seconds)
    } else {
        Duration::ZERO
    }
}

/// Short backoff between CAS attempts so contended writers interleave
pub(crate) async fn cas_backoff(attempt: u32) {
    let micros = 50u64 << attempt.min(6);
    tokio::time::sleep(Duration::from_micros(micros)).await;
}

/// Encode bucket state (two floats) for byte-exact CAS comparison
pub(crate) fn encode_pair(a: f64, b: f64) -> Result<Vec<u8>> {
    bincode::serialize(&(a, b)).map_err(ErrorKind::Encode)
}

/// Decode bucket state; unreadable state is treated as absent
pub(crate) fn decode_pair(bytes: &[u8]) -> Option<(f64, f64)> {
    bincode::deserialize(bytes).ok()
}
