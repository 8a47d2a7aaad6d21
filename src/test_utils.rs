//! Helpers for testing sessions: a scriptable transport and a manually
//! advanced clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, HeaderValue, StatusCode};

use crate::clock::Clock;
use crate::transport::Transport;
use crate::types::{Request, Response, Result};

/// A transport that answers every request with a fixed response and
/// counts how often it was hit
#[derive(Debug)]
pub struct MockTransport {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
    delay: Option<Duration>,
    hits: AtomicUsize,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}

impl MockTransport {
    /// A transport answering with `status` and an empty body
    #[must_use]
    pub fn new(status: StatusCode) -> Self {
        MockTransport {
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
            delay: None,
            hits: AtomicUsize::new(0),
        }
    }

    /// Set the response body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Add a response header
    ///
    /// # Panics
    ///
    /// Panics when the header value is invalid; this is test code.
    #[must_use]
    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        self.headers
            .insert(name, HeaderValue::from_str(value).unwrap());
        self
    }

    /// Delay every response, simulating a slow server
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// How many requests reached the transport
    #[must_use]
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &Request) -> Result<Response> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(Response::new(
            request.method.clone(),
            request.url.clone(),
            self.status,
            self.headers.clone(),
            self.body.clone(),
        ))
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    seconds: Mutex<f64>,
}

impl ManualClock {
    /// Create a clock stopped at `start` seconds
    #[must_use]
    pub fn new(start: f64) -> Self {
        ManualClock {
            seconds: Mutex::new(start),
        }
    }

    /// Advance the clock by `seconds`
    ///
    /// # Panics
    ///
    /// Panics when the internal mutex is poisoned; this is test code.
    pub fn advance(&self, seconds: f64) {
        *self.seconds.lock().unwrap() += seconds;
    }

    /// Jump the clock to an absolute time
    ///
    /// # Panics
    ///
    /// Panics when the internal mutex is poisoned; this is test code.
    pub fn set(&self, seconds: f64) {
        *self.seconds.lock().unwrap() = seconds;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.seconds.lock().unwrap()
    }
}
