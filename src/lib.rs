//! `floodgate` is an HTTP client library that wraps a transport with two
//! composable cross-cutting concerns: rate limiting and response caching.
//! Both are backed by the same pluggable storage (in-memory, an embedded
//! key-value server, or an embedded SQL store), so admission state and
//! cached responses live side by side and survive as long as the backend
//! does.
//!
//! Basic usage:
//!
//! ```no_run
//! use std::time::Duration;
//! use floodgate::{LimiterKind, Result, SessionBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let mut builder = SessionBuilder::default();
//!     builder
//!         .cache(true)
//!         .limiter(LimiterKind::TokenBucket {
//!             capacity: 5.0,
//!             fill_rate: 10.0,
//!         })
//!         .cache_timeout(Duration::from_secs(600));
//!     let session = builder.session().await?;
//!
//!     let response = session.get("https://example.com").await?;
//!     println!("{response}");
//!     session.close().await
//! }
//! ```
//!
//! Batches go through [`Session::requests`] (cooperative) or
//! [`Session::requests_blocking`] (a worker pool of OS threads); both
//! enforce the configured global, per-host, and per-endpoint limits,
//! consult the cache before touching the limiter or the network, and
//! return results in input order.
#![warn(clippy::all, clippy::pedantic)]
#![warn(missing_docs, missing_debug_implementations)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
mod cache;
mod callback;
mod clock;
mod fingerprint;
mod progress;
pub mod ratelimit;
mod session;
mod transport;
mod types;
mod useragents;

/// Helpers for testing sessions (a scriptable transport, a manual clock)
pub mod test_utils;

#[doc(inline)]
pub use crate::{
    backend::{Backend, BackendKind, KvConfig, ZsetAdmission},
    cache::ResponseCache,
    callback::{Callback, CallbackError, CallbackOutcome},
    clock::{Clock, SystemClock},
    fingerprint::{fingerprint, Fingerprint, Scope},
    progress::{NoProgress, ProgressSink},
    ratelimit::{Decision, Limiter, LimiterKind, RateLimiter},
    session::{Session, SessionBuilder},
    transport::{HttpTransport, Transport},
    types::{ErrorKind, Request, Response, Result},
};
