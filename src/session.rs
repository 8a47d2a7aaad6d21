use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use derive_builder::Builder;
use futures::stream::{self, StreamExt};
use http::{HeaderMap, Method};
use log::debug;
use url::Url;

use crate::backend::{Backend, BackendKind, KvBackend, MemoryBackend, SqlBackend};
use crate::cache::ResponseCache;
use crate::callback::{run_callbacks, Callback};
use crate::clock::{Clock, SystemClock};
use crate::progress::{NoProgress, ProgressSink};
use crate::ratelimit::{Decision, LimiterKind, RateLimiter};
use crate::transport::{HttpTransport, Transport};
use crate::types::{ErrorKind, Request, Response, Result};
use crate::useragents;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default TTL for cached responses and idle limiter state
const DEFAULT_CACHE_TIMEOUT: Duration = Duration::from_secs(3600);
/// Default polling granularity for admission waits
const DEFAULT_SLEEP_DURATION: Duration = Duration::from_millis(250);
/// Default number of requests in flight in cooperative mode
const DEFAULT_MAX_CONCURRENCY: usize = 128;
/// Default namespace prefix for all backend keys
const DEFAULT_KEY: &str = "session";

/// Configuration surface of a [`Session`].
///
/// This struct only exists to derive [`SessionBuilder`]; sessions are
/// assembled with [`SessionBuilder::session`].
#[derive(Debug, Builder)]
#[builder(name = "SessionBuilder")]
#[builder(build_fn(skip))]
#[builder(setter(into))]
pub struct SessionBuilderInternal {
    /// Persistence backend for cache and limiter state
    backend: BackendKind,
    /// Rate-limiting algorithm; `None` disables rate limiting
    limiter: Option<LimiterKind>,
    /// Whether responses are cached
    cache: bool,
    /// TTL for cache entries; also the floor for limiter state TTLs
    cache_timeout: Duration,
    /// Namespace prefix for all backend keys
    key: String,
    /// Additionally limit per host
    per_host: bool,
    /// Additionally limit per endpoint (request fingerprint)
    per_endpoint: bool,
    /// Polling granularity while waiting for admission
    sleep_duration: Duration,
    /// Surface a refused admission as an error instead of waiting
    raise_errors: bool,
    /// Collect callback return values onto each response
    return_callbacks: bool,
    /// Requests in flight at once in cooperative mode
    max_concurrency: usize,
    /// Worker threads in blocking-parallel mode
    workers: usize,
    /// Default timeout applied to every request
    timeout: Option<Duration>,
    /// User agent sent with every request
    user_agent: Option<String>,
    /// Pick a random browser user agent instead of the library default
    random_user_agents: bool,
    /// Headers sent with every request
    custom_headers: HeaderMap,
    /// Compress cached response payloads
    compression: bool,
    /// Replace the HTTP transport (used by tests)
    transport: Option<Arc<dyn Transport>>,
    /// Progress sink receiving batch updates
    progress: Option<Arc<dyn ProgressSink>>,
    /// Replace the clock (used by tests)
    clock: Option<Arc<dyn Clock>>,
}

impl SessionBuilder {
    /// Assemble the session: validate the configuration, connect the
    /// backend, and wire up cache, limiter, and transport.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidConfig`] for bad parameters and a
    /// backend error when the storage cannot be opened.
    pub async fn session(&self) -> Result<Session> {
        let clock: Arc<dyn Clock> = self
            .clock
            .clone()
            .flatten()
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let cache_timeout = self.cache_timeout.unwrap_or(DEFAULT_CACHE_TIMEOUT);
        let sleep_duration = self.sleep_duration.unwrap_or(DEFAULT_SLEEP_DURATION);
        if sleep_duration.is_zero() {
            return Err(ErrorKind::InvalidConfig(
                "sleep_duration must be positive".to_string(),
            ));
        }
        let key = self.key.clone().unwrap_or_else(|| DEFAULT_KEY.to_string());
        let raise_errors = self.raise_errors.unwrap_or(false);

        let backend: Arc<dyn Backend> = match self.backend.clone().unwrap_or_default() {
            BackendKind::Memory { check_frequency } => {
                Arc::new(MemoryBackend::new(check_frequency, clock.clone()))
            }
            BackendKind::Kv(config) => Arc::new(KvBackend::open(config).await?),
            BackendKind::Sql { db } => Arc::new(SqlBackend::open(db, clock.clone()).await?),
        };

        let cache = self.cache.unwrap_or(false).then(|| {
            ResponseCache::new(
                backend.clone(),
                key.clone(),
                cache_timeout,
                self.compression.unwrap_or(true),
            )
        });

        let limiter = match self.limiter.flatten() {
            Some(kind) => {
                kind.validate()?;
                debug!("rate limiting with {} under prefix `{key}`", kind.name());
                Some(RateLimiter::new(
                    kind.build(backend.clone(), cache_timeout, sleep_duration),
                    clock.clone(),
                    key.clone(),
                    self.per_host.unwrap_or(false),
                    self.per_endpoint.unwrap_or(true),
                    raise_errors,
                ))
            }
            None => None,
        };

        let timeout = self.timeout.flatten();
        let transport: Arc<dyn Transport> = match self.transport.clone().flatten() {
            Some(transport) => transport,
            None => {
                let user_agent = match self.user_agent.clone().flatten() {
                    Some(user_agent) => user_agent,
                    None if self.random_user_agents.unwrap_or(false) => {
                        useragents::random_user_agent().to_string()
                    }
                    None => format!("floodgate/{VERSION}"),
                };
                let custom_headers = self.custom_headers.clone().unwrap_or_default();
                Arc::new(HttpTransport::new(&user_agent, &custom_headers, timeout)?)
            }
        };

        let progress = self
            .progress
            .clone()
            .flatten()
            .unwrap_or_else(|| Arc::new(NoProgress) as Arc<dyn ProgressSink>);

        Ok(Session {
            transport,
            backend,
            cache,
            limiter,
            progress,
            sleep_duration,
            return_callbacks: self.return_callbacks.unwrap_or(false),
            max_concurrency: self.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY).max(1),
            workers: self.workers.unwrap_or_else(default_workers).max(1),
            default_timeout: timeout,
        })
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}

/// An HTTP session wrapping a transport with rate limiting and response
/// caching.
///
/// Per request the session runs, in order: cache lookup, admission,
/// transport, cache store, callbacks, progress. Batches run either
/// cooperatively on the async scheduler ([`Session::requests`]) or on a
/// pool of OS threads ([`Session::requests_blocking`]); both preserve
/// input order in the returned sequence.
#[derive(Debug)]
pub struct Session {
    transport: Arc<dyn Transport>,
    backend: Arc<dyn Backend>,
    cache: Option<ResponseCache>,
    limiter: Option<RateLimiter>,
    progress: Arc<dyn ProgressSink>,
    sleep_duration: Duration,
    return_callbacks: bool,
    max_concurrency: usize,
    workers: usize,
    default_timeout: Option<Duration>,
}

impl Session {
    /// Dispatch a single request through the full pipeline
    ///
    /// # Errors
    ///
    /// Propagates backend, transport, timeout, and (under `raise_errors`)
    /// rate-limit errors.
    pub async fn request(&self, request: Request, callbacks: &[Callback]) -> Result<Response> {
        self.dispatch(request, callbacks).await
    }

    /// Dispatch a batch cooperatively; the returned sequence matches the
    /// input order, each slot holding the response or the error of that
    /// request.
    pub async fn requests(
        &self,
        requests: Vec<Request>,
        callbacks: &[Callback],
    ) -> Vec<Result<Response>> {
        let total = requests.len();
        let completed = AtomicUsize::new(0);
        let mut results: Vec<(usize, Result<Response>)> = stream::iter(
            requests.into_iter().enumerate(),
        )
        .map(|(index, request)| {
            let completed = &completed;
            async move {
                let result = self.dispatch(request, callbacks).await;
                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                self.progress.tick(done, total);
                (index, result)
            }
        })
        .buffer_unordered(self.max_concurrency)
        .collect()
        .await;
        self.progress.close();
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }

    /// Dispatch a batch on a pool of OS threads.
    ///
    /// Semantics match [`Session::requests`]; the pool has `workers`
    /// threads, each driving the same per-request pipeline to completion.
    ///
    /// # Errors
    ///
    /// Returns an error when the internal runtime cannot be created.
    ///
    /// # Panics
    ///
    /// Must not be called from within an async runtime.
    pub fn requests_blocking(
        &self,
        requests: Vec<Request>,
        callbacks: &[Callback],
    ) -> Result<Vec<Result<Response>>> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()?;
        let total = requests.len();
        let completed = AtomicUsize::new(0);
        let results: Mutex<Vec<(usize, Result<Response>)>> = Mutex::new(Vec::with_capacity(total));
        let (sender, receiver) = async_channel::unbounded();
        for item in requests.into_iter().enumerate() {
            // an unbounded channel never rejects a send
            let _ = sender.send_blocking(item);
        }
        sender.close();

        std::thread::scope(|scope| {
            for _ in 0..self.workers {
                let receiver = receiver.clone();
                let runtime = &runtime;
                let completed = &completed;
                let results = &results;
                scope.spawn(move || {
                    while let Ok((index, request)) = receiver.recv_blocking() {
                        let result = runtime.block_on(self.dispatch(request, callbacks));
                        let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                        self.progress.tick(done, total);
                        results.lock().unwrap().push((index, result));
                    }
                });
            }
        });
        self.progress.close();

        let mut results = results.into_inner().unwrap();
        results.sort_by_key(|(index, _)| *index);
        Ok(results.into_iter().map(|(_, result)| result).collect())
    }

    /// Send a GET request
    ///
    /// # Errors
    ///
    /// See [`Session::request`].
    pub async fn get(&self, url: &str) -> Result<Response> {
        self.send_with_method(Method::GET, url, None).await
    }

    /// Send a HEAD request
    ///
    /// # Errors
    ///
    /// See [`Session::request`].
    pub async fn head(&self, url: &str) -> Result<Response> {
        self.send_with_method(Method::HEAD, url, None).await
    }

    /// Send an OPTIONS request
    ///
    /// # Errors
    ///
    /// See [`Session::request`].
    pub async fn options(&self, url: &str) -> Result<Response> {
        self.send_with_method(Method::OPTIONS, url, None).await
    }

    /// Send a DELETE request
    ///
    /// # Errors
    ///
    /// See [`Session::request`].
    pub async fn delete(&self, url: &str) -> Result<Response> {
        self.send_with_method(Method::DELETE, url, None).await
    }

    /// Send a POST request
    ///
    /// # Errors
    ///
    /// See [`Session::request`].
    pub async fn post(&self, url: &str, body: impl Into<Vec<u8>> + Send) -> Result<Response> {
        self.send_with_method(Method::POST, url, Some(body.into())).await
    }

    /// Send a PUT request
    ///
    /// # Errors
    ///
    /// See [`Session::request`].
    pub async fn put(&self, url: &str, body: impl Into<Vec<u8>> + Send) -> Result<Response> {
        self.send_with_method(Method::PUT, url, Some(body.into())).await
    }

    /// Send a PATCH request
    ///
    /// # Errors
    ///
    /// See [`Session::request`].
    pub async fn patch(&self, url: &str, body: impl Into<Vec<u8>> + Send) -> Result<Response> {
        self.send_with_method(Method::PATCH, url, Some(body.into())).await
    }

    async fn send_with_method(
        &self,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Response> {
        let url = Url::parse(url).map_err(|e| ErrorKind::ParseUrl(e, url.to_string()))?;
        let mut request = Request::new(method, url);
        request.body = body;
        self.request(request, &[]).await
    }

    /// Drop all cached responses and limiter state
    ///
    /// # Errors
    ///
    /// Returns an error when the backend delete fails.
    pub async fn clear_cache(&self) -> Result<()> {
        if let Some(cache) = &self.cache {
            cache.clear().await?;
        }
        if let Some(limiter) = &self.limiter {
            limiter.clear(self.backend.as_ref()).await?;
        }
        Ok(())
    }

    /// Close the session, releasing backend resources (sweepers, spawned
    /// servers, ephemeral files)
    ///
    /// # Errors
    ///
    /// Returns an error when the backend teardown fails.
    pub async fn close(self) -> Result<()> {
        self.backend.close().await
    }

    /// The per-request pipeline: cache, admission, transport, store,
    /// callbacks. Progress ticks are the batch dispatchers' concern.
    async fn dispatch(&self, request: Request, callbacks: &[Callback]) -> Result<Response> {
        let started = Instant::now();
        let timeout = request.timeout.or(self.default_timeout);

        if let Some(cache) = &self.cache {
            if let Some(mut hit) = cache.lookup(&request).await? {
                run_callbacks(&mut hit, callbacks, self.return_callbacks);
                return Ok(hit);
            }
        }

        if let Some(limiter) = &self.limiter {
            loop {
                match limiter.acquire(&request).await? {
                    Decision::Admitted => break,
                    Decision::Rejected => {
                        return Err(ErrorKind::RateLimited {
                            url: request.url.to_string(),
                            retry_after: self.sleep_duration,
                        });
                    }
                    Decision::Retry(wait) => {
                        let pause = if wait < self.sleep_duration * 2 {
                            wait
                        } else {
                            self.sleep_duration
                        };
                        if let Some(timeout) = timeout {
                            if started.elapsed() + pause >= timeout {
                                return Err(ErrorKind::Timeout);
                            }
                        }
                        if !pause.is_zero() {
                            tokio::time::sleep(pause).await;
                        }
                    }
                }
            }
        }

        let mut response = match timeout {
            Some(timeout) => {
                let remaining = timeout.saturating_sub(started.elapsed());
                tokio::time::timeout(remaining, self.transport.send(&request))
                    .await
                    .map_err(|_| ErrorKind::Timeout)??
            }
            None => self.transport.send(&request).await?,
        };

        if let Some(cache) = &self.cache {
            cache.store(&request, &response, None).await?;
        }

        run_callbacks(&mut response, callbacks, self.return_callbacks);
        Ok(response)
    }
}
