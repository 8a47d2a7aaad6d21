use std::convert::TryFrom;
use std::fmt::Display;
use std::time::Duration;

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use url::Url;

use crate::types::{ErrorKind, Result};

/// A request ready for dispatch.
///
/// Requests are immutable once handed to the session: the dispatch loop
/// derives the cache and limiter keys from the fields below, so mutating a
/// request mid-flight would desynchronize them.
#[derive(Debug, Clone)]
pub struct Request {
    /// The HTTP method
    pub method: Method,
    /// The URL to request
    pub url: Url,
    /// Extra headers, merged over the session defaults
    pub headers: HeaderMap,
    /// Optional request body
    pub body: Option<Vec<u8>>,
    /// Per-request timeout, bounding transport I/O and admission waits
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a new request with no headers, body, or timeout
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Request {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// Convenience constructor for a GET request
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Attach a header
    ///
    /// # Errors
    ///
    /// Returns an error if the name or value is not a valid header
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = name.parse::<HeaderName>()?;
        let value = HeaderValue::from_str(value)?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Attach a body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Bound the request with a timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The request host, if the URL has one
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }
}

impl From<Url> for Request {
    fn from(url: Url) -> Self {
        Request::get(url)
    }
}

impl TryFrom<&str> for Request {
    type Error = ErrorKind;

    fn try_from(value: &str) -> Result<Self> {
        let url = Url::parse(value).map_err(|e| ErrorKind::ParseUrl(e, value.to_string()))?;
        Ok(Request::get(url))
    }
}

impl TryFrom<String> for Request {
    type Error = ErrorKind;

    fn try_from(value: String) -> Result<Self> {
        Request::try_from(value.as_str())
    }
}

impl Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}
