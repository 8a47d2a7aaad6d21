use std::fmt::Display;

use http::{HeaderMap, Method, StatusCode};
use once_cell::sync::OnceCell;
use serde_json::Value;
use url::Url;

use crate::callback::CallbackOutcome;

/// Response returned by the session after dispatching a request.
///
/// The body is kept as raw bytes; the JSON payload is decoded lazily on
/// first access and memoized. Responses served from the cache are flagged
/// with [`Response::is_cached`].
#[derive(Debug)]
pub struct Response {
    method: Method,
    url: Url,
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
    cached: bool,
    json: OnceCell<Option<Value>>,
    callbacks: Vec<CallbackOutcome>,
}

impl Response {
    /// Create a new response
    #[must_use]
    pub fn new(
        method: Method,
        url: Url,
        status: StatusCode,
        headers: HeaderMap,
        body: Vec<u8>,
    ) -> Self {
        Response {
            method,
            url,
            status,
            headers,
            body,
            cached: false,
            json: OnceCell::new(),
            callbacks: Vec::new(),
        }
    }

    /// The status code of the response
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Whether the status code is in the 2xx range
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// The method of the originating request
    #[must_use]
    pub const fn method(&self) -> &Method {
        &self.method
    }

    /// The URL of the originating request
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// The response headers
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The raw response body
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The response body decoded as UTF-8, lossily
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// The response body decoded as JSON.
    ///
    /// Decoded on first access and memoized; returns `None` when the body
    /// is not valid JSON.
    pub fn json(&self) -> Option<&Value> {
        self.json
            .get_or_init(|| serde_json::from_slice(&self.body).ok())
            .as_ref()
    }

    /// Whether this response was served from the cache
    #[must_use]
    pub const fn is_cached(&self) -> bool {
        self.cached
    }

    /// Collected callback return values.
    ///
    /// Empty unless the session was built with `return_callbacks`.
    #[must_use]
    pub fn callbacks(&self) -> &[CallbackOutcome] {
        &self.callbacks
    }

    pub(crate) fn mark_cached(&mut self) {
        self.cached = true;
    }

    pub(crate) fn set_callbacks(&mut self, outcomes: Vec<CallbackOutcome>) {
        self.callbacks = outcomes;
    }
}

impl Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} [{}]", self.method, self.url, self.status)?;
        if self.cached {
            write!(f, " (cached)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(body: &[u8]) -> Response {
        Response::new(
            Method::GET,
            Url::parse("https://example.com").unwrap(),
            StatusCode::OK,
            HeaderMap::new(),
            body.to_vec(),
        )
    }

    #[test]
    fn test_lazy_json() {
        let resp = response(br#"{"answer": 42}"#);
        assert_eq!(resp.json().unwrap()["answer"], 42);
        // second access hits the memoized value
        assert_eq!(resp.json().unwrap()["answer"], 42);
    }

    #[test]
    fn test_json_on_non_json_body() {
        let resp = response(b"plain text");
        assert!(resp.json().is_none());
        assert_eq!(resp.text(), "plain text");
    }

    #[test]
    fn test_display() {
        let mut resp = response(b"");
        assert_eq!(resp.to_string(), "GET https://example.com/ [200 OK]");
        resp.mark_cached();
        assert_eq!(
            resp.to_string(),
            "GET https://example.com/ [200 OK] (cached)"
        );
    }
}
