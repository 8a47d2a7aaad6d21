use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use http::{header, HeaderMap, HeaderValue};
use log::warn;

use crate::types::{ErrorKind, Request, Response, Result};

/// The HTTP transport the session dispatches through.
///
/// Sessions ship with [`HttpTransport`]; tests (or exotic setups) plug in
/// their own implementation.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Send the request and return the response.
    ///
    /// # Errors
    ///
    /// Network failures surface as [`ErrorKind::NetworkRequest`], timeouts
    /// as [`ErrorKind::Timeout`].
    async fn send(&self, request: &Request) -> Result<Response>;
}

/// Default transport over a shared `reqwest` client
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build the transport with the session's default headers and timeout
    ///
    /// # Errors
    ///
    /// Returns an error if the user agent is not a valid header value or
    /// the underlying client cannot be constructed.
    pub fn new(
        user_agent: &str,
        custom_headers: &HeaderMap,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_str(user_agent)?);
        headers.extend(custom_headers.clone());

        let mut builder = reqwest::ClientBuilder::new()
            .gzip(true)
            .default_headers(headers);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(ErrorKind::BuildRequestClient)?;
        Ok(HttpTransport { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &Request) -> Result<Response> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());
        if !request.headers.is_empty() {
            builder = builder.headers(request.headers.clone());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ErrorKind::Timeout
            } else {
                warn!("request to {} failed: {e}", request.url);
                ErrorKind::NetworkRequest(e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                ErrorKind::Timeout
            } else {
                ErrorKind::ReadResponseBody(e)
            }
        })?;

        Ok(Response::new(
            request.method.clone(),
            url,
            status,
            headers,
            body.to_vec(),
        ))
    }
}
