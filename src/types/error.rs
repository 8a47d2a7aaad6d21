use std::time::Duration;

use thiserror::Error;

/// Kinds of session errors.
/// Note: The error messages can change over time, so don't match on the output.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The session was configured with invalid or missing parameters.
    /// Raised at construction, never during dispatch.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Network error while handling a request.
    #[error("network error")]
    NetworkRequest(#[source] reqwest::Error),

    /// Cannot read the body of the received response
    #[error("error reading response body: {0}")]
    ReadResponseBody(#[source] reqwest::Error),

    /// The network client required for making requests cannot be created
    #[error("error creating request client: {0}")]
    BuildRequestClient(#[source] reqwest::Error),

    /// The request (transport call plus admission waits) exceeded its timeout
    #[error("request timed out")]
    Timeout,

    /// Admission was refused while `raise_errors` is set
    #[error("rate limit exceeded for `{url}` (retry after {retry_after:?})")]
    RateLimited {
        /// The request that was refused
        url: String,
        /// How long the limiter asked us to wait
        retry_after: Duration,
    },

    /// The key-value backend is unavailable or an operation failed
    #[error("key-value backend error")]
    KvBackend(#[from] redis::RedisError),

    /// The SQL backend is unavailable or an operation failed
    #[error("sql backend error")]
    SqlBackend(#[from] tokio_rusqlite::Error),

    /// The temporary key-value server could not be spawned or never became ready
    #[error("cannot start key-value server: {0}")]
    KvServer(String),

    /// A cached response could not be encoded
    #[error("cannot encode cached response")]
    Encode(#[source] bincode::Error),

    /// A cached response could not be decoded.
    /// The cache treats this as a miss and evicts the offending key.
    #[error("cannot decode cached response")]
    Decode(#[source] bincode::Error),

    /// The given string can not be parsed into a valid URL
    #[error("cannot parse string `{1}` as website url: {0}")]
    ParseUrl(#[source] url::ParseError, String),

    /// A header value could not be parsed
    #[error("header could not be parsed")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),

    /// A header name could not be parsed
    #[error("header name could not be parsed")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// A cached method string could not be parsed back into a method
    #[error("invalid request method")]
    InvalidMethod(#[from] http::method::InvalidMethod),

    /// Error while executing a future on the tokio runtime
    #[error("task failed to execute to completion")]
    RuntimeJoin(#[from] tokio::task::JoinError),

    /// I/O error (temporary files, compression, runtime construction)
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The result type of `floodgate`
pub type Result<T> = std::result::Result<T, ErrorKind>;
