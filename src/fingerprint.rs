//! Canonical request addressing.
//!
//! A [`Fingerprint`] is a deterministic identifier derived from a request's
//! method, normalized URL, and (for body-carrying methods) a digest of the
//! body. It addresses cache entries and endpoint-scoped limiter state.

use std::fmt::{self, Display, Write as _};

use blake2::digest::consts::U16;
use blake2::{Blake2b, Digest};
use http::Method;
use url::Url;

use crate::types::Request;

/// 16-byte BLAKE2b, enough to keep key sizes small without collisions
/// mattering at cache scale
type Blake2b128 = Blake2b<U16>;

/// Deterministic canonical identifier of a request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// The fingerprint as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which requests share a limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// All requests of the session
    Global,
    /// Requests to the same host
    Host,
    /// Requests with the same fingerprint
    Endpoint,
}

/// Compute the fingerprint of a request.
///
/// Two requests that differ only in fragment, query-parameter order, or
/// percent-encoding of unreserved characters produce the same fingerprint.
#[must_use]
pub fn fingerprint(request: &Request) -> Fingerprint {
    let mut out = format!("{}:{}", request.method, normalize_url(&request.url));
    if let (Some(body), true) = (&request.body, has_body_semantics(&request.method)) {
        let digest = Blake2b128::digest(body);
        out.push(':');
        for byte in digest {
            // infallible on String
            let _ = write!(out, "{byte:02x}");
        }
    }
    Fingerprint(out)
}

/// The cache key for a fingerprint: `<prefix>:cache:<fingerprint>`
pub(crate) fn cache_key(prefix: &str, fingerprint: &Fingerprint) -> String {
    format!("{prefix}:cache:{fingerprint}")
}

/// The limiter keys a request must acquire, in evaluation order
/// (global, then host, then endpoint)
pub(crate) fn limiter_keys(
    prefix: &str,
    request: &Request,
    per_host: bool,
    per_endpoint: bool,
) -> Vec<(Scope, String)> {
    let mut keys = vec![(Scope::Global, format!("{prefix}:ratelimit:global"))];
    if per_host {
        if let Some(host) = request.host() {
            keys.push((
                Scope::Host,
                format!("{prefix}:ratelimit:host:{}", host.to_ascii_lowercase()),
            ));
        }
    }
    if per_endpoint {
        keys.push((
            Scope::Endpoint,
            format!("{prefix}:ratelimit:endpoint:{}", fingerprint(request)),
        ));
    }
    keys
}

/// Whether the method's semantics include a request body
fn has_body_semantics(method: &Method) -> bool {
    *method == Method::POST || *method == Method::PUT || *method == Method::PATCH
}

/// Canonicalize a URL: lowercase scheme and host (the `url` crate already
/// guarantees both), elide the default port, percent-decode unreserved
/// characters in the path, sort query parameters, strip the fragment.
fn normalize_url(url: &Url) -> String {
    let mut out = String::with_capacity(url.as_str().len());
    out.push_str(url.scheme());
    out.push_str("://");
    if let Some(host) = url.host_str() {
        out.push_str(&host.to_ascii_lowercase());
    }
    if let Some(port) = url.port() {
        // `Url::port` is `None` when the port is the scheme default
        let _ = write!(out, ":{port}");
    }
    out.push_str(&normalize_path(url.path()));
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if !pairs.is_empty() {
        pairs.sort();
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        serializer.extend_pairs(pairs);
        out.push('?');
        out.push_str(&serializer.finish());
    }
    out
}

/// Percent-decode only unreserved characters (RFC 3986 §2.3); everything
/// else keeps its escape, uppercased for determinism.
fn normalize_path(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = String::with_capacity(path.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                let decoded = hi * 16 + lo;
                if is_unreserved(decoded) {
                    out.push(decoded as char);
                } else {
                    out.push('%');
                    out.push(bytes[i + 1].to_ascii_uppercase() as char);
                    out.push(bytes[i + 2].to_ascii_uppercase() as char);
                }
                i += 3;
                continue;
            }
        }
        // a serialized URL path is always ASCII
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

const fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~')
}

const fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
