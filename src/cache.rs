use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use log::warn;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::backend::Backend;
use crate::fingerprint::{cache_key, fingerprint, Fingerprint};
use crate::types::{ErrorKind, Request, Response, Result};

/// First byte of every stored entry; tells the reader whether the payload
/// that follows is compressed
const RAW: u8 = 0;
const ZLIB: u8 = 1;

/// Serialized form of a response. Headers are kept as raw byte pairs so
/// binary-safe values round-trip bit-for-bit; the JSON payload is not
/// stored, it gets recomputed lazily on read.
#[derive(Debug, Serialize, Deserialize)]
struct CachedResponse {
    status: u16,
    method: String,
    url: String,
    headers: Vec<(String, Vec<u8>)>,
    body: Vec<u8>,
}

/// Response cache over a [`Backend`]: maps request fingerprints to stored
/// responses with TTL eviction.
pub struct ResponseCache {
    backend: Arc<dyn Backend>,
    prefix: String,
    default_ttl: Duration,
    compression: bool,
}

impl fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCache")
            .field("prefix", &self.prefix)
            .field("default_ttl", &self.default_ttl)
            .field("compression", &self.compression)
            .finish_non_exhaustive()
    }
}

impl ResponseCache {
    /// Create a cache storing entries under `<prefix>:cache:` with the
    /// given default TTL
    #[must_use]
    pub fn new(
        backend: Arc<dyn Backend>,
        prefix: String,
        default_ttl: Duration,
        compression: bool,
    ) -> Self {
        ResponseCache {
            backend,
            prefix,
            default_ttl,
            compression,
        }
    }

    /// Look up the cached response for `request`.
    ///
    /// A miss is `Ok(None)`, never an error. An entry that cannot be
    /// decoded is logged, evicted, and reported as a miss.
    ///
    /// # Errors
    ///
    /// Returns an error only when the backend read itself fails.
    pub async fn lookup(&self, request: &Request) -> Result<Option<Response>> {
        self.lookup_fingerprint(&fingerprint(request)).await
    }

    /// Look up a cached response by fingerprint
    ///
    /// # Errors
    ///
    /// Returns an error only when the backend read itself fails.
    pub async fn lookup_fingerprint(&self, fingerprint: &Fingerprint) -> Result<Option<Response>> {
        let key = cache_key(&self.prefix, fingerprint);
        let Some(raw) = self.backend.get(&key).await? else {
            return Ok(None);
        };
        match decode(&raw) {
            Ok(mut response) => {
                response.mark_cached();
                Ok(Some(response))
            }
            Err(e) => {
                warn!("evicting unreadable cache entry `{key}`: {e}");
                let _ = self.backend.delete(&key).await;
                Ok(None)
            }
        }
    }

    /// Store `response` under the fingerprint of `request`. A later store
    /// for the same request overwrites the entry and its TTL.
    ///
    /// # Errors
    ///
    /// Returns an error when encoding or the backend write fails.
    pub async fn store(
        &self,
        request: &Request,
        response: &Response,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let key = cache_key(&self.prefix, &fingerprint(request));
        let encoded = encode(response, self.compression)?;
        self.backend
            .set(&key, &encoded, ttl.unwrap_or(self.default_ttl))
            .await
    }

    /// Drop every entry stored by this cache
    ///
    /// # Errors
    ///
    /// Returns an error when the backend delete fails.
    pub async fn clear(&self) -> Result<()> {
        self.backend.clear(&format!("{}:cache:", self.prefix)).await
    }
}

fn encode(response: &Response, compression: bool) -> Result<Vec<u8>> {
    let cached = CachedResponse {
        status: response.status().as_u16(),
        method: response.method().to_string(),
        url: response.url().to_string(),
        headers: response
            .headers()
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect(),
        body: response.body().to_vec(),
    };
    let payload = bincode::serialize(&cached).map_err(ErrorKind::Encode)?;
    if compression {
        let mut encoder = ZlibEncoder::new(vec![ZLIB], Compression::default());
        encoder.write_all(&payload)?;
        Ok(encoder.finish()?)
    } else {
        let mut out = Vec::with_capacity(payload.len() + 1);
        out.push(RAW);
        out.extend_from_slice(&payload);
        Ok(out)
    }
}

fn decode(raw: &[u8]) -> Result<Response> {
    let (flag, payload) = raw
        .split_first()
        .ok_or_else(|| ErrorKind::Decode(Box::new(bincode::ErrorKind::Custom(
            "empty cache entry".to_string(),
        ))))?;
    let decompressed;
    let payload = match *flag {
        ZLIB => {
            let mut decoder = ZlibDecoder::new(payload);
            let mut buffer = Vec::new();
            decoder.read_to_end(&mut buffer)?;
            decompressed = buffer;
            &decompressed[..]
        }
        _ => payload,
    };
    let cached: CachedResponse = bincode::deserialize(payload).map_err(ErrorKind::Decode)?;
    let mut headers = HeaderMap::with_capacity(cached.headers.len());
    for (name, value) in cached.headers {
        headers.append(
            HeaderName::from_bytes(name.as_bytes())?,
            HeaderValue::from_bytes(&value)?,
        );
    }
    let url = Url::parse(&cached.url).map_err(|e| ErrorKind::ParseUrl(e, cached.url.clone()))?;
    Ok(Response::new(
        Method::from_bytes(cached.method.as_bytes())?,
        url,
        StatusCode::from_u16(cached.status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        headers,
        cached.body,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::test_utils::ManualClock;
    use std::convert::TryFrom;

    fn cache(compression: bool) -> (ResponseCache, Arc<dyn Backend>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000.0));
        let backend: Arc<dyn Backend> =
            Arc::new(MemoryBackend::new(Duration::ZERO, clock.clone()));
        (
            ResponseCache::new(
                backend.clone(),
                "test".to_string(),
                Duration::from_secs(300),
                compression,
            ),
            backend,
            clock,
        )
    }

    fn sample_response(request: &Request) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        // binary-safe header value
        headers.append(
            "x-opaque",
            HeaderValue::from_bytes(&[0xde, 0xad, 0xbe, 0xef][..2]).unwrap(),
        );
        Response::new(
            request.method.clone(),
            request.url.clone(),
            StatusCode::OK,
            headers,
            br#"{"hello": "world"}"#.to_vec(),
        )
    }

    #[tokio::test]
    async fn test_round_trip_is_bit_exact() {
        for compression in [false, true] {
            let (cache, _, _) = cache(compression);
            let request = Request::try_from("https://example.com/data?x=1").unwrap();
            let response = sample_response(&request);
            cache.store(&request, &response, None).await.unwrap();

            let hit = cache.lookup(&request).await.unwrap().unwrap();
            assert!(hit.is_cached());
            assert_eq!(hit.status(), response.status());
            assert_eq!(hit.body(), response.body());
            assert_eq!(hit.headers(), response.headers());
            assert_eq!(hit.url(), response.url());
            // the JSON payload is recomputed on read
            assert_eq!(hit.json().unwrap()["hello"], "world");
        }
    }

    #[tokio::test]
    async fn test_miss_is_not_an_error() {
        let (cache, _, _) = cache(true);
        let request = Request::try_from("https://example.com/never-stored").unwrap();
        assert!(cache.lookup(&request).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let (cache, _, clock) = cache(true);
        let request = Request::try_from("https://example.com/a").unwrap();
        let response = sample_response(&request);
        cache
            .store(&request, &response, Some(Duration::from_secs(10)))
            .await
            .unwrap();
        clock.advance(11.0);
        assert!(cache.lookup(&request).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restore_refreshes_ttl() {
        let (cache, _, clock) = cache(true);
        let request = Request::try_from("https://example.com/a").unwrap();
        let response = sample_response(&request);
        cache
            .store(&request, &response, Some(Duration::from_secs(10)))
            .await
            .unwrap();
        clock.advance(8.0);
        // the second store resolves to the later expiry
        cache
            .store(&request, &response, Some(Duration::from_secs(10)))
            .await
            .unwrap();
        clock.advance(8.0);
        assert!(cache.lookup(&request).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_evicted_and_reported_as_miss() {
        let (cache, backend, _) = cache(true);
        let request = Request::try_from("https://example.com/bad").unwrap();
        let key = cache_key("test", &fingerprint(&request));
        backend
            .set(&key, b"\x01not zlib at all", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(cache.lookup(&request).await.unwrap().is_none());
        // the bad entry is gone
        assert!(backend.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_removes_only_cache_keys() {
        let (cache, backend, _) = cache(true);
        let request = Request::try_from("https://example.com/a").unwrap();
        cache
            .store(&request, &sample_response(&request), None)
            .await
            .unwrap();
        backend
            .set("test:ratelimit:global", b"1", Duration::from_secs(60))
            .await
            .unwrap();
        cache.clear().await.unwrap();
        assert!(cache.lookup(&request).await.unwrap().is_none());
        assert!(backend
            .get("test:ratelimit:global")
            .await
            .unwrap()
            .is_some());
    }
}
