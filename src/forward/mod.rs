//! Forwarder: builds and retries the upstream exchange, then tees the
//! response body to the client and to the cache simultaneously
//! (SPEC_FULL.md §4.G).

use std::{path::PathBuf, time::Duration};

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use reqwest::{Client, Response};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::cache::{key::normalize_image_accept, CacheKey, CacheManager};
use crate::core::{ProxyError, ProxyResult};
use crate::health::HealthChecker;

const MAX_RETRIES: usize = 2;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_millis(2000);
const BROWSER_UA: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/124.0.0.0 Safari/537.36";

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const CSP_HEADERS: &[&str] = &[
    "content-security-policy",
    "content-security-policy-report-only",
    "x-content-security-policy",
    "x-webkit-csp",
];

const RETRIABLE_STATUS: &[u16] = &[408, 429, 500, 502, 503, 504];

fn is_retriable_error(err: &reqwest::Error) -> bool {
    if err.is_timeout() || err.is_connect() {
        return true;
    }
    let msg = err.to_string().to_ascii_lowercase();
    ["connection reset", "no such host", "eof", "broken pipe", "tls handshake timeout"]
        .iter()
        .any(|needle| msg.contains(needle))
}

fn backoff_delay(attempt: usize) -> Duration {
    let ms = INITIAL_BACKOFF.as_millis() as u64 * 2u64.pow(attempt as u32);
    Duration::from_millis(ms).min(MAX_BACKOFF)
}

fn origin_of(url: &str) -> Option<String> {
    url::Url::parse(url).ok().map(|u| {
        let mut origin = format!("{}://{}", u.scheme(), u.host_str().unwrap_or(""));
        if let Some(port) = u.port() {
            origin.push(':');
            origin.push_str(&port.to_string());
        }
        origin
    })
}

/// Drops headers named in the `Connection` request header on top of the
/// fixed hop-by-hop set.
fn connection_scoped_drops(client_headers: &HeaderMap) -> Vec<String> {
    client_headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').map(|s| s.trim().to_ascii_lowercase()).collect())
        .unwrap_or_default()
}

/// Builds the outbound request headers per SPEC_FULL.md §4.G header policy.
pub fn build_upstream_headers(
    client_headers: &HeaderMap,
    target_url: &str,
    is_image: bool,
) -> HeaderMap {
    let extra_drops = connection_scoped_drops(client_headers);
    let mut out = HeaderMap::new();

    for (name, value) in client_headers.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str())
            || lower.starts_with("proxy-")
            || extra_drops.contains(&lower)
        {
            continue;
        }
        if CSP_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        if lower == "host" || lower == "origin" || lower == "referer" || lower == "accept" {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    if let Some(origin) = origin_of(target_url) {
        if let Ok(host_value) = HeaderValue::from_str(
            url::Url::parse(target_url)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.to_string()))
                .unwrap_or_default()
                .as_str(),
        ) {
            out.insert(http::header::HOST, host_value);
        }
        if let Ok(v) = HeaderValue::from_str(&origin) {
            out.insert(HeaderName::from_static("origin"), v.clone());
            out.insert(http::header::REFERER, v);
        }
    }

    if !out.contains_key(http::header::USER_AGENT) {
        out.insert(
            http::header::USER_AGENT,
            HeaderValue::from_static(BROWSER_UA),
        );
    }

    if is_image {
        let accept = client_headers
            .get(http::header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("*/*");
        let bucket = normalize_image_accept(accept);
        if let Ok(v) = HeaderValue::from_str(bucket.as_str()) {
            out.insert(http::header::ACCEPT, v);
        }
    }

    out
}

pub struct ForwardResult {
    pub response: Response,
    pub tries: usize,
}

/// Removes the backing temp file unless the write completed successfully
/// (SPEC_FULL.md §5 cancellation: a cancelled copy never commits a
/// partial file).
struct TempGuard {
    path: PathBuf,
    committed: bool,
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

pub struct StreamOutcome {
    pub bytes_written: u64,
    pub cache_item: Option<std::sync::Arc<crate::cache::CacheItem>>,
}

pub struct Forwarder {
    client: Client,
    health: std::sync::Arc<HealthChecker>,
}

impl Forwarder {
    pub fn new(health: std::sync::Arc<HealthChecker>) -> Self {
        Self {
            client: Client::builder().build().unwrap_or_else(|_| Client::new()),
            health,
        }
    }

    /// Executes the upstream request with retry/backoff per
    /// SPEC_FULL.md §4.G, Property 9 (at most `MAX_RETRIES + 1` attempts).
    pub async fn forward(
        &self,
        method: Method,
        target_url: &str,
        client_headers: &HeaderMap,
        is_image: bool,
    ) -> ProxyResult<ForwardResult> {
        let headers = build_upstream_headers(client_headers, target_url, is_image);
        let mut last_err: Option<reqwest::Error> = None;
        let mut last_resp: Option<Response> = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt - 1)).await;
            }

            let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
                .unwrap_or(reqwest::Method::GET);
            let mut req = self.client.request(reqwest_method, target_url);
            for (name, value) in headers.iter() {
                req = req.header(name.as_str(), value.as_bytes());
            }

            let started = std::time::Instant::now();
            match req.send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if RETRIABLE_STATUS.contains(&status) {
                        if attempt < MAX_RETRIES {
                            last_resp = Some(resp);
                            continue;
                        }
                        self.health.record_failure(target_url, &format!("status {status}"));
                        last_resp = Some(resp);
                        break;
                    }
                    self.health.record_success(target_url, started.elapsed());
                    return Ok(ForwardResult {
                        response: resp,
                        tries: attempt + 1,
                    });
                }
                Err(e) => {
                    let retriable = is_retriable_error(&e);
                    self.health.record_failure(target_url, &e.to_string());
                    if retriable && attempt < MAX_RETRIES {
                        last_err = Some(e);
                        continue;
                    }
                    last_err = Some(e);
                    break;
                }
            }
        }

        if let Some(resp) = last_resp {
            return Ok(ForwardResult {
                response: resp,
                tries: MAX_RETRIES + 1,
            });
        }
        Err(ProxyError::Upstream(
            last_err.map(|e| e.to_string()).unwrap_or_else(|| "unknown upstream error".to_string()),
        ))
    }

    /// Streams the response body into `client_sink`, simultaneously
    /// teeing it into a cache temp file when `cache_key` is `Some` and the
    /// response is cacheable (GET + 2xx). Client-write errors (broken
    /// pipe, reset) are logged, not propagated (SPEC_FULL.md §7).
    pub async fn stream_response<W: tokio::io::AsyncWrite + Unpin>(
        &self,
        mut response: Response,
        client_sink: &mut W,
        cache: &CacheManager,
        cache_key: Option<CacheKey>,
        content_type: String,
        content_encoding: Option<String>,
    ) -> ProxyResult<StreamOutcome> {
        let cacheable = cache_key.is_some() && response.status().is_success();

        let mut temp: Option<(TempGuard, tokio::fs::File, Sha256, u64)> = if cacheable {
            match cache.create_temp().await {
                Ok((path, file)) => Some((
                    TempGuard {
                        path,
                        committed: false,
                    },
                    file,
                    Sha256::new(),
                    0,
                )),
                Err(e) => {
                    log::warn!("forward: failed to create cache temp file: {e}");
                    None
                }
            }
        } else {
            None
        };

        let mut total: u64 = 0;
        loop {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    log::debug!("forward: upstream stream error: {e}");
                    break;
                }
            };
            total += chunk.len() as u64;

            if let Err(e) = client_sink.write_all(&chunk).await {
                log::debug!("forward: client write error (disconnect?): {e}");
                if let Some((guard, _, _, _)) = temp.take() {
                    drop(guard);
                }
                return Ok(StreamOutcome {
                    bytes_written: total,
                    cache_item: None,
                });
            }

            if let Some((_, file, hasher, size)) = temp.as_mut() {
                if let Err(e) = file.write_all(&chunk).await {
                    log::warn!("forward: cache temp write failed, dropping cache entry: {e}");
                    temp = None;
                } else {
                    hasher.update(&chunk);
                    *size += chunk.len() as u64;
                }
            }
        }

        let cache_item = if let Some((mut guard, mut file, hasher, size)) = temp {
            if let Err(e) = file.sync_all().await {
                log::warn!("forward: cache fsync failed: {e}");
                None
            } else {
                drop(file);
                let hash = format!("{:x}", hasher.finalize());
                let key = cache_key.expect("cacheable implies cache_key is Some");
                match cache.commit(key, guard.path.clone(), hash, size, content_type, content_encoding) {
                    Ok(item) => {
                        guard.committed = true;
                        Some(item)
                    }
                    Err(e) => {
                        log::warn!("forward: cache commit failed: {e}");
                        None
                    }
                }
            }
        } else {
            None
        };

        Ok(StreamOutcome {
            bytes_written: total,
            cache_item,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_millis(100));
        assert_eq!(backoff_delay(1), Duration::from_millis(200));
        assert_eq!(backoff_delay(5), MAX_BACKOFF);
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONNECTION, HeaderValue::from_static("close"));
        headers.insert(
            HeaderName::from_static("transfer-encoding"),
            HeaderValue::from_static("chunked"),
        );
        headers.insert(http::header::USER_AGENT, HeaderValue::from_static("test-agent"));

        let out = build_upstream_headers(&headers, "https://origin.example/a", false);
        assert!(!out.contains_key(http::header::CONNECTION));
        assert!(!out.contains_key("transfer-encoding"));
        assert_eq!(out.get(http::header::USER_AGENT).unwrap(), "test-agent");
    }

    #[test]
    fn image_accept_is_narrowed() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::ACCEPT,
            HeaderValue::from_static("image/avif,image/webp;q=0.9,*/*;q=0.8"),
        );
        let out = build_upstream_headers(&headers, "https://origin.example/a.png", true);
        assert_eq!(out.get(http::header::ACCEPT).unwrap(), "image/avif");
    }
}
