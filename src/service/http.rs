//! Main gateway pipeline: Path Matcher -> Rule Engine -> Redirect Decider
//! -> Cache Manager / Forwarder (SPEC_FULL.md §2 request flow), exposed
//! as a `pingora` `ServeHttp` app the same way the teacher exposes its
//! admin surface.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};

use async_trait::async_trait;
use http::{HeaderValue, Method, Response, StatusCode};
use pingora::{apps::http_app::ServeHttp, protocols::http::ServerSession};
use tokio::io::AsyncWrite;

use crate::ban::BanManager;
use crate::cache::{key::looks_like_image_path, CacheKey, CacheManager};
use crate::config::ConfigHandle;
use crate::forward::Forwarder;
use crate::health::HealthChecker;
use crate::matcher::{PathMatcher, RuleEngine};
use crate::metrics::{MetricsCollector, RequestMetric};
use crate::mirror;
use crate::probe::ProbeCache;
use crate::redirect;
use crate::utils::request::{get_client_ip, get_req_header_value, get_request_host};
use crate::utils::response::{set_cache_hit, set_redirect_marker, set_retry_after, set_vary_accept};

/// An in-memory sink `Forwarder::stream_response` can tee into; `ServeHttp`
/// returns a fully-buffered `Response<Vec<u8>>`, so the "streamed" client
/// side of the tee is this buffer rather than a live socket write.
struct VecSink(Vec<u8>);

impl AsyncWrite for VecSink {
    fn poll_write(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        self.0.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

pub struct HttpService {
    config: Arc<ConfigHandle>,
    path_matcher_cell: arc_swap::ArcSwap<PathMatcher>,
    rule_engine: RuleEngine,
    proxy_cache: Arc<CacheManager>,
    mirror_cache: Arc<CacheManager>,
    forwarder: Forwarder,
    health: Arc<HealthChecker>,
    bans: Arc<BanManager>,
    metrics: Arc<MetricsCollector>,
}

fn not_found() -> Response<Vec<u8>> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Vec::new())
        .unwrap()
}

fn bad_gateway(message: &str) -> Response<Vec<u8>> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(serde_json::to_vec(&serde_json::json!({"error": message})).unwrap_or_default())
        .unwrap()
}

fn banned_response(ban_end_time: i64, remaining_seconds: i64) -> Response<Vec<u8>> {
    let body = serde_json::to_vec(&serde_json::json!({
        "ban_end_time": ban_end_time,
        "remaining_seconds": remaining_seconds,
    }))
    .unwrap_or_default();
    let mut resp = Response::builder()
        .status(StatusCode::TOO_MANY_REQUESTS)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(body)
        .unwrap();
    set_retry_after(resp.headers_mut(), remaining_seconds);
    resp
}

impl HttpService {
    pub fn new(
        config: Arc<ConfigHandle>,
        probe: Arc<ProbeCache>,
        proxy_cache: Arc<CacheManager>,
        mirror_cache: Arc<CacheManager>,
        health: Arc<HealthChecker>,
        bans: Arc<BanManager>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let path_matcher = PathMatcher::compile(&config.current().map);
        Self {
            forwarder: Forwarder::new(health.clone()),
            rule_engine: RuleEngine::new(probe),
            path_matcher_cell: arc_swap::ArcSwap::from_pointee(path_matcher),
            config,
            proxy_cache,
            mirror_cache,
            health,
            bans,
            metrics,
        }
    }

    /// Recompiles the Path Matcher after a config reload.
    pub fn refresh_path_matcher(&self) {
        let matcher = PathMatcher::compile(&self.config.current().map);
        self.path_matcher_cell.store(Arc::new(matcher));
    }

    /// A handle the matcher-cache background sweeper runs against.
    pub fn matcher_cache_handle(&self) -> Arc<crate::matcher::ExtensionMatcherCache> {
        self.rule_engine.matcher_cache_handle()
    }

    fn cache_key_for(path: &str, accept: &str, user_agent: &str) -> CacheKey {
        if looks_like_image_path(path) {
            CacheKey::for_image(path, accept, user_agent)
        } else {
            CacheKey::raw(path, accept, user_agent)
        }
    }

    async fn handle_mirror(&self, session: &mut ServerSession, path: &str, query: &str) -> Response<Vec<u8>> {
        let method = session.req_header().method.clone();
        if mirror::is_preflight(&method) {
            let mut resp = Response::builder().status(StatusCode::NO_CONTENT).body(Vec::new()).unwrap();
            *resp.headers_mut() = mirror::cors_headers();
            return resp;
        }

        let target_url = match mirror::parse_mirror_url(path, query) {
            Some(url) => url,
            None => return not_found(),
        };

        let accept = get_req_header_value(session.req_header(), "accept").unwrap_or("*/*").to_string();
        let ua = get_req_header_value(session.req_header(), "user-agent").unwrap_or("").to_string();
        let cache_key = Self::cache_key_for(&target_url, &accept, &ua);

        let mut headers = mirror::cors_headers();

        if let Some((item, _)) = self.mirror_cache.get(&cache_key) {
            let body = tokio::fs::read(&item.file_path).await.unwrap_or_default();
            headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_str(&item.content_type).unwrap());
            set_cache_hit(&mut headers, true);
            let mut resp = Response::builder().status(StatusCode::OK).body(body).unwrap();
            *resp.headers_mut() = headers;
            return resp;
        }

        let client_headers = session.req_header().headers.clone();
        let is_image = looks_like_image_path(&target_url);
        match self.forwarder.forward(method, &target_url, &client_headers, is_image).await {
            Ok(result) => {
                let status = result.response.status();
                let content_type = result
                    .response
                    .headers()
                    .get(http::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let content_encoding = result
                    .response
                    .headers()
                    .get(http::header::CONTENT_ENCODING)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());

                let mut sink = VecSink(Vec::new());
                let outcome = self
                    .forwarder
                    .stream_response(
                        result.response,
                        &mut sink,
                        &self.mirror_cache,
                        Some(cache_key),
                        content_type.clone(),
                        content_encoding,
                    )
                    .await;

                headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_str(&content_type).unwrap());
                set_cache_hit(&mut headers, false);
                let body = match outcome {
                    Ok(outcome) => {
                        let _ = outcome.cache_item;
                        sink.0
                    }
                    Err(e) => {
                        log::warn!("mirror: stream failed: {e}");
                        sink.0
                    }
                };
                let mut resp = Response::builder().status(status.as_u16()).body(body).unwrap();
                *resp.headers_mut() = headers;
                resp
            }
            Err(e) => {
                log::warn!("mirror: upstream fetch failed for {target_url}: {e}");
                bad_gateway(&e.to_string())
            }
        }
    }

    async fn handle_proxy(&self, session: &mut ServerSession, path: &str, query: &str) -> (Response<Vec<u8>>, u16) {
        let matcher = self.path_matcher_cell.load();
        let matched = match matcher.match_path(path) {
            Some(m) => m,
            None => return (not_found(), 404),
        };

        if !matched.config.enabled {
            return (not_found(), 404);
        }

        let host = get_request_host(session.req_header()).unwrap_or("").to_string();
        let selected = self
            .rule_engine
            .select_rule(
                &matched.prefix,
                &matched.config.extension_map,
                &matched.config.default_target,
                &matched.remainder,
                &host,
            )
            .await;

        let decision = redirect::decide(&matched.config, selected.as_ref(), &matched.remainder, query);

        if decision.should_redirect {
            let mut resp = Response::builder()
                .status(StatusCode::FOUND)
                .header(http::header::LOCATION, decision.target_url)
                .body(Vec::new())
                .unwrap();
            set_redirect_marker(resp.headers_mut());
            return (resp, 302);
        }

        let accept = get_req_header_value(session.req_header(), "accept").unwrap_or("*/*").to_string();
        let ua = get_req_header_value(session.req_header(), "user-agent").unwrap_or("").to_string();
        let is_image = looks_like_image_path(path);
        let cache_key = Self::cache_key_for(path, &accept, &ua);

        if let Some((item, _fallback_used)) = self.proxy_cache.get(&cache_key) {
            let body = tokio::fs::read(&item.file_path).await.unwrap_or_default();
            let mut headers = http::HeaderMap::new();
            headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_str(&item.content_type).unwrap());
            if let Some(encoding) = &item.content_encoding {
                if let Ok(v) = HeaderValue::from_str(encoding) {
                    headers.insert(http::header::CONTENT_ENCODING, v);
                }
            }
            set_cache_hit(&mut headers, true);
            if is_image {
                set_vary_accept(&mut headers);
            }
            let mut resp = Response::builder().status(StatusCode::OK).body(body).unwrap();
            *resp.headers_mut() = headers;
            return (resp, 200);
        }

        let client_headers = session.req_header().headers.clone();
        match self.forwarder.forward(Method::GET, &decision.target_url, &client_headers, is_image).await {
            Ok(result) => {
                let status = result.response.status();
                let content_type = result
                    .response
                    .headers()
                    .get(http::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let content_encoding = result
                    .response
                    .headers()
                    .get(http::header::CONTENT_ENCODING)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());

                let mut sink = VecSink(Vec::new());
                let outcome = self
                    .forwarder
                    .stream_response(
                        result.response,
                        &mut sink,
                        &self.proxy_cache,
                        Some(cache_key),
                        content_type.clone(),
                        content_encoding,
                    )
                    .await;

                let mut headers = http::HeaderMap::new();
                if let Ok(v) = HeaderValue::from_str(&content_type) {
                    headers.insert(http::header::CONTENT_TYPE, v);
                }
                set_cache_hit(&mut headers, false);
                if is_image {
                    set_vary_accept(&mut headers);
                }
                let body = match outcome {
                    Ok(outcome) => {
                        let _ = outcome.cache_item;
                        sink.0
                    }
                    Err(e) => {
                        log::warn!("proxy: stream failed: {e}");
                        sink.0
                    }
                };
                let status_code = status.as_u16();
                let mut resp = Response::builder().status(status_code).body(body).unwrap();
                *resp.headers_mut() = headers;
                (resp, status_code)
            }
            Err(e) => {
                log::warn!("proxy: upstream fetch failed for {}: {e}", decision.target_url);
                (bad_gateway(&e.to_string()), 502)
            }
        }
    }
}

#[async_trait]
impl ServeHttp for HttpService {
    async fn response(&self, session: &mut ServerSession) -> Response<Vec<u8>> {
        session.set_keepalive(None);
        self.metrics.request_started();
        let started = Instant::now();

        let (path, query) = {
            let header = session.req_header();
            (header.uri.path().to_string(), header.uri.query().unwrap_or("").to_string())
        };
        let client_ip = get_client_ip(session);
        let is_admin_path = path.starts_with("/admin");

        if !is_admin_path {
            if let Some(ban) = self.bans.check(&client_ip) {
                let resp = banned_response(ban.ban_end_time, ban.remaining_seconds);
                self.metrics.request_finished(RequestMetric {
                    path: path.clone(),
                    referer: get_req_header_value(session.req_header(), "referer").map(|s| s.to_string()),
                    status: 429,
                    latency_ms: started.elapsed().as_secs_f64() * 1000.0,
                    cache_hit: false,
                    timestamp: chrono::Utc::now().timestamp(),
                });
                return resp;
            }
        }

        let referer = get_req_header_value(session.req_header(), "referer").map(|s| s.to_string());

        let (response, status) = if path.starts_with("/mirror/") {
            let resp = self.handle_mirror(session, &path, &query).await;
            let status = resp.status().as_u16();
            (resp, status)
        } else {
            self.handle_proxy(session, &path, &query).await
        };

        if status == 404 && !is_admin_path {
            self.bans.record_error(&client_ip);
        }

        self.metrics.request_finished(RequestMetric {
            path,
            referer,
            status,
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
            cache_hit: status == 200 && response.headers().get(crate::mirror::CACHE_HIT_HEADER).map(|v| v == "1").unwrap_or(false),
            timestamp: chrono::Utc::now().timestamp(),
        });

        response
    }
}
