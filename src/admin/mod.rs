//! Admin HTTP surface: cache, health, ban, and path-metrics endpoints
//! (SPEC_FULL.md §4.M, §6), grounded in the teacher's `AdminHttpApp`
//! (generic `Handler`/router-over-matchit, `x-api-key` gate, uniform
//! `ResponseHelper` JSON envelopes) but re-pointed at this gateway's own
//! resources instead of an etcd-backed config store.

use std::{collections::HashMap, error::Error, fmt, sync::Arc};

use async_trait::async_trait;
use http::{header, Method, Response, StatusCode};
use matchit::{Match, Router};
use pingora::{apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service};
use serde::{Deserialize, Serialize};

use crate::ban::BanManager;
use crate::cache::CacheManager;
use crate::config::CacheConfig;
use crate::health::HealthChecker;
use crate::matcher::PathMatcher;
use crate::metrics::MetricsCollector;

#[derive(Debug)]
enum ApiError {
    InvalidRequest(String),
    NotFound(String),
    Internal(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::InvalidRequest(msg) => write!(f, "Invalid request: {msg}"),
            ApiError::NotFound(msg) => write!(f, "Not found: {msg}"),
            ApiError::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl Error for ApiError {}

impl ApiError {
    fn into_response(self) -> Response<Vec<u8>> {
        match self {
            ApiError::InvalidRequest(_) => {
                ResponseHelper::error(StatusCode::BAD_REQUEST, &self.to_string())
            }
            ApiError::NotFound(_) => ResponseHelper::error(StatusCode::NOT_FOUND, &self.to_string()),
            ApiError::Internal(_) => {
                ResponseHelper::error(StatusCode::INTERNAL_SERVER_ERROR, &self.to_string())
            }
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

struct ResponseHelper;

impl ResponseHelper {
    fn success_json<T: Serialize>(value: &T) -> Response<Vec<u8>> {
        match serde_json::to_vec(value) {
            Ok(body) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/json")
                .body(body)
                .unwrap_or_else(|_| Self::error(StatusCode::INTERNAL_SERVER_ERROR, "build failed")),
            Err(e) => Self::error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        }
    }

    fn error(status: StatusCode, message: &str) -> Response<Vec<u8>> {
        #[derive(Serialize)]
        struct ErrorBody<'a> {
            error: &'a str,
        }
        let body = serde_json::to_vec(&ErrorBody { error: message }).unwrap_or_default();
        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .unwrap_or_else(|e| {
                log::error!("admin: failed to build error response: {e}");
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(b"internal error".to_vec())
                    .unwrap()
            })
    }
}

/// Shared application state the admin handlers operate on.
pub struct AdminState {
    pub proxy_cache: Arc<CacheManager>,
    pub mirror_cache: Arc<CacheManager>,
    pub health: Arc<HealthChecker>,
    pub bans: Arc<BanManager>,
    pub metrics: Arc<MetricsCollector>,
    pub path_matcher: Arc<PathMatcher>,
}

impl AdminState {
    fn caches_for(&self, target: &str) -> Vec<&Arc<CacheManager>> {
        match target {
            "proxy" => vec![&self.proxy_cache],
            "mirror" => vec![&self.mirror_cache],
            _ => vec![&self.proxy_cache, &self.mirror_cache],
        }
    }
}

#[async_trait]
trait Handler {
    async fn handle(&self, state: &AdminState, body: Vec<u8>, query: &str) -> ApiResult<Response<Vec<u8>>>;
}

#[derive(Deserialize)]
struct CacheTarget {
    #[serde(rename = "type", default = "default_target")]
    target: String,
}

fn default_target() -> String {
    "all".to_string()
}

struct CacheStatsHandler;
#[async_trait]
impl Handler for CacheStatsHandler {
    async fn handle(&self, state: &AdminState, _body: Vec<u8>, _query: &str) -> ApiResult<Response<Vec<u8>>> {
        #[derive(Serialize)]
        struct Stats {
            proxy: crate::cache::CacheStats,
            mirror: crate::cache::CacheStats,
        }
        Ok(ResponseHelper::success_json(&Stats {
            proxy: state.proxy_cache.stats(),
            mirror: state.mirror_cache.stats(),
        }))
    }
}

#[derive(Deserialize)]
struct EnableBody {
    #[serde(rename = "type", default = "default_target")]
    target: String,
    enabled: bool,
}

struct CacheEnableHandler;
#[async_trait]
impl Handler for CacheEnableHandler {
    async fn handle(&self, state: &AdminState, body: Vec<u8>, _query: &str) -> ApiResult<Response<Vec<u8>>> {
        let parsed: EnableBody = serde_json::from_slice(&body)
            .map_err(|e| ApiError::InvalidRequest(format!("invalid body: {e}")))?;
        for cache in state.caches_for(&parsed.target) {
            cache.set_enabled(parsed.enabled);
        }
        Ok(ResponseHelper::success_json(&serde_json::json!({"ok": true})))
    }
}

struct CacheClearHandler;
#[async_trait]
impl Handler for CacheClearHandler {
    async fn handle(&self, state: &AdminState, body: Vec<u8>, _query: &str) -> ApiResult<Response<Vec<u8>>> {
        let parsed: CacheTarget = if body.is_empty() {
            CacheTarget {
                target: default_target(),
            }
        } else {
            serde_json::from_slice(&body)
                .map_err(|e| ApiError::InvalidRequest(format!("invalid body: {e}")))?
        };
        for cache in state.caches_for(&parsed.target) {
            cache
                .clear()
                .map_err(|e| ApiError::Internal(e.to_string()))?;
        }
        Ok(ResponseHelper::success_json(&serde_json::json!({"ok": true})))
    }
}

#[derive(Deserialize)]
struct ConfigBody {
    #[serde(rename = "type", default = "default_target")]
    target: String,
    config: CacheConfig,
}

struct CacheConfigHandler;
#[async_trait]
impl Handler for CacheConfigHandler {
    async fn handle(&self, state: &AdminState, body: Vec<u8>, _query: &str) -> ApiResult<Response<Vec<u8>>> {
        let parsed: ConfigBody = serde_json::from_slice(&body)
            .map_err(|e| ApiError::InvalidRequest(format!("invalid body: {e}")))?;
        for cache in state.caches_for(&parsed.target) {
            cache.update_config(parsed.config);
        }
        Ok(ResponseHelper::success_json(&serde_json::json!({"ok": true})))
    }
}

struct HealthStatusHandler;
#[async_trait]
impl Handler for HealthStatusHandler {
    async fn handle(&self, state: &AdminState, _body: Vec<u8>, _query: &str) -> ApiResult<Response<Vec<u8>>> {
        Ok(ResponseHelper::success_json(&state.health.snapshot_all()))
    }
}

struct HealthResetHandler;
#[async_trait]
impl Handler for HealthResetHandler {
    async fn handle(&self, state: &AdminState, _body: Vec<u8>, _query: &str) -> ApiResult<Response<Vec<u8>>> {
        state.health.reset();
        Ok(ResponseHelper::success_json(&serde_json::json!({"ok": true})))
    }
}

struct BannedIpsHandler;
#[async_trait]
impl Handler for BannedIpsHandler {
    async fn handle(&self, state: &AdminState, _body: Vec<u8>, _query: &str) -> ApiResult<Response<Vec<u8>>> {
        Ok(ResponseHelper::success_json(&state.bans.banned_ips()))
    }
}

struct BanHistoryHandler;
#[async_trait]
impl Handler for BanHistoryHandler {
    async fn handle(&self, state: &AdminState, _body: Vec<u8>, _query: &str) -> ApiResult<Response<Vec<u8>>> {
        Ok(ResponseHelper::success_json(&state.bans.history()))
    }
}

#[derive(Serialize)]
struct SecurityStats {
    active_bans: usize,
    history: usize,
}

struct SecurityStatsHandler;
#[async_trait]
impl Handler for SecurityStatsHandler {
    async fn handle(&self, state: &AdminState, _body: Vec<u8>, _query: &str) -> ApiResult<Response<Vec<u8>>> {
        let (active_bans, history) = state.bans.stats();
        Ok(ResponseHelper::success_json(&SecurityStats {
            active_bans,
            history,
        }))
    }
}

#[derive(Deserialize)]
struct UnbanBody {
    ip: String,
}

struct UnbanHandler;
#[async_trait]
impl Handler for UnbanHandler {
    async fn handle(&self, state: &AdminState, body: Vec<u8>, _query: &str) -> ApiResult<Response<Vec<u8>>> {
        let parsed: UnbanBody = serde_json::from_slice(&body)
            .map_err(|e| ApiError::InvalidRequest(format!("invalid body: {e}")))?;
        let unbanned = state
            .bans
            .unban(&parsed.ip)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(ResponseHelper::success_json(&serde_json::json!({"unbanned": unbanned})))
    }
}

struct CheckIpHandler;
#[async_trait]
impl Handler for CheckIpHandler {
    async fn handle(&self, state: &AdminState, _body: Vec<u8>, query: &str) -> ApiResult<Response<Vec<u8>>> {
        let ip = query_param(query, "ip")
            .ok_or_else(|| ApiError::InvalidRequest("missing ip query parameter".into()))?;
        let check = state.bans.check(&ip);
        Ok(ResponseHelper::success_json(&serde_json::json!({
            "banned": check.is_some(),
            "ban_end_time": check.as_ref().map(|c| c.ban_end_time),
            "remaining_seconds": check.as_ref().map(|c| c.remaining_seconds),
        })))
    }
}

struct PathStatsHandler;
#[async_trait]
impl Handler for PathStatsHandler {
    async fn handle(&self, state: &AdminState, _body: Vec<u8>, _query: &str) -> ApiResult<Response<Vec<u8>>> {
        Ok(ResponseHelper::success_json(
            &state.metrics.path_stats(&state.path_matcher),
        ))
    }
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k == key {
            Some(v.to_string())
        } else {
            None
        }
    })
}

type HttpHandler = Box<dyn Handler + Send + Sync>;

pub struct AdminHttpApp {
    state: AdminState,
    api_key: String,
    router: Router<HashMap<Method, HttpHandler>>,
}

impl AdminHttpApp {
    pub fn new(state: AdminState, api_key: String) -> Self {
        let mut this = Self {
            state,
            api_key,
            router: Router::new(),
        };

        this.route("/admin/api/cache/stats", Method::GET, Box::new(CacheStatsHandler));
        this.route("/admin/api/cache/enable", Method::POST, Box::new(CacheEnableHandler));
        this.route("/admin/api/cache/clear", Method::POST, Box::new(CacheClearHandler));
        this.route("/admin/api/cache/config", Method::POST, Box::new(CacheConfigHandler));
        this.route("/admin/api/health/status", Method::GET, Box::new(HealthStatusHandler));
        this.route("/admin/api/health/reset", Method::POST, Box::new(HealthResetHandler));
        this.route("/admin/api/security/banned-ips", Method::GET, Box::new(BannedIpsHandler));
        this.route("/admin/api/security/unban", Method::POST, Box::new(UnbanHandler));
        this.route("/admin/api/security/stats", Method::GET, Box::new(SecurityStatsHandler));
        this.route("/admin/api/security/check-ip", Method::GET, Box::new(CheckIpHandler));
        this.route("/admin/api/security/ban-history", Method::GET, Box::new(BanHistoryHandler));
        this.route("/admin/api/path-stats", Method::GET, Box::new(PathStatsHandler));

        this
    }

    fn route(&mut self, path: &str, method: Method, handler: HttpHandler) -> &mut Self {
        if self.router.at(path).is_err() {
            let mut handlers = HashMap::new();
            handlers.insert(method, handler);
            self.router
                .insert(path, handlers)
                .expect("route insertion should not fail");
        } else {
            let routes = self
                .router
                .at_mut(path)
                .expect("route should exist after check");
            routes.value.insert(method, handler);
        }
        self
    }

    pub fn admin_http_service(state: AdminState, api_key: String, address: &str) -> Service<Self> {
        let app = Self::new(state, api_key);
        let mut service = Service::new("Admin HTTP".to_string(), app);
        service.add_tcp(address);
        service
    }
}

#[async_trait]
impl ServeHttp for AdminHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);

        if validate_api_key(http_session, &self.api_key).is_err() {
            return ResponseHelper::error(StatusCode::FORBIDDEN, "invalid API key");
        }

        let (path, method, query) = {
            let req_header = http_session.req_header();
            (
                req_header.uri.path().to_string(),
                req_header.method.clone(),
                req_header.uri.query().unwrap_or("").to_string(),
            )
        };

        match self.router.at(&path) {
            Ok(Match { value, .. }) => match value.get(&method) {
                Some(handler) => {
                    let body = match read_request_body(http_session).await {
                        Ok(body) => body,
                        Err(e) => return ResponseHelper::error(StatusCode::BAD_REQUEST, &e.to_string()),
                    };
                    match handler.handle(&self.state, body, &query).await {
                        Ok(resp) => resp,
                        Err(e) => e.into_response(),
                    }
                }
                None => ResponseHelper::error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
            },
            Err(_) => ResponseHelper::error(StatusCode::NOT_FOUND, "not found"),
        }
    }
}

fn validate_api_key(http_session: &ServerSession, api_key: &str) -> Result<(), ()> {
    match http_session.get_header("x-api-key") {
        Some(key) if key.as_bytes() == api_key.as_bytes() => Ok(()),
        _ => Err(()),
    }
}

async fn read_request_body(http_session: &mut ServerSession) -> Result<Vec<u8>, ApiError> {
    let mut body_data = Vec::new();
    while let Some(bytes) = http_session
        .read_request_body()
        .await
        .map_err(|e| ApiError::Internal(format!("reading body: {e}")))?
    {
        body_data.extend_from_slice(&bytes);
    }
    Ok(body_data)
}
