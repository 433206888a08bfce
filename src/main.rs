use std::sync::Arc;

use pingora::server::{configuration::Opt, Server};
use pingora::services::listening::Service as ListeningService;

use mirrorgate::{
    admin::{AdminHttpApp, AdminState},
    ban::BanManager,
    cache::CacheManager,
    config::ConfigHandle,
    health::HealthChecker,
    logging::Logger,
    matcher::PathMatcher,
    metrics::MetricsCollector,
    probe::ProbeCache,
    service::{
        background::{BanSweeperService, CacheCleanupService, CacheSweepersService, HealthActiveCheckService},
        HttpService,
    },
};

fn main() {
    let opt = Opt::parse_args();

    let config = Arc::new(
        ConfigHandle::load_or_init("data/config.json").expect("failed to load configuration"),
    );

    let logger = Logger::new(config.current().log.clone());
    logger.init_env_logger();
    log::info!("mirrorgate starting up");

    let proxy_cache =
        CacheManager::new("data/cache/proxy", config.current().cache).expect("failed to init proxy cache");
    let mirror_cache =
        CacheManager::new("data/cache/mirror", config.current().cache).expect("failed to init mirror cache");
    let probe = Arc::new(ProbeCache::new());
    let health = HealthChecker::new();
    let bans = Arc::new(BanManager::load_or_init("data/bans.json"));
    let metrics = MetricsCollector::new();
    let path_matcher = Arc::new(PathMatcher::compile(&config.current().map));

    let admin_config = config
        .current()
        .admin
        .clone()
        .expect("Admin.address and Admin.api_key must be configured");

    let http_service = HttpService::new(
        config.clone(),
        probe.clone(),
        proxy_cache.clone(),
        mirror_cache.clone(),
        health.clone(),
        bans.clone(),
        metrics.clone(),
    );
    let matcher_cache_handle = http_service.matcher_cache_handle();

    let admin_state = AdminState {
        proxy_cache: proxy_cache.clone(),
        mirror_cache: mirror_cache.clone(),
        health: health.clone(),
        bans: bans.clone(),
        metrics: metrics.clone(),
        path_matcher,
    };

    let mut server = Server::new(Some(opt)).expect("failed to create pingora server");
    server.bootstrap();

    let mut gateway_service = ListeningService::new("HTTP Gateway".to_string(), http_service);
    gateway_service.add_tcp(&config.current().listen);
    server.add_service(gateway_service);

    let admin_service =
        AdminHttpApp::admin_http_service(admin_state, admin_config.api_key, &admin_config.address);
    server.add_service(admin_service);

    server.add_service(logger);
    server.add_service(CacheCleanupService::new(proxy_cache, "proxy cache cleanup"));
    server.add_service(CacheCleanupService::new(mirror_cache, "mirror cache cleanup"));
    server.add_service(BanSweeperService::new(bans));
    server.add_service(HealthActiveCheckService::new(health));
    server.add_service(CacheSweepersService::new(probe, matcher_cache_handle));

    log::info!("mirrorgate listening on {}", config.current().listen);
    server.run_forever();
}
