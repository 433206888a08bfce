//! Thin `pingora::services::Service` adapters so each module's own
//! ticker (cache cleanup, probe/matcher-cache sweeps, health active
//! checks, ban sweeps) is driven by a pingora-managed thread/runtime
//! the same way the teacher drives its `Logger`.

use std::sync::Arc;

use async_trait::async_trait;
use pingora::{
    server::{ListenFds, ShutdownWatch},
    services::Service,
};

use crate::ban::BanManager;
use crate::cache::CacheManager;
use crate::health::HealthChecker;
use crate::matcher::ExtensionMatcherCache;
use crate::probe::ProbeCache;

pub struct CacheCleanupService {
    cache: Arc<CacheManager>,
    label: &'static str,
}

impl CacheCleanupService {
    pub fn new(cache: Arc<CacheManager>, label: &'static str) -> Self {
        Self { cache, label }
    }
}

#[async_trait]
impl Service for CacheCleanupService {
    async fn start_service(&mut self, _fds: Option<ListenFds>, shutdown: ShutdownWatch) {
        let handle = self.cache.clone().spawn_cleanup_task(shutdown);
        let _ = handle.await;
    }

    fn name(&self) -> &'static str {
        self.label
    }

    fn threads(&self) -> Option<usize> {
        Some(1)
    }
}

pub struct BanSweeperService {
    bans: Arc<BanManager>,
}

impl BanSweeperService {
    pub fn new(bans: Arc<BanManager>) -> Self {
        Self { bans }
    }
}

#[async_trait]
impl Service for BanSweeperService {
    async fn start_service(&mut self, _fds: Option<ListenFds>, shutdown: ShutdownWatch) {
        let handle = self.bans.clone().spawn_sweeper(shutdown);
        let _ = handle.await;
    }

    fn name(&self) -> &'static str {
        "ban sweeper"
    }

    fn threads(&self) -> Option<usize> {
        Some(1)
    }
}

pub struct HealthActiveCheckService {
    health: Arc<HealthChecker>,
}

impl HealthActiveCheckService {
    pub fn new(health: Arc<HealthChecker>) -> Self {
        Self { health }
    }
}

#[async_trait]
impl Service for HealthActiveCheckService {
    async fn start_service(&mut self, _fds: Option<ListenFds>, shutdown: ShutdownWatch) {
        let handle = self.health.clone().spawn_active_checker(shutdown);
        let _ = handle.await;
    }

    fn name(&self) -> &'static str {
        "health active checker"
    }

    fn threads(&self) -> Option<usize> {
        Some(1)
    }
}

/// Drives the probe and extension-matcher sweepers, neither of which
/// holds durable state worth flushing on shutdown, so this service exits
/// as soon as a shutdown signal arrives rather than waiting on them.
pub struct CacheSweepersService {
    probe: Arc<ProbeCache>,
    matcher_cache: Arc<ExtensionMatcherCache>,
}

impl CacheSweepersService {
    pub fn new(probe: Arc<ProbeCache>, matcher_cache: Arc<ExtensionMatcherCache>) -> Self {
        Self {
            probe,
            matcher_cache,
        }
    }
}

#[async_trait]
impl Service for CacheSweepersService {
    async fn start_service(&mut self, _fds: Option<ListenFds>, mut shutdown: ShutdownWatch) {
        let _probe_handle = self.probe.clone().spawn_sweeper();
        let _matcher_handle = self.matcher_cache.clone().spawn_sweeper();
        let _ = shutdown.changed().await;
    }

    fn name(&self) -> &'static str {
        "probe/matcher sweepers"
    }

    fn threads(&self) -> Option<usize> {
        Some(1)
    }
}
