//! Passive + active upstream health tracking (SPEC_FULL.md §4.H, Property 12).

use std::{
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use dashmap::DashMap;
use reqwest::Client;
use serde::Serialize;

const SUCCESS_THRESHOLD: u64 = 2;
const FAIL_THRESHOLD: u64 = 3;
const UNHEALTHY_DURATION: Duration = Duration::from_secs(5 * 60);
const ACTIVE_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const ACTIVE_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

pub struct TargetHealth {
    pub url: String,
    is_healthy: AtomicBool,
    last_check: AtomicI64,
    last_success: AtomicI64,
    fail_count: AtomicU64,
    success_count: AtomicU64,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    avg_latency_ms: Mutex<f64>,
    last_error: Mutex<Option<String>>,
}

#[derive(Debug, Serialize)]
pub struct TargetHealthSnapshot {
    pub url: String,
    pub is_healthy: bool,
    pub last_check: i64,
    pub last_success: i64,
    pub fail_count: u64,
    pub success_count: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub avg_latency_ms: f64,
    pub last_error: Option<String>,
}

impl TargetHealth {
    fn new(url: String) -> Self {
        Self {
            url,
            is_healthy: AtomicBool::new(true),
            last_check: AtomicI64::new(0),
            last_success: AtomicI64::new(0),
            fail_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            avg_latency_ms: Mutex::new(0.0),
            last_error: Mutex::new(None),
        }
    }

    fn record_latency(&self, sample_ms: f64) {
        let mut avg = self.avg_latency_ms.lock().unwrap();
        *avg = (*avg * 9.0 + sample_ms) / 10.0;
    }

    fn snapshot(&self) -> TargetHealthSnapshot {
        TargetHealthSnapshot {
            url: self.url.clone(),
            is_healthy: self.is_healthy.load(Ordering::Relaxed),
            last_check: self.last_check.load(Ordering::Relaxed),
            last_success: self.last_success.load(Ordering::Relaxed),
            fail_count: self.fail_count.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            avg_latency_ms: *self.avg_latency_ms.lock().unwrap(),
            last_error: self.last_error.lock().unwrap().clone(),
        }
    }
}

/// Tracks liveness for every upstream URL seen by the Forwarder, plus an
/// active HEAD-probe ticker for unhealthy/stale targets.
pub struct HealthChecker {
    targets: DashMap<String, Arc<TargetHealth>>,
    client: Client,
}

impl HealthChecker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            targets: DashMap::new(),
            client: Client::builder().build().unwrap_or_else(|_| Client::new()),
        })
    }

    fn entry(&self, url: &str) -> Arc<TargetHealth> {
        self.targets
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(TargetHealth::new(url.to_string())))
            .clone()
    }

    /// Unknown URLs default to healthy so first traffic can bootstrap.
    pub fn is_healthy(&self, url: &str) -> bool {
        self.targets
            .get(url)
            .map(|t| t.is_healthy.load(Ordering::Relaxed))
            .unwrap_or(true)
    }

    pub fn record_success(&self, url: &str, latency: Duration) {
        let target = self.entry(url);
        target.total_requests.fetch_add(1, Ordering::Relaxed);
        target.success_count.fetch_add(1, Ordering::Relaxed);
        target.fail_count.store(0, Ordering::Relaxed);
        target.record_latency(latency.as_secs_f64() * 1000.0);
        target.last_success.store(now_secs(), Ordering::Relaxed);
        if target.success_count.load(Ordering::Relaxed) >= SUCCESS_THRESHOLD {
            target.is_healthy.store(true, Ordering::Relaxed);
        }
    }

    pub fn record_failure(&self, url: &str, error: &str) {
        let target = self.entry(url);
        target.total_requests.fetch_add(1, Ordering::Relaxed);
        target.failed_requests.fetch_add(1, Ordering::Relaxed);
        target.fail_count.fetch_add(1, Ordering::Relaxed);
        target.success_count.store(0, Ordering::Relaxed);
        *target.last_error.lock().unwrap() = Some(error.to_string());
        if target.fail_count.load(Ordering::Relaxed) >= FAIL_THRESHOLD {
            target.is_healthy.store(false, Ordering::Relaxed);
        }
    }

    pub fn snapshot_all(&self) -> Vec<TargetHealthSnapshot> {
        self.targets.iter().map(|e| e.value().snapshot()).collect()
    }

    pub fn reset(&self) {
        self.targets.clear();
    }

    async fn active_check_one(&self, target: Arc<TargetHealth>) {
        let started = std::time::Instant::now();
        let result = self
            .client
            .head(&target.url)
            .timeout(ACTIVE_CHECK_TIMEOUT)
            .send()
            .await;

        target.last_check.store(now_secs(), Ordering::Relaxed);
        match result {
            Ok(resp) if (200..400).contains(&(resp.status().as_u16())) => {
                self.record_success(&target.url, started.elapsed());
            }
            Ok(resp) => {
                self.record_failure(&target.url, &format!("status {}", resp.status()));
            }
            Err(e) => {
                self.record_failure(&target.url, &e.to_string());
            }
        }
    }

    /// One active-check sweep: HEADs every tracked URL that is unhealthy
    /// or hasn't been checked recently. Targets unhealthy for longer than
    /// `UNHEALTHY_DURATION` without a check get one optimistic retry.
    pub async fn run_active_checks(self: &Arc<Self>) {
        let now = now_secs();
        let due: Vec<Arc<TargetHealth>> = self
            .targets
            .iter()
            .filter(|e| {
                let t = e.value();
                let stale = now - t.last_check.load(Ordering::Relaxed)
                    > ACTIVE_CHECK_INTERVAL.as_secs() as i64;
                let unhealthy = !t.is_healthy.load(Ordering::Relaxed);
                let long_unchecked = now - t.last_check.load(Ordering::Relaxed)
                    > UNHEALTHY_DURATION.as_secs() as i64;
                (unhealthy && (stale || long_unchecked)) || (!unhealthy && stale)
            })
            .map(|e| e.value().clone())
            .collect();

        for target in due {
            self.active_check_one(target).await;
        }
    }

    pub fn spawn_active_checker(
        self: Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ACTIVE_CHECK_INTERVAL);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        self.run_active_checks().await;
                    }
                }
            }
        })
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self {
            targets: DashMap::new(),
            client: Client::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_url_defaults_healthy() {
        let hc = HealthChecker::new();
        assert!(hc.is_healthy("https://unseen.example"));
    }

    #[test]
    fn fail_threshold_marks_unhealthy_then_recovers() {
        let hc = HealthChecker::new();
        let url = "https://origin.example";
        for _ in 0..FAIL_THRESHOLD {
            hc.record_failure(url, "boom");
        }
        assert!(!hc.is_healthy(url));

        for _ in 0..SUCCESS_THRESHOLD {
            hc.record_success(url, Duration::from_millis(10));
        }
        assert!(hc.is_healthy(url));
    }

    #[test]
    fn ema_latency_weights_recent_sample() {
        let hc = HealthChecker::new();
        let url = "https://origin.example";
        hc.record_success(url, Duration::from_millis(100));
        hc.record_success(url, Duration::from_millis(100));
        let snap = hc.snapshot_all().into_iter().find(|s| s.url == url).unwrap();
        assert!((snap.avg_latency_ms - 19.0).abs() < 0.01);
    }
}
