//! Non-blocking request metrics (SPEC_FULL.md §4.K).
//!
//! Request completion is teed onto a buffered channel; a single updater
//! task owns all aggregate state so the hot path never blocks on a lock
//! beyond the bounded channel send.

use std::{
    collections::{HashMap, VecDeque},
    sync::atomic::{AtomicU64, Ordering},
    sync::Mutex,
};

use serde::Serialize;
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 4096;
const RECENT_CAPACITY: usize = 200;
const TOP_N: usize = 20;
const LATENCY_BUCKETS_MS: [f64; 6] = [10.0, 50.0, 100.0, 250.0, 500.0, 1000.0];

#[derive(Debug, Clone)]
pub struct RequestMetric {
    pub path: String,
    pub referer: Option<String>,
    pub status: u16,
    pub latency_ms: f64,
    pub cache_hit: bool,
    pub timestamp: i64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct PathMetrics {
    pub prefix: String,
    pub count: u64,
    pub avg_latency_ms: f64,
}

#[derive(Default)]
struct PathAccum {
    count: u64,
    total_latency_ms: f64,
}

struct MetricsState {
    total_requests: u64,
    status_counts: HashMap<u16, u64>,
    path_counts: HashMap<String, PathAccum>,
    referer_counts: HashMap<String, u64>,
    recent: VecDeque<RequestMetric>,
    latency_buckets: [u64; LATENCY_BUCKETS_MS.len() + 1],
}

impl MetricsState {
    fn new() -> Self {
        Self {
            total_requests: 0,
            status_counts: HashMap::new(),
            path_counts: HashMap::new(),
            referer_counts: HashMap::new(),
            recent: VecDeque::with_capacity(RECENT_CAPACITY),
            latency_buckets: [0; LATENCY_BUCKETS_MS.len() + 1],
        }
    }

    fn record(&mut self, metric: RequestMetric) {
        self.total_requests += 1;
        *self.status_counts.entry(metric.status).or_insert(0) += 1;

        let accum = self.path_counts.entry(metric.path.clone()).or_default();
        accum.count += 1;
        accum.total_latency_ms += metric.latency_ms;

        if let Some(referer) = &metric.referer {
            *self.referer_counts.entry(referer.clone()).or_insert(0) += 1;
        }

        let bucket = LATENCY_BUCKETS_MS
            .iter()
            .position(|&b| metric.latency_ms <= b)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.latency_buckets[bucket] += 1;

        if self.recent.len() >= RECENT_CAPACITY {
            self.recent.pop_front();
        }
        self.recent.push_back(metric);
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub active_requests: u64,
    pub total_requests: u64,
    pub status_counts: HashMap<u16, u64>,
    pub top_paths: Vec<(String, u64)>,
    pub top_referers: Vec<(String, u64)>,
    pub latency_buckets_ms: Vec<(f64, u64)>,
}

pub struct MetricsCollector {
    active_requests: AtomicU64,
    sender: mpsc::Sender<RequestMetric>,
    state: std::sync::Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> std::sync::Arc<Self> {
        let (sender, mut receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let state = std::sync::Arc::new(Mutex::new(MetricsState::new()));
        let updater_state = state.clone();
        tokio::spawn(async move {
            while let Some(metric) = receiver.recv().await {
                updater_state.lock().unwrap().record(metric);
            }
        });

        std::sync::Arc::new(Self {
            active_requests: AtomicU64::new(0),
            sender,
            state,
        })
    }

    pub fn request_started(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Ends the in-flight gauge and enqueues the completed metric.
    /// Saturated submissions are dropped rather than blocking the
    /// request path (SPEC_FULL.md §5 worker-pool degradation policy).
    pub fn request_finished(&self, metric: RequestMetric) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
        if self.sender.try_send(metric).is_err() {
            log::debug!("metrics: channel saturated, dropping sample");
        }
    }

    pub fn active_requests(&self) -> u64 {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock().unwrap();

        let mut top_paths: Vec<(String, u64)> = state
            .path_counts
            .iter()
            .map(|(path, accum)| (path.clone(), accum.count))
            .collect();
        top_paths.sort_by(|a, b| b.1.cmp(&a.1));
        top_paths.truncate(TOP_N);

        let mut top_referers: Vec<(String, u64)> =
            state.referer_counts.clone().into_iter().collect();
        top_referers.sort_by(|a, b| b.1.cmp(&a.1));
        top_referers.truncate(TOP_N);

        let mut latency_buckets_ms: Vec<(f64, u64)> = LATENCY_BUCKETS_MS
            .iter()
            .enumerate()
            .map(|(i, &b)| (b, state.latency_buckets[i]))
            .collect();
        latency_buckets_ms.push((f64::INFINITY, state.latency_buckets[LATENCY_BUCKETS_MS.len()]));

        MetricsSnapshot {
            active_requests: self.active_requests(),
            total_requests: state.total_requests,
            status_counts: state.status_counts.clone(),
            top_paths,
            top_referers,
            latency_buckets_ms,
        }
    }

    /// Aggregated per-path metrics by longest-matching configured prefix
    /// (`/admin/api/path-stats`).
    pub fn path_stats(&self, matcher: &crate::matcher::PathMatcher) -> Vec<PathMetrics> {
        let state = self.state.lock().unwrap();
        let mut by_prefix: HashMap<String, PathAccum> = HashMap::new();

        for (path, accum) in &state.path_counts {
            let prefix = matcher
                .match_path(path)
                .map(|m| m.prefix)
                .unwrap_or_else(|| "(unmatched)".to_string());
            let entry = by_prefix.entry(prefix).or_default();
            entry.count += accum.count;
            entry.total_latency_ms += accum.total_latency_ms;
        }

        by_prefix
            .into_iter()
            .map(|(prefix, accum)| PathMetrics {
                prefix,
                count: accum.count,
                avg_latency_ms: if accum.count > 0 {
                    accum.total_latency_ms / accum.count as f64
                } else {
                    0.0
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_flow_through_channel() {
        let collector = MetricsCollector::new();
        collector.request_started();
        collector.request_finished(RequestMetric {
            path: "/a".to_string(),
            referer: None,
            status: 200,
            latency_ms: 12.0,
            cache_hit: true,
            timestamp: 0,
        });
        // Allow the updater task to drain the channel.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let snap = collector.snapshot();
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.active_requests, 0);
        assert_eq!(snap.status_counts.get(&200), Some(&1));
    }
}
