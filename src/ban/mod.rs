//! Sliding-window 404-driven IP ban manager (SPEC_FULL.md §4.I, Property 10).

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::core::{ProxyError, ProxyResult};

const WINDOW_MINUTES: i64 = 5;
const ERROR_THRESHOLD: u64 = 10;
const BAN_DURATION_MINUTES: i64 = 5;
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanRecord {
    pub ip: String,
    pub ban_time: i64,
    pub ban_end_time: i64,
    pub reason: String,
    pub error_count: u64,
    pub is_active: bool,
    #[serde(default)]
    pub unban_time: Option<i64>,
    #[serde(default)]
    pub unban_reason: Option<String>,
}

struct ErrorWindow {
    count: u64,
    first_time: i64,
    last_time: i64,
}

#[derive(Serialize, Deserialize)]
struct BanFile {
    active_bans: HashMap<String, BanRecord>,
    history: Vec<BanRecord>,
    last_update: i64,
}

pub struct BanCheck {
    pub ban_end_time: i64,
    pub remaining_seconds: i64,
}

/// Records 404s per client IP in a sliding window and bans IPs that cross
/// `ERROR_THRESHOLD` within `WINDOW_MINUTES`.
pub struct BanManager {
    path: PathBuf,
    errors: DashMap<String, ErrorWindow>,
    active_bans: DashMap<String, BanRecord>,
    history: Mutex<Vec<BanRecord>>,
}

impl BanManager {
    pub fn load_or_init<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        let (active_bans, history) = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<BanFile>(&raw) {
                Ok(file) => {
                    let active = DashMap::new();
                    for (ip, record) in file.active_bans {
                        active.insert(ip, record);
                    }
                    (active, file.history)
                }
                Err(e) => {
                    log::warn!("ban: failed to parse ban file, starting empty: {e}");
                    (DashMap::new(), Vec::new())
                }
            },
            Err(_) => (DashMap::new(), Vec::new()),
        };

        Self {
            path,
            errors: DashMap::new(),
            active_bans,
            history: Mutex::new(history),
        }
    }

    /// Records an observed 404 against `ip`; bans it if the sliding
    /// window's error count reaches `ERROR_THRESHOLD` (Property 10).
    pub fn record_error(&self, ip: &str) {
        let now = now();
        let should_ban = {
            let mut entry = self
                .errors
                .entry(ip.to_string())
                .or_insert_with(|| ErrorWindow {
                    count: 0,
                    first_time: now,
                    last_time: now,
                });

            if now - entry.first_time > WINDOW_MINUTES * 60 {
                entry.count = 1;
                entry.first_time = now;
            } else {
                entry.count += 1;
            }
            entry.last_time = now;
            entry.count >= ERROR_THRESHOLD
        };

        if should_ban {
            let count = self.errors.get(ip).map(|e| e.count).unwrap_or(ERROR_THRESHOLD);
            self.ban(ip, "404 error threshold exceeded", count);
        }
    }

    fn ban(&self, ip: &str, reason: &str, error_count: u64) {
        let now = now();
        let record = BanRecord {
            ip: ip.to_string(),
            ban_time: now,
            ban_end_time: now + BAN_DURATION_MINUTES * 60,
            reason: reason.to_string(),
            error_count,
            is_active: true,
            unban_time: None,
            unban_reason: None,
        };
        self.active_bans.insert(ip.to_string(), record);
        if let Err(e) = self.persist() {
            log::warn!("ban: failed to persist after ban: {e}");
        }
    }

    /// Returns ban details if `ip` is currently banned.
    pub fn check(&self, ip: &str) -> Option<BanCheck> {
        let record = self.active_bans.get(ip)?;
        let now = now();
        if record.ban_end_time <= now {
            return None;
        }
        Some(BanCheck {
            ban_end_time: record.ban_end_time,
            remaining_seconds: record.ban_end_time - now,
        })
    }

    pub fn unban(&self, ip: &str) -> ProxyResult<bool> {
        self.unban_with_reason(ip, "manual")
    }

    fn unban_with_reason(&self, ip: &str, reason: &str) -> ProxyResult<bool> {
        if let Some((_, mut record)) = self.active_bans.remove(ip) {
            record.is_active = false;
            record.unban_time = Some(now());
            record.unban_reason = Some(reason.to_string());
            self.history.lock().unwrap().push(record);
            self.persist()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Removes bans whose `ban_end_time` has passed, archiving them into
    /// history with `unban_reason = "auto-expired"`.
    pub fn sweep_expired(&self) {
        let now = now();
        let expired: Vec<String> = self
            .active_bans
            .iter()
            .filter(|e| e.value().ban_end_time <= now)
            .map(|e| e.key().clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        for ip in &expired {
            let _ = self.unban_with_reason(ip, "auto-expired");
        }
    }

    pub fn banned_ips(&self) -> Vec<BanRecord> {
        self.active_bans.iter().map(|e| e.value().clone()).collect()
    }

    pub fn history(&self) -> Vec<BanRecord> {
        self.history.lock().unwrap().clone()
    }

    pub fn stats(&self) -> (usize, usize) {
        (self.active_bans.len(), self.history.lock().unwrap().len())
    }

    /// Ban persistence is fail-open: a write error is logged, never fatal
    /// (SPEC_FULL.md §7).
    fn persist(&self) -> ProxyResult<()> {
        let file = BanFile {
            active_bans: self
                .active_bans
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            history: self.history.lock().unwrap().clone(),
            last_update: now(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| ProxyError::Configuration(format!("serializing ban file: {e}")))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn spawn_sweeper(
        self: std::sync::Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        self.sweep_expired();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_triggers_ban() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BanManager::load_or_init(dir.path().join("bans.json"));
        for _ in 0..ERROR_THRESHOLD {
            manager.record_error("1.2.3.4");
        }
        assert!(manager.check("1.2.3.4").is_some());
    }

    #[test]
    fn below_threshold_stays_unbanned() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BanManager::load_or_init(dir.path().join("bans.json"));
        for _ in 0..ERROR_THRESHOLD - 1 {
            manager.record_error("1.2.3.4");
        }
        assert!(manager.check("1.2.3.4").is_none());
    }

    #[test]
    fn manual_unban_moves_to_history() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BanManager::load_or_init(dir.path().join("bans.json"));
        for _ in 0..ERROR_THRESHOLD {
            manager.record_error("1.2.3.4");
        }
        assert!(manager.unban("1.2.3.4").unwrap());
        assert!(manager.check("1.2.3.4").is_none());
        let history = manager.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].unban_reason.as_deref(), Some("manual"));
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bans.json");
        {
            let manager = BanManager::load_or_init(&path);
            for _ in 0..ERROR_THRESHOLD {
                manager.record_error("5.6.7.8");
            }
        }
        let reloaded = BanManager::load_or_init(&path);
        assert!(reloaded.check("5.6.7.8").is_some());
    }
}
