//! Extension rule compilation and selection (SPEC_FULL.md §4.B, §3 Invariants).

use std::collections::HashSet;

use sha2::{Digest, Sha256};

use crate::config::ExtensionRuleConfig;
use crate::matcher::matcher_cache::ExtensionMatcherCache;
use crate::probe::ProbeCache;

const WILDCARD: &str = "*";

/// Normalized, immutable extension rule. `size_threshold`/`max_size` are
/// resolved to a concrete `[lo, hi]` byte range (§3 invariant ii).
#[derive(Debug, Clone)]
pub struct ExtensionRule {
    pub extensions: HashSet<String>,
    pub target: String,
    pub size_threshold: u64,
    pub max_size: u64,
    pub domains: Vec<String>,
    pub redirect_mode: bool,
}

impl ExtensionRule {
    fn is_wildcard(&self) -> bool {
        self.extensions.contains(WILDCARD)
    }

    fn in_range(&self, size: u64) -> bool {
        size >= self.size_threshold && size <= self.max_size
    }

    fn host_allowed(&self, host: &str) -> bool {
        if self.domains.is_empty() {
            return true;
        }
        let host = host.to_ascii_lowercase();
        self.domains.iter().any(|d| d == &host)
    }
}

/// Compiles raw config rules into the normalized, pre-sorted runtime form
/// (§3 invariants i-ii) and returns a hash of the input for cache-busting.
pub fn compile_rules(raw: &[ExtensionRuleConfig]) -> (Vec<ExtensionRule>, String) {
    let mut rules: Vec<ExtensionRule> = raw
        .iter()
        .map(|r| {
            let extensions = r
                .extensions
                .split(',')
                .map(|e| e.trim().to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect::<HashSet<String>>();
            let domains = r
                .domains
                .split(',')
                .map(|d| d.trim().to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect::<Vec<String>>();
            ExtensionRule {
                extensions,
                target: r.target.clone(),
                size_threshold: r.size_threshold.max(0) as u64,
                max_size: if r.max_size <= 0 {
                    u64::MAX
                } else {
                    r.max_size as u64
                },
                domains,
                redirect_mode: r.redirect_mode,
            }
        })
        .collect();

    rules.sort_by(|a, b| {
        a.size_threshold
            .cmp(&b.size_threshold)
            .then_with(|| b.max_size.cmp(&a.max_size))
    });

    let mut hasher = Sha256::new();
    for r in raw {
        hasher.update(r.extensions.as_bytes());
        hasher.update(r.target.as_bytes());
        hasher.update(r.size_threshold.to_le_bytes());
        hasher.update(r.max_size.to_le_bytes());
        hasher.update(r.domains.as_bytes());
        hasher.update([r.redirect_mode as u8]);
    }
    let hash = format!("{:x}", hasher.finalize());

    (rules, hash)
}

pub fn extension_of(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() => ext.to_ascii_lowercase(),
        _ => String::new(),
    }
}

fn strip_port(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

pub struct SelectedRule {
    pub rule: ExtensionRule,
    pub used_alt: bool,
}

/// Selects the best `ExtensionRule` for a request (SPEC_FULL.md §4.B).
pub struct RuleEngine {
    matcher_cache: std::sync::Arc<ExtensionMatcherCache>,
    probe: std::sync::Arc<ProbeCache>,
}

impl RuleEngine {
    pub fn new(probe: std::sync::Arc<ProbeCache>) -> Self {
        Self {
            matcher_cache: std::sync::Arc::new(ExtensionMatcherCache::new()),
            probe,
        }
    }

    pub fn matcher_cache(&self) -> &ExtensionMatcherCache {
        &self.matcher_cache
    }

    /// A handle background tasks can sweep independently of request flow.
    pub fn matcher_cache_handle(&self) -> std::sync::Arc<ExtensionMatcherCache> {
        self.matcher_cache.clone()
    }

    /// `path_id` identifies the owning `PathConfig` (its prefix) so the
    /// Extension-Matcher Cache (4.D) can memoize per-prefix.
    pub async fn select_rule(
        &self,
        path_id: &str,
        rules: &[ExtensionRuleConfig],
        default_target: &str,
        target_path: &str,
        host: &str,
    ) -> Option<SelectedRule> {
        let compiled = self.matcher_cache.get_or_compile(path_id, rules);
        let ext = extension_of(target_path);
        let host = strip_port(host);

        let mut candidates: Vec<&ExtensionRule> = compiled
            .rules
            .iter()
            .filter(|r| r.extensions.contains(&ext))
            .collect();
        let used_alt = candidates.is_empty();
        if used_alt {
            candidates = compiled.rules.iter().filter(|r| r.is_wildcard()).collect();
        }
        candidates.retain(|r| r.host_allowed(host));
        if candidates.is_empty() {
            return None;
        }

        let probe_url = format!("{}{}", default_target.trim_end_matches('/'), target_path);
        let size = self.probe.size(&probe_url).await?;

        for rule in candidates {
            if !rule.in_range(size) {
                continue;
            }
            let target_url = format!("{}{}", rule.target.trim_end_matches('/'), target_path);
            if self.probe.reachable(&target_url).await {
                return Some(SelectedRule {
                    rule: rule.clone(),
                    used_alt,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_cfg(ext: &str, target: &str, lo: i64, hi: i64) -> ExtensionRuleConfig {
        ExtensionRuleConfig {
            extensions: ext.to_string(),
            target: target.to_string(),
            size_threshold: lo,
            max_size: hi,
            redirect_mode: false,
            domains: String::new(),
        }
    }

    #[test]
    fn zero_max_size_means_infinity() {
        let (rules, _) = compile_rules(&[rule_cfg("jpg", "https://a", 0, 0)]);
        assert_eq!(rules[0].max_size, u64::MAX);
    }

    #[test]
    fn negative_threshold_clamps_to_zero() {
        let (rules, _) = compile_rules(&[rule_cfg("jpg", "https://a", -5, 100)]);
        assert_eq!(rules[0].size_threshold, 0);
    }

    #[test]
    fn rules_sort_by_threshold_then_max_size_desc() {
        let (rules, _) = compile_rules(&[
            rule_cfg("jpg", "https://b", 100, 200),
            rule_cfg("jpg", "https://a", 0, 500),
            rule_cfg("jpg", "https://c", 0, 100),
        ]);
        assert_eq!(rules[0].target, "https://a");
        assert_eq!(rules[1].target, "https://c");
        assert_eq!(rules[2].target, "https://b");
    }

    #[test]
    fn extension_is_lowercased_from_last_segment() {
        assert_eq!(extension_of("/a/b/PHOTO.JPG"), "jpg");
        assert_eq!(extension_of("/a/b/noext"), "");
    }

    #[test]
    fn hash_changes_when_rules_change() {
        let (_, h1) = compile_rules(&[rule_cfg("jpg", "https://a", 0, 100)]);
        let (_, h2) = compile_rules(&[rule_cfg("jpg", "https://a", 0, 200)]);
        assert_ne!(h1, h2);
    }
}
