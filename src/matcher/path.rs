//! Longest-prefix path matching (SPEC_FULL.md §4.A, Property 1).

use std::{collections::HashMap, sync::Arc};

use matchit::Router;

use crate::config::PathConfig;

pub struct MatchedPath {
    pub prefix: String,
    pub config: Arc<PathConfig>,
    pub remainder: String,
}

/// Compiled once per configuration generation. Each prefix is inserted
/// both as an exact route and as a `{*rest}` catch-all under it; matchit's
/// radix trie resolves overlapping prefixes by preferring the longest
/// static match, so e.g. `/static/images/{*rest}` wins over
/// `/static/{*rest}` for `/static/images/a.png` without any manual sort.
pub struct PathMatcher {
    router: Router<(String, Arc<PathConfig>)>,
}

impl PathMatcher {
    pub fn compile(map: &HashMap<String, PathConfig>) -> Self {
        let mut router = Router::new();
        for (prefix, config) in map {
            let trimmed = prefix.trim_end_matches('/');
            let config = Arc::new(config.clone());

            let exact_path = if trimmed.is_empty() { "/" } else { trimmed };
            if let Err(e) = router.insert(exact_path, (prefix.clone(), config.clone())) {
                log::warn!("matcher: skipping duplicate path prefix {prefix:?}: {e}");
                continue;
            }

            let wildcard_path = format!("{trimmed}/{{*rest}}");
            if let Err(e) = router.insert(wildcard_path, (prefix.clone(), config)) {
                log::warn!("matcher: skipping duplicate path prefix {prefix:?}: {e}");
            }
        }
        Self { router }
    }

    /// Returns the longest configured prefix such that `path == prefix`
    /// or `path` starts with `prefix + "/"`.
    pub fn match_path(&self, path: &str) -> Option<MatchedPath> {
        let matched = self.router.at(path).ok()?;
        let (prefix, config) = matched.value.clone();
        let remainder = match matched.params.get("rest") {
            Some(rest) => format!("/{rest}"),
            None => "/".to_string(),
        };
        Some(MatchedPath {
            prefix,
            config,
            remainder,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathConfig;

    fn config() -> PathConfig {
        PathConfig {
            default_target: "https://origin.example".to_string(),
            redirect_mode: false,
            extension_map: vec![],
            enabled: true,
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let mut map = HashMap::new();
        map.insert("/static".to_string(), config());
        map.insert("/static/images".to_string(), config());

        let matcher = PathMatcher::compile(&map);
        let m = matcher.match_path("/static/images/a.png").unwrap();
        assert_eq!(m.prefix, "/static/images");
        assert_eq!(m.remainder, "/a.png");
    }

    #[test]
    fn exact_prefix_matches() {
        let mut map = HashMap::new();
        map.insert("/static".to_string(), config());
        let matcher = PathMatcher::compile(&map);
        let m = matcher.match_path("/static").unwrap();
        assert_eq!(m.remainder, "/");
    }

    #[test]
    fn no_match_returns_none() {
        let mut map = HashMap::new();
        map.insert("/static".to_string(), config());
        let matcher = PathMatcher::compile(&map);
        assert!(matcher.match_path("/other/a.png").is_none());
    }

    #[test]
    fn sibling_prefix_is_not_a_false_match() {
        let mut map = HashMap::new();
        map.insert("/static".to_string(), config());
        let matcher = PathMatcher::compile(&map);
        assert!(matcher.match_path("/staticfiles/a.png").is_none());
    }
}
