//! Path matching and rule selection (SPEC_FULL.md §4.A, §4.B, §4.D).

pub mod matcher_cache;
pub mod path;
pub mod rule;

pub use matcher_cache::ExtensionMatcherCache;
pub use path::{MatchedPath, PathMatcher};
pub use rule::{ExtensionRule, RuleEngine, SelectedRule};
