//! Redirect Decider (SPEC_FULL.md §4.F): 302-vs-proxy decision and
//! target URL construction.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::config::PathConfig;
use crate::matcher::SelectedRule;

const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'#')
    .add(b'?')
    .add(b'{')
    .add(b'}')
    .add(b'%');

pub struct RedirectDecision {
    pub should_redirect: bool,
    pub target_url: String,
}

/// Decodes each path segment, then re-encodes it for safe transport,
/// preserving segment boundaries (SPEC_FULL.md §4.F).
pub fn build_target_url(base: &str, target_path: &str, raw_query: &str) -> String {
    let rebuilt = target_path
        .split('/')
        .map(|segment| {
            let decoded = percent_decode_str(segment).decode_utf8_lossy();
            utf8_percent_encode(&decoded, PATH_SEGMENT).to_string()
        })
        .collect::<Vec<_>>()
        .join("/");

    let mut url = format!("{}{}", base.trim_end_matches('/'), rebuilt);
    if !raw_query.is_empty() {
        url.push('?');
        url.push_str(raw_query);
    }
    url
}

/// Decides between a 302 redirect and reverse-proxying, given the result
/// of rule selection. A configured extension rule overrides a coarser
/// root redirect (SPEC_FULL.md §4.B rationale).
pub fn decide(
    path_config: &PathConfig,
    selected: Option<&SelectedRule>,
    target_path: &str,
    raw_query: &str,
) -> RedirectDecision {
    if let Some(selected) = selected {
        let target_url = build_target_url(&selected.rule.target, target_path, raw_query);
        return RedirectDecision {
            should_redirect: selected.rule.redirect_mode,
            target_url,
        };
    }

    let target_url = build_target_url(&path_config.default_target, target_path, raw_query);
    RedirectDecision {
        should_redirect: path_config.redirect_mode,
        target_url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_is_appended_verbatim() {
        let url = build_target_url("https://origin.example", "/a/b.jpg", "x=1&y=2");
        assert_eq!(url, "https://origin.example/a/b.jpg?x=1&y=2");
    }

    #[test]
    fn no_query_means_no_question_mark() {
        let url = build_target_url("https://origin.example", "/a/b.jpg", "");
        assert_eq!(url, "https://origin.example/a/b.jpg");
    }

    #[test]
    fn segments_are_decoded_then_reencoded() {
        let url = build_target_url("https://origin.example", "/a%20b/c.jpg", "");
        assert_eq!(url, "https://origin.example/a%20b/c.jpg");
    }
}
