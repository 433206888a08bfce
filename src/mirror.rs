//! Mirror Handler: `/mirror/<absolute-url>` passthrough reusing the Cache
//! Manager and Forwarder (SPEC_FULL.md §4.J).

use http::{HeaderMap, HeaderValue, Method};

const MIRROR_PREFIX: &str = "/mirror/";
pub const CACHE_HIT_HEADER: &str = "Proxy-Go-Cache-HIT";

/// Extracts and normalizes the absolute URL embedded in a `/mirror/...`
/// request path, tolerating the `https:/x` upstream-gateway quirk and
/// missing scheme.
pub fn parse_mirror_url(path: &str, raw_query: &str) -> Option<String> {
    let rest = path.strip_prefix(MIRROR_PREFIX)?;
    if rest.is_empty() {
        return None;
    }

    let mut url = fixup_single_slash_scheme(rest);
    if !url.starts_with("http://") && !url.starts_with("https://") {
        url = format!("https://{url}");
    }
    if !raw_query.is_empty() {
        url.push('?');
        url.push_str(raw_query);
    }
    Some(url)
}

/// Defensive fix-up for upstream gateways that collapse `https://` into
/// `https:/` when rewriting the mirror path.
fn fixup_single_slash_scheme(raw: &str) -> String {
    for scheme in ["https:/", "http:/"] {
        if raw.starts_with(scheme) && !raw.starts_with(&format!("{scheme}/")) {
            let (s, rest) = raw.split_at(scheme.len());
            return format!("{s}/{rest}");
        }
    }
    raw.to_string()
}

pub fn is_preflight(method: &Method) -> bool {
    method == Method::OPTIONS
}

/// Permissive CORS headers the mirror endpoint always answers with.
pub fn cors_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("Access-Control-Allow-Origin", HeaderValue::from_static("*"));
    headers.insert(
        "Access-Control-Allow-Methods",
        HeaderValue::from_static("GET, HEAD, OPTIONS"),
    );
    headers.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static("*"),
    );
    headers
}

pub fn cache_hit_header_value(hit: bool) -> HeaderValue {
    HeaderValue::from_static(if hit { "1" } else { "0" })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_absolute_url() {
        let url = parse_mirror_url("/mirror/https://example.com/a.jpg", "").unwrap();
        assert_eq!(url, "https://example.com/a.jpg");
    }

    #[test]
    fn missing_scheme_gets_https_prepended() {
        let url = parse_mirror_url("/mirror/example.com/a.jpg", "").unwrap();
        assert_eq!(url, "https://example.com/a.jpg");
    }

    #[test]
    fn single_slash_scheme_is_fixed_up() {
        let url = parse_mirror_url("/mirror/https:/example.com/a.jpg", "").unwrap();
        assert_eq!(url, "https://example.com/a.jpg");
    }

    #[test]
    fn query_is_reattached() {
        let url = parse_mirror_url("/mirror/https://example.com/a.jpg", "w=100").unwrap();
        assert_eq!(url, "https://example.com/a.jpg?w=100");
    }

    #[test]
    fn empty_mirror_path_is_rejected() {
        assert!(parse_mirror_url("/mirror/", "").is_none());
    }
}
