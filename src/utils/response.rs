//! Response header helpers for the headers the core adds (SPEC_FULL.md §6).

use http::{HeaderMap, HeaderValue};

pub const CACHE_HIT_HEADER: &str = "Proxy-Go-Cache-HIT";
pub const REDIRECT_HEADER: &str = "Proxy-Go-Redirect";

pub fn set_cache_hit(headers: &mut HeaderMap, hit: bool) {
    headers.insert(
        CACHE_HIT_HEADER,
        HeaderValue::from_static(if hit { "1" } else { "0" }),
    );
}

pub fn set_redirect_marker(headers: &mut HeaderMap) {
    headers.insert(REDIRECT_HEADER, HeaderValue::from_static("1"));
    headers.insert(
        http::header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
}

pub fn set_vary_accept(headers: &mut HeaderMap) {
    headers.insert(http::header::VARY, HeaderValue::from_static("Accept"));
}

pub fn set_retry_after(headers: &mut HeaderMap, seconds: i64) {
    if let Ok(value) = HeaderValue::from_str(&seconds.max(0).to_string()) {
        headers.insert(http::header::RETRY_AFTER, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_hit_header_reflects_flag() {
        let mut headers = HeaderMap::new();
        set_cache_hit(&mut headers, true);
        assert_eq!(headers.get(CACHE_HIT_HEADER).unwrap(), "1");
    }

    #[test]
    fn redirect_marker_sets_no_store() {
        let mut headers = HeaderMap::new();
        set_redirect_marker(&mut headers);
        assert_eq!(headers.get(REDIRECT_HEADER).unwrap(), "1");
        assert_eq!(
            headers.get(http::header::CACHE_CONTROL).unwrap(),
            "no-cache, no-store, must-revalidate"
        );
    }
}
