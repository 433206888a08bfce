//! Request header/query/cookie extraction helpers, adapted from the
//! teacher's `utils::request` module to this gateway's `ServerSession`
//! surface instead of `pingora_proxy::Session`.

use http::HeaderName;
use once_cell::sync::Lazy;
use pingora::protocols::http::ServerSession;
use pingora_http::RequestHeader;

static HTTP_HEADER_X_FORWARDED_FOR: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-forwarded-for"));
static HTTP_HEADER_X_REAL_IP: Lazy<HeaderName> = Lazy::new(|| HeaderName::from_static("x-real-ip"));

/// Extracts the value of a specific query parameter from the request URI.
pub fn get_query_value<'a>(req_header: &'a RequestHeader, name: &str) -> Option<&'a str> {
    req_header.uri.query().and_then(|query| {
        query.split('&').find_map(|pair| {
            if let Some((k, v)) = pair.split_once('=') {
                if k == name {
                    Some(v.trim())
                } else {
                    None
                }
            } else if pair == name {
                Some("")
            } else {
                None
            }
        })
    })
}

/// Retrieves the value of a specific header from the request.
pub fn get_req_header_value<'a>(req_header: &'a RequestHeader, key: &str) -> Option<&'a str> {
    req_header.headers.get(key).and_then(|value| value.to_str().ok())
}

/// Retrieves the value of a specific cookie from the `Cookie` header.
pub fn get_cookie_value<'a>(req_header: &'a RequestHeader, cookie_name: &str) -> Option<&'a str> {
    let cookie_header = get_req_header_value(req_header, "Cookie")?;
    for item in cookie_header.split(';') {
        let trimmed = item.trim();
        if let Some((k, v)) = trimmed.split_once('=') {
            if k.trim() == cookie_name {
                return Some(v.trim());
            }
        }
    }
    None
}

/// Retrieves the request host, preferring the URI's host and falling
/// back to the `Host` header with the port stripped.
pub fn get_request_host(header: &RequestHeader) -> Option<&str> {
    if let Some(host) = header.uri.host() {
        if !host.is_empty() {
            return Some(host);
        }
    }
    header
        .headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(':').next().unwrap_or(""))
}

/// Gets the client's apparent IP: `X-Forwarded-For` (first hop), then
/// `X-Real-IP`, then the direct connection address.
pub fn get_client_ip(session: &ServerSession) -> String {
    if let Some(value) = session.get_header(HTTP_HEADER_X_FORWARDED_FOR.clone()) {
        if let Ok(forwarded) = value.to_str() {
            if let Some(ip) = forwarded.split(',').next() {
                let trimmed = ip.trim();
                if !trimmed.is_empty() {
                    return trimmed.to_string();
                }
            }
        }
    }

    if let Some(value) = session.get_header(HTTP_HEADER_X_REAL_IP.clone()) {
        if let Ok(real_ip) = value.to_str() {
            let trimmed = real_ip.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }

    session
        .client_addr()
        .and_then(|addr| addr.as_inet())
        .map(|inet| inet.ip().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(uri: &str) -> RequestHeader {
        let mut h = RequestHeader::build("GET", uri.as_bytes(), None).unwrap();
        h.insert_header("Cookie", "a=1; b=2").unwrap();
        h
    }

    #[test]
    fn query_value_is_extracted() {
        let h = header("/path?x=1&y=2");
        assert_eq!(get_query_value(&h, "y"), Some("2"));
    }

    #[test]
    fn cookie_value_is_extracted() {
        let h = header("/path");
        assert_eq!(get_cookie_value(&h, "b"), Some("2"));
    }

    #[test]
    fn host_falls_back_to_header_with_port_stripped() {
        let mut h = header("/path");
        h.insert_header(http::header::HOST, "example.com:8443").unwrap();
        assert_eq!(get_request_host(&h), Some("example.com"));
    }
}
