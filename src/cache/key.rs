//! Cache key construction and the Accept/User-Agent canonicalization used
//! for image requests (SPEC_FULL.md §3, Property 5).
//!
//! Normalization is intentionally lossy: `q=` parameters on `Accept` and
//! UA minor versions are discarded so that semantically-equivalent image
//! requests share a cache entry. Callers that need strict content
//! negotiation must bypass the cache (SPEC_FULL.md §9).

use std::hash::Hash;

/// The set of image content-types the cache treats as negotiable formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageAccept {
    Avif,
    Webp,
    Jpeg,
    Png,
    Gif,
    Auto,
}

impl ImageAccept {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageAccept::Avif => "image/avif",
            ImageAccept::Webp => "image/webp",
            ImageAccept::Jpeg => "image/jpeg",
            ImageAccept::Png => "image/png",
            ImageAccept::Gif => "image/gif",
            ImageAccept::Auto => "image/auto",
        }
    }

    /// Fallback order to walk on a miss, most-preferred modern format first.
    pub fn fallback_order(self) -> &'static [ImageAccept] {
        use ImageAccept::*;
        match self {
            Avif => &[Avif, Webp, Jpeg, Png, Gif],
            Webp => &[Webp, Jpeg, Png, Gif],
            Jpeg => &[Jpeg, Png, Gif],
            Png => &[Png, Jpeg, Gif],
            Gif => &[Gif, Png, Jpeg],
            Auto => &[Auto, Webp, Jpeg, Png, Gif],
        }
    }
}

/// Normalizes a request's raw `Accept` header into one of the six
/// canonical image buckets. Preference order when multiple are present:
/// avif > webp > jpeg > png > gif, falling back to `Auto` when nothing
/// recognizable is present.
pub fn normalize_image_accept(accept: &str) -> ImageAccept {
    let lower = accept.to_ascii_lowercase();
    if lower.contains("image/avif") {
        ImageAccept::Avif
    } else if lower.contains("image/webp") {
        ImageAccept::Webp
    } else if lower.contains("image/jpeg") || lower.contains("image/jpg") {
        ImageAccept::Jpeg
    } else if lower.contains("image/png") {
        ImageAccept::Png
    } else if lower.contains("image/gif") {
        ImageAccept::Gif
    } else {
        ImageAccept::Auto
    }
}

/// Returns true if a content-type names one of the modern image formats
/// the fallback walk is willing to accept as "compatible" (SPEC_FULL.md
/// §9: any modern image format is treated as compatible, by design).
pub fn is_modern_image_content_type(content_type: &str) -> bool {
    let lower = content_type.to_ascii_lowercase();
    ["image/avif", "image/webp", "image/jpeg", "image/jpg", "image/png", "image/gif"]
        .iter()
        .any(|fmt| lower.starts_with(fmt))
}

/// Normalized User-Agent bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UaBucket {
    Chrome,
    Firefox,
    Safari,
    Edge,
    Bot,
    Other,
    Default,
}

impl UaBucket {
    pub fn as_str(self) -> &'static str {
        match self {
            UaBucket::Chrome => "chrome",
            UaBucket::Firefox => "firefox",
            UaBucket::Safari => "safari",
            UaBucket::Edge => "edge",
            UaBucket::Bot => "bot",
            UaBucket::Other => "other",
            UaBucket::Default => "default",
        }
    }
}

/// Collapses a raw User-Agent string into one of seven buckets, discarding
/// minor-version noise so e.g. two Chrome point releases share a key.
pub fn normalize_user_agent(ua: &str) -> UaBucket {
    if ua.is_empty() {
        return UaBucket::Default;
    }
    let lower = ua.to_ascii_lowercase();
    let is_bot = ["bot", "spider", "crawler", "curl", "wget", "slurp"]
        .iter()
        .any(|needle| lower.contains(needle));
    if is_bot {
        return UaBucket::Bot;
    }
    // Edge and Chrome both contain "chrome" in their UA string; check Edge first.
    if lower.contains("edg/") || lower.contains("edge/") {
        UaBucket::Edge
    } else if lower.contains("chrome/") {
        UaBucket::Chrome
    } else if lower.contains("firefox/") {
        UaBucket::Firefox
    } else if lower.contains("safari/") && !lower.contains("chrome/") {
        UaBucket::Safari
    } else {
        UaBucket::Other
    }
}

/// Identifies a cached response: the canonical URL plus, for image
/// requests, the normalized Accept/UA pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub url: String,
    pub accept: String,
    pub user_agent: String,
}

impl CacheKey {
    /// Builds a key for a non-image request: raw headers are used as-is.
    pub fn raw(url: impl Into<String>, accept: &str, user_agent: &str) -> Self {
        Self {
            url: url.into(),
            accept: accept.to_string(),
            user_agent: user_agent.to_string(),
        }
    }

    /// Builds a key for an image request, applying Accept/UA normalization.
    pub fn for_image(url: impl Into<String>, accept: &str, user_agent: &str) -> Self {
        Self {
            url: url.into(),
            accept: normalize_image_accept(accept).as_str().to_string(),
            user_agent: normalize_user_agent(user_agent).as_str().to_string(),
        }
    }

    /// Canonical string form used for logging and as a map key fallback.
    pub fn canonical(&self) -> String {
        format!("{}|{}|{}", self.url, self.accept, self.user_agent)
    }

    pub fn image_accept(&self) -> ImageAccept {
        match self.accept.as_str() {
            "image/avif" => ImageAccept::Avif,
            "image/webp" => ImageAccept::Webp,
            "image/jpeg" => ImageAccept::Jpeg,
            "image/png" => ImageAccept::Png,
            "image/gif" => ImageAccept::Gif,
            _ => ImageAccept::Auto,
        }
    }

    pub fn with_accept(&self, accept: ImageAccept) -> Self {
        Self {
            url: self.url.clone(),
            accept: accept.as_str().to_string(),
            user_agent: self.user_agent.clone(),
        }
    }
}

/// Returns true if the given request path looks like an image request
/// based on its file extension, the signal the Cache Manager uses to
/// decide whether to apply Accept/UA normalization at all.
pub fn looks_like_image_path(path: &str) -> bool {
    let ext = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    matches!(
        ext.as_str(),
        "jpg" | "jpeg" | "png" | "gif" | "webp" | "avif" | "bmp" | "svg"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn q_values_collapse_to_same_key() {
        let k1 = CacheKey::for_image("/img.png", "image/avif,image/webp;q=0.9,*/*;q=0.8", "ua");
        let k2 = CacheKey::for_image("/img.png", "image/avif", "ua");
        assert_eq!(k1, k2);
    }

    #[test]
    fn ua_minor_version_collapses() {
        let k1 = CacheKey::for_image("/img.png", "image/png", "Mozilla/5.0 Chrome/120.0.0.0");
        let k2 = CacheKey::for_image("/img.png", "image/png", "Mozilla/5.0 Chrome/121.0.5000.1");
        assert_eq!(k1, k2);
    }

    #[test]
    fn edge_is_not_misclassified_as_chrome() {
        assert_eq!(
            normalize_user_agent("Mozilla/5.0 Chrome/120.0 Safari/537.36 Edg/120.0"),
            UaBucket::Edge
        );
    }

    #[test]
    fn fallback_order_starts_with_requested_format() {
        assert_eq!(ImageAccept::Avif.fallback_order()[0], ImageAccept::Avif);
    }

    #[test]
    fn modern_image_detection() {
        assert!(is_modern_image_content_type("image/webp"));
        assert!(!is_modern_image_content_type("text/html"));
    }
}
