//! HEAD-request probe cache for upstream reachability and size
//! (SPEC_FULL.md §4.C).

use std::time::{Duration, Instant};

use dashmap::DashMap;
use reqwest::Client;
use url::Url;

const SIZE_TIMEOUT: Duration = Duration::from_secs(5);
const REACHABLE_TIMEOUT: Duration = Duration::from_secs(15);
const SIZE_TTL: Duration = Duration::from_secs(5 * 60);
const REACHABLE_TTL: Duration = Duration::from_secs(2 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);
const BROWSER_UA: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/124.0.0.0 Safari/537.36";

#[derive(Clone, Copy)]
struct SizeEntry {
    size: u64,
    at: Instant,
}

#[derive(Clone, Copy)]
struct ReachEntry {
    reachable: bool,
    at: Instant,
}

/// Memoized HEAD-probe results for upstream size and liveness. Shared by
/// the Rule Engine (4.B) to decide between candidate extension rules.
pub struct ProbeCache {
    client: Client,
    sizes: DashMap<String, SizeEntry>,
    reachability: DashMap<String, ReachEntry>,
}

impl ProbeCache {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .build()
                .unwrap_or_else(|_| Client::new()),
            sizes: DashMap::new(),
            reachability: DashMap::new(),
        }
    }

    fn referer_for(url: &str) -> Option<String> {
        Url::parse(url).ok().map(|u| {
            let mut origin = format!("{}://{}", u.scheme(), u.host_str().unwrap_or(""));
            if let Some(port) = u.port() {
                origin.push(':');
                origin.push_str(&port.to_string());
            }
            origin.push('/');
            origin
        })
    }

    /// Returns the upstream's `Content-Length` via HEAD, memoized for
    /// `SIZE_TTL`. `None` means "unavailable" (non-fatal to the caller).
    pub async fn size(&self, url: &str) -> Option<u64> {
        if let Some(entry) = self.sizes.get(url) {
            if entry.at.elapsed() < SIZE_TTL {
                return Some(entry.size);
            }
        }

        let mut req = self
            .client
            .head(url)
            .timeout(SIZE_TIMEOUT)
            .header("User-Agent", BROWSER_UA);
        if let Some(referer) = Self::referer_for(url) {
            req = req.header("Referer", referer);
        }

        let size = match req.send().await {
            Ok(resp) => resp.content_length().filter(|&len| len > 0),
            Err(e) => {
                log::debug!("probe: size HEAD failed for {url}: {e}");
                None
            }
        };

        if let Some(size) = size {
            self.sizes.insert(
                url.to_string(),
                SizeEntry {
                    size,
                    at: Instant::now(),
                },
            );
        }
        size
    }

    /// Returns whether the upstream answers HEAD with a status in
    /// `[200, 400)`, memoized for `REACHABLE_TTL`.
    pub async fn reachable(&self, url: &str) -> bool {
        if let Some(entry) = self.reachability.get(url) {
            if entry.at.elapsed() < REACHABLE_TTL {
                return entry.reachable;
            }
        }

        let mut req = self
            .client
            .head(url)
            .timeout(REACHABLE_TIMEOUT)
            .header("User-Agent", BROWSER_UA);
        if let Some(referer) = Self::referer_for(url) {
            req = req.header("Referer", referer);
        }

        let reachable = match req.send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                (200..400).contains(&status)
            }
            Err(e) => {
                log::debug!("probe: reachability HEAD failed for {url}: {e}");
                false
            }
        };

        self.reachability.insert(
            url.to_string(),
            ReachEntry {
                reachable,
                at: Instant::now(),
            },
        );
        reachable
    }

    /// Drops expired entries. Run on a background tick (SPEC_FULL.md §5).
    pub fn sweep_expired(&self) {
        self.sizes.retain(|_, e| e.at.elapsed() < SIZE_TTL);
        self.reachability
            .retain(|_, e| e.at.elapsed() < REACHABLE_TTL);
    }

    pub fn spawn_sweeper(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                self.sweep_expired();
            }
        })
    }
}

impl Default for ProbeCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referer_strips_path() {
        assert_eq!(
            ProbeCache::referer_for("https://example.com/a/b.jpg?x=1").unwrap(),
            "https://example.com/"
        );
    }
}
