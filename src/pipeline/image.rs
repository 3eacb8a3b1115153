//! Image reachability probes.

use async_trait::async_trait;

/// Answers whether an image URL can be served.
#[async_trait]
pub trait ImageProbe: Send + Sync {
    async fn is_reachable(&self, url: &str) -> bool;
}

/// Probe that never checks; every image is kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeReachable;

#[async_trait]
impl ImageProbe for AssumeReachable {
    async fn is_reachable(&self, _url: &str) -> bool {
        true
    }
}

#[cfg(feature = "http")]
pub use http_probe::{normalize_image_url, HttpImageProbe};

#[cfg(feature = "http")]
mod http_probe {
    use std::time::Duration;

    use async_trait::async_trait;
    use reqwest::{StatusCode, Url};
    use tracing::debug;

    use super::ImageProbe;

    /// Decoding passes before a URL is considered malformed.
    const MAX_DECODE_PASSES: usize = 8;

    /// Percent-decode until stable, then re-encode through URL parsing.
    /// Returns `None` for malformed or non-HTTP URLs.
    pub fn normalize_image_url(raw: &str) -> Option<Url> {
        let mut current = raw.trim().to_string();
        if current.is_empty() {
            return None;
        }
        let mut stable = false;
        for _ in 0..MAX_DECODE_PASSES {
            let decoded = urlencoding::decode(&current).ok()?.into_owned();
            if decoded == current {
                stable = true;
                break;
            }
            current = decoded;
        }
        if !stable {
            return None;
        }

        let url = Url::parse(&current).ok()?;
        matches!(url.scheme(), "http" | "https").then_some(url)
    }

    /// HEAD, then GET; reachable only on a 200.
    #[derive(Debug, Clone)]
    pub struct HttpImageProbe {
        client: reqwest::Client,
    }

    impl HttpImageProbe {
        pub fn new(timeout: Duration) -> anyhow::Result<Self> {
            Ok(Self {
                client: reqwest::Client::builder().timeout(timeout).build()?,
            })
        }
    }

    #[async_trait]
    impl ImageProbe for HttpImageProbe {
        async fn is_reachable(&self, url: &str) -> bool {
            let Some(url) = normalize_image_url(url) else {
                debug!(url, "malformed image url");
                return false;
            };

            if let Ok(response) = self.client.head(url.clone()).send().await {
                if response.status() == StatusCode::OK {
                    return true;
                }
            }
            match self.client.get(url).send().await {
                Ok(response) => response.status() == StatusCode::OK,
                Err(_) => false,
            }
        }
    }

}
