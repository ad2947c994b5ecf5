//! Process-wide overlay image cache.
//!
//! Keyed by URL, load-on-miss, no automatic eviction; `evict` exists for
//! explicit invalidation (e.g. after an overlay is deleted through the
//! REST surface).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::{MediaError, Result};

/// A decoded overlay, RGBA8.
#[derive(Debug, Clone)]
pub struct OverlayImage {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

pub struct OverlayCache {
    client: reqwest::Client,
    entries: Mutex<HashMap<String, Arc<OverlayImage>>>,
}

impl OverlayCache {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("MaskMeet/0.1")
            .build()
            .expect("reqwest client");
        Self {
            client,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch-and-decode on miss, cached copy on hit.
    pub async fn get(&self, url: &str) -> Result<Arc<OverlayImage>> {
        if let Some(image) = self.entries.lock().await.get(url) {
            return Ok(image.clone());
        }

        let bytes = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| MediaError::OverlayFetch {
                url: url.to_string(),
                detail: e.to_string(),
            })?
            .bytes()
            .await
            .map_err(|e| MediaError::OverlayFetch {
                url: url.to_string(),
                detail: e.to_string(),
            })?;

        let decoded = image::load_from_memory(&bytes)
            .map_err(|source| MediaError::OverlayDecode {
                url: url.to_string(),
                source,
            })?
            .to_rgba8();

        let overlay = Arc::new(OverlayImage {
            width: decoded.width(),
            height: decoded.height(),
            rgba: decoded.into_raw(),
        });

        tracing::info!(url, width = overlay.width, height = overlay.height, "overlay cached");
        self.entries
            .lock()
            .await
            .insert(url.to_string(), overlay.clone());
        Ok(overlay)
    }

    /// Insert a pre-decoded overlay, bypassing the network.
    pub async fn insert(&self, url: &str, image: OverlayImage) {
        self.entries
            .lock()
            .await
            .insert(url.to_string(), Arc::new(image));
    }

    /// Drop one entry, or the whole cache when `url` is `None`.
    pub async fn evict(&self, url: Option<&str>) {
        let mut entries = self.entries.lock().await;
        match url {
            Some(url) => {
                entries.remove(url);
            }
            None => entries.clear(),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

impl Default for OverlayCache {
    fn default() -> Self {
        Self::new()
    }
}
