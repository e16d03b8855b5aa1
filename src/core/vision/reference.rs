//! 参考图加载 - label 的照片可能是 data URL、http(s) 链接或本地路径

use super::error::VisionError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::RgbaImage;
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

static DATA_URL: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^data:image/[a-zA-Z0-9.+-]+;base64,(?P<payload>.+)$"));

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Opaque reference-image payload of a label. Two labels sharing the same
/// payload share one cached feature vector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceImage(Arc<str>);

impl ReferenceImage {
    pub fn new(payload: impl Into<Arc<str>>) -> Self {
        Self(payload.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_data_url(&self) -> bool {
        self.0.starts_with("data:")
    }

    pub fn is_remote(&self) -> bool {
        self.0.starts_with("http://") || self.0.starts_with("https://")
    }

    /// Decode the payload. Remote URLs block on the network, so async callers
    /// go through [`ReferenceImage::resolve_async`].
    pub fn resolve(&self) -> Result<RgbaImage, VisionError> {
        let bytes = if self.is_data_url() {
            decode_data_url(&self.0)?
        } else if self.is_remote() {
            fetch_remote(&self.0)?
        } else {
            std::fs::read(self.as_str())?
        };

        debug!("📷 Reference image {} resolved ({} bytes)", self, bytes.len());
        Ok(image::load_from_memory(&bytes)?.to_rgba8())
    }

    pub async fn resolve_async(&self) -> Result<RgbaImage, VisionError> {
        let image = self.clone();
        tokio::task::spawn_blocking(move || image.resolve())
            .await
            .map_err(|e| VisionError::ReferenceImage(format!("resolver task failed: {}", e)))?
    }
}

impl fmt::Display for ReferenceImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // data URLs can be megabytes long
        let head: String = self.0.chars().take(40).collect();
        if head.len() < self.0.len() {
            write!(f, "{}…", head)
        } else {
            write!(f, "{}", head)
        }
    }
}

fn decode_data_url(url: &str) -> Result<Vec<u8>, VisionError> {
    let regex = DATA_URL
        .as_ref()
        .map_err(|e| VisionError::ReferenceImage(format!("data URL regex error: {}", e)))?;
    let caps = regex
        .captures(url)
        .ok_or_else(|| VisionError::ReferenceImage("unsupported data URL".to_string()))?;
    STANDARD
        .decode(caps["payload"].trim())
        .map_err(|e| VisionError::ReferenceImage(format!("invalid base64 payload: {}", e)))
}

fn fetch_remote(url: &str) -> Result<Vec<u8>, VisionError> {
    let client = reqwest::blocking::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()?;
    let resp = client.get(url).send()?.error_for_status()?;
    Ok(resp.bytes()?.to_vec())
}
