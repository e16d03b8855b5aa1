//! 参考图特征缓存 - 每张参考图只提取一次

use super::embedding::{EmbeddingExtractor, FeatureVector};
use super::error::VisionError;
use super::label::Label;
use super::reference::ReferenceImage;
use super::region::normalize_region;
use image::RgbaImage;
use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use rayon::prelude::*;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy)]
struct FailureRecord {
    attempts: u32,
    last_failed_ms: u64,
}

/// Write-once store of reference-image embeddings. Failures are never stored
/// as values; the next lookup recomputes unless a backoff window is set.
pub struct LabelFeatureCache {
    entries: Mutex<HashMap<ReferenceImage, FeatureVector>>,
    failures: Mutex<HashMap<ReferenceImage, FailureRecord>>,
    failure_backoff_ms: u64,
}

impl LabelFeatureCache {
    pub fn new() -> Self {
        Self::with_backoff(0)
    }

    pub fn with_backoff(failure_backoff_ms: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            failure_backoff_ms,
        }
    }

    pub fn get(&self, key: &ReferenceImage) -> Option<FeatureVector> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn failure_count(&self, key: &ReferenceImage) -> u32 {
        self.failures
            .lock()
            .ok()
            .and_then(|f| f.get(key).map(|r| r.attempts))
            .unwrap_or(0)
    }

    /// Return the stored vector for `key`, or run `compute` and store its
    /// result. No lock is held while `compute` runs.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &ReferenceImage,
        now_ms: u64,
        compute: F,
    ) -> Result<FeatureVector, VisionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FeatureVector, VisionError>>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }

        if self.in_backoff(key, now_ms) {
            return Err(VisionError::BackoffActive { key: key.to_string() });
        }

        match compute().await {
            Ok(vector) => {
                let mut entries = self
                    .entries
                    .lock()
                    .map_err(|_| VisionError::Extraction("feature cache poisoned".to_string()))?;
                // another flow may have filled the key while we computed
                let stored = entries.entry(key.clone()).or_insert(vector).clone();
                drop(entries);
                if let Ok(mut failures) = self.failures.lock() {
                    failures.remove(key);
                }
                debug!("💾 Cached features for {}", key);
                Ok(stored)
            }
            Err(e) => {
                self.record_failure(key, now_ms);
                if !e.is_quiet() {
                    warn!(
                        "⚠️ Failed to extract features from label image {} (attempt {}): {}",
                        key,
                        self.failure_count(key),
                        e
                    );
                }
                Err(e)
            }
        }
    }

    /// Store a vector computed elsewhere, e.g. restored from disk. An existing
    /// entry wins.
    pub fn insert(&self, key: ReferenceImage, vector: FeatureVector) -> FeatureVector {
        match self.entries.lock() {
            Ok(mut entries) => entries.entry(key).or_insert(vector).clone(),
            Err(_) => vector,
        }
    }

    /// Forget the vector for an image that changed.
    pub fn invalidate(&self, key: &ReferenceImage) -> bool {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(key);
        }
        self.entries
            .lock()
            .map(|mut e| e.remove(key).is_some())
            .unwrap_or(false)
    }

    /// Embed every label's reference image ahead of the first cycle.
    /// Decoding and normalisation run on the rayon pool, inference stays
    /// sequential. Returns how many labels have a vector afterwards.
    pub async fn warm_up(
        &self,
        labels: &[Label],
        extractor: &EmbeddingExtractor,
        input_size: u32,
        now_ms: u64,
    ) -> usize {
        let pending: Vec<ReferenceImage> = labels
            .iter()
            .map(|l| l.reference_image.clone())
            .filter(|key| self.get(key).is_none())
            .collect();

        if pending.is_empty() {
            return labels.len();
        }

        info!("🔥 Warming feature cache for {} reference images", pending.len());
        let decoded: Vec<(ReferenceImage, Result<RgbaImage, VisionError>)> =
            match tokio::task::spawn_blocking(move || decode_all(pending)).await {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("⚠️ Reference decoding task failed, pending labels stay cold: {}", e);
                    Vec::new()
                }
            };

        for (key, image) in decoded {
            let image = match image {
                Ok(image) => image,
                Err(e) => {
                    self.record_failure(&key, now_ms);
                    warn!("⚠️ Reference image {} could not be loaded: {}", key, e);
                    continue;
                }
            };
            let buffer = normalize_region(&image, None, input_size);
            let buffer = &buffer;
            let _ = self
                .get_or_compute(&key, now_ms, move || async move { extractor.extract(buffer).await })
                .await;
        }

        labels
            .iter()
            .filter(|l| self.get(&l.reference_image).is_some())
            .count()
    }

    fn in_backoff(&self, key: &ReferenceImage, now_ms: u64) -> bool {
        if self.failure_backoff_ms == 0 {
            return false;
        }
        self.failures
            .lock()
            .ok()
            .and_then(|f| f.get(key).copied())
            .map(|r| now_ms.saturating_sub(r.last_failed_ms) < self.failure_backoff_ms)
            .unwrap_or(false)
    }

    fn record_failure(&self, key: &ReferenceImage, now_ms: u64) {
        if let Ok(mut failures) = self.failures.lock() {
            let record = failures.entry(key.clone()).or_insert(FailureRecord {
                attempts: 0,
                last_failed_ms: now_ms,
            });
            record.attempts += 1;
            record.last_failed_ms = now_ms;
        }
    }
}

impl Default for LabelFeatureCache {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_all(pending: Vec<ReferenceImage>) -> Vec<(ReferenceImage, Result<RgbaImage, VisionError>)> {
    let decode = |key: ReferenceImage| {
        let image = key.resolve();
        (key, image)
    };
    match decode_pool() {
        Some(pool) => pool.install(|| pending.into_par_iter().map(decode).collect()),
        None => pending.into_iter().map(decode).collect(),
    }
}

fn decode_pool() -> Option<&'static rayon::ThreadPool> {
    static POOL: OnceCell<Option<rayon::ThreadPool>> = OnceCell::new();
    POOL.get_or_init(|| {
        let threads = num_cpus::get().min(4);
        debug!("Using {} threads for reference decoding", threads);
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("elder-vision-decode-{}", i))
            .build()
            .map_err(|e| warn!("⚠️ Decode pool unavailable, decoding sequentially: {}", e))
            .ok()
    })
    .as_ref()
}
