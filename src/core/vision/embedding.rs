//! 特征提取 - 预训练视觉模型的异步封装
//!
//! The model is loaded once in the background. Until then the extractor
//! reports [`ModelState::Loading`] and every extraction fails with
//! `ModelNotReady`, which the matcher treats as "no match".

use super::error::VisionError;
use super::region::RegionBuffer;
use async_trait::async_trait;
use log::{error, info, warn};
use std::sync::{Arc, RwLock};

/// L2-normalised embedding. Cheap to clone; the values are shared.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector(Arc<[f32]>);

impl FeatureVector {
    /// Normalise raw model output. A zero vector stays zero.
    pub fn from_raw(raw: Vec<f32>) -> Self {
        let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
        let norm = if norm > 0.0 { norm } else { 1.0 };
        Self(raw.into_iter().map(|v| v / norm).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// True when both vectors share the same allocation.
    pub fn ptr_eq(&self, other: &FeatureVector) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A loaded embedding model.
///
/// Implementations own whatever device buffers inference needs; those must be
/// dropped before `infer` returns, whether it succeeds or not.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    async fn infer(&self, input: &RegionBuffer) -> Result<Vec<f32>, VisionError>;

    /// Release the model on teardown.
    fn close(&self) {}
}

#[async_trait]
pub trait EmbeddingModelProvider: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn EmbeddingModel>, VisionError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelState {
    Loading,
    Ready,
    /// Load failed; the feature stays off for this session.
    Unavailable(String),
    Closed,
}

enum ModelSlot {
    Loading,
    Ready(Arc<dyn EmbeddingModel>),
    Unavailable(String),
    Closed,
}

pub struct EmbeddingExtractor {
    slot: RwLock<ModelSlot>,
}

impl EmbeddingExtractor {
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(ModelSlot::Loading),
        }
    }

    pub fn with_model(model: Arc<dyn EmbeddingModel>) -> Self {
        Self {
            slot: RwLock::new(ModelSlot::Ready(model)),
        }
    }

    pub fn state(&self) -> ModelState {
        match self.slot.read() {
            Ok(slot) => match &*slot {
                ModelSlot::Loading => ModelState::Loading,
                ModelSlot::Ready(_) => ModelState::Ready,
                ModelSlot::Unavailable(reason) => ModelState::Unavailable(reason.clone()),
                ModelSlot::Closed => ModelState::Closed,
            },
            Err(_) => ModelState::Unavailable("model slot poisoned".to_string()),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ModelState::Ready
    }

    /// Load the model through `provider`. On failure the extractor is marked
    /// unavailable and the error is returned for the caller to surface.
    pub async fn load(&self, provider: &dyn EmbeddingModelProvider) -> Result<(), VisionError> {
        info!("🧠 EmbeddingExtractor: loading model");
        let loaded = provider.load().await;

        let mut slot = self
            .slot
            .write()
            .map_err(|_| VisionError::ModelLoad("model slot poisoned".to_string()))?;

        if matches!(*slot, ModelSlot::Closed) {
            // torn down while loading
            if let Ok(model) = loaded {
                model.close();
            }
            return Err(VisionError::ModelLoad("extractor closed during load".to_string()));
        }

        match loaded {
            Ok(model) => {
                *slot = ModelSlot::Ready(model);
                info!("✅ Embedding model ready");
                Ok(())
            }
            Err(e) => {
                error!("❌ Embedding model failed to load: {}", e);
                *slot = ModelSlot::Unavailable(e.to_string());
                Err(VisionError::ModelLoad(e.to_string()))
            }
        }
    }

    fn model(&self) -> Result<Arc<dyn EmbeddingModel>, VisionError> {
        let slot = self.slot.read().map_err(|_| VisionError::ModelNotReady)?;
        match &*slot {
            ModelSlot::Ready(model) => Ok(Arc::clone(model)),
            _ => Err(VisionError::ModelNotReady),
        }
    }

    pub async fn extract(&self, buffer: &RegionBuffer) -> Result<FeatureVector, VisionError> {
        let model = self.model()?;
        let raw = match model.infer(buffer).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("⚠️ Feature extraction failed: {}", e);
                return Err(match e {
                    VisionError::Extraction(_) => e,
                    other => VisionError::Extraction(other.to_string()),
                });
            }
        };

        if raw.is_empty() {
            warn!("⚠️ Embedding model returned no data");
            return Err(VisionError::Extraction("empty embedding".to_string()));
        }
        if raw.iter().any(|v| !v.is_finite()) || !raw.iter().map(|v| v * v).sum::<f32>().is_finite() {
            warn!("⚠️ Embedding model returned non-finite values");
            return Err(VisionError::Extraction("non-finite embedding".to_string()));
        }
        Ok(FeatureVector::from_raw(raw))
    }

    pub fn close(&self) {
        if let Ok(mut slot) = self.slot.write() {
            if let ModelSlot::Ready(model) = &*slot {
                model.close();
                info!("🗑️ Embedding model released");
            }
            *slot = ModelSlot::Closed;
        }
    }
}

impl Default for EmbeddingExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EmbeddingExtractor {
    fn drop(&mut self) {
        self.close();
    }
}

/// Deterministic stand-in for a real model: the embedding is derived from the
/// buffer's mean colour, so identical regions embed identically and differently
/// coloured regions point in different directions.
pub struct MockEmbeddingModel {
    fail: bool,
    empty: bool,
    fixed: Option<Vec<f32>>,
    latency: Option<std::time::Duration>,
    calls: std::sync::atomic::AtomicUsize,
    closed: std::sync::atomic::AtomicBool,
}

impl MockEmbeddingModel {
    pub fn new() -> Self {
        Self {
            fail: false,
            empty: false,
            fixed: None,
            latency: None,
            calls: Default::default(),
            closed: Default::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn returning_empty() -> Self {
        Self {
            empty: true,
            ..Self::new()
        }
    }

    /// Always returns `output`, whatever the region looks like.
    pub fn returning(output: Vec<f32>) -> Self {
        Self {
            fixed: Some(output),
            ..Self::new()
        }
    }

    pub fn with_latency(latency: std::time::Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// The raw embedding produced for a region of the given mean colour.
    pub fn embed_color(mean: [f32; 3]) -> Vec<f32> {
        vec![mean[0], mean[1], mean[2], 1.0]
    }
}

impl Default for MockEmbeddingModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingModel for MockEmbeddingModel {
    async fn infer(&self, input: &RegionBuffer) -> Result<Vec<f32>, VisionError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.fail {
            return Err(VisionError::Extraction("mock inference failure".to_string()));
        }
        if self.empty {
            return Ok(Vec::new());
        }
        if let Some(fixed) = &self.fixed {
            return Ok(fixed.clone());
        }
        Ok(Self::embed_color(input.mean_rgb()))
    }

    fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

pub struct MockEmbeddingProvider {
    model: Option<Arc<MockEmbeddingModel>>,
}

impl MockEmbeddingProvider {
    pub fn new(model: Arc<MockEmbeddingModel>) -> Self {
        Self { model: Some(model) }
    }

    pub fn broken() -> Self {
        Self { model: None }
    }
}

#[async_trait]
impl EmbeddingModelProvider for MockEmbeddingProvider {
    async fn load(&self) -> Result<Arc<dyn EmbeddingModel>, VisionError> {
        match &self.model {
            Some(model) => Ok(Arc::clone(model) as Arc<dyn EmbeddingModel>),
            None => Err(VisionError::ModelLoad("mock weights missing".to_string())),
        }
    }
}
