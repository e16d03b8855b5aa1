//! ONNX Runtime 特征提取后端 (feature = "onnx")

use super::embedding::{EmbeddingModel, EmbeddingModelProvider};
use super::error::VisionError;
use super::region::RegionBuffer;
use async_trait::async_trait;
use log::{debug, info};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Debug, Clone)]
pub enum ModelSource {
    File(PathBuf),
    Memory(Arc<[u8]>),
}

/// Loads an image-embedding network such as MobileNet or a ViT backbone.
/// The first output is used; for `[1, tokens, dim]` outputs that is the
/// leading (CLS) token.
pub struct OnnxEmbeddingProvider {
    source: ModelSource,
    intra_threads: usize,
}

impl OnnxEmbeddingProvider {
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            source: ModelSource::File(path.into()),
            intra_threads: num_cpus::get().min(4),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            source: ModelSource::Memory(bytes.into()),
            intra_threads: num_cpus::get().min(4),
        }
    }

    pub fn with_intra_threads(mut self, threads: usize) -> Self {
        self.intra_threads = threads.max(1);
        self
    }

    fn build(source: &ModelSource, intra_threads: usize) -> Result<Session, ort::Error> {
        let builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(intra_threads)?;
        match source {
            ModelSource::File(path) => builder.commit_from_file(path),
            ModelSource::Memory(bytes) => builder.commit_from_memory(bytes),
        }
    }
}

#[async_trait]
impl EmbeddingModelProvider for OnnxEmbeddingProvider {
    async fn load(&self) -> Result<Arc<dyn EmbeddingModel>, VisionError> {
        let source = self.source.clone();
        let threads = self.intra_threads;
        let session = tokio::task::spawn_blocking(move || Self::build(&source, threads))
            .await
            .map_err(|e| VisionError::ModelLoad(e.to_string()))?
            .map_err(|e| VisionError::ModelLoad(e.to_string()))?;

        info!(
            "✅ ONNX embedding model loaded. Inputs: {}, Outputs: {}",
            session.inputs.len(),
            session.outputs.len()
        );
        Ok(Arc::new(OnnxEmbeddingModel {
            session: Arc::new(Mutex::new(Some(session))),
        }))
    }
}

pub struct OnnxEmbeddingModel {
    session: Arc<Mutex<Option<Session>>>,
}

fn preprocess(buffer: &RegionBuffer) -> Vec<f32> {
    let mut data = buffer.to_chw_f32();
    let plane = data.len() / 3;
    for (c, channel) in data.chunks_mut(plane.max(1)).enumerate().take(3) {
        for v in channel {
            *v = (*v - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    data
}

fn run(session: &mut Session, size: usize, data: Vec<f32>) -> Result<Vec<f32>, VisionError> {
    let tensor = Tensor::from_array(([1usize, 3, size, size], data))
        .map_err(|e| VisionError::Extraction(e.to_string()))?;
    let outputs = session
        .run(ort::inputs![tensor])
        .map_err(|e| VisionError::Extraction(e.to_string()))?;
    let (shape, values) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(|e| VisionError::Extraction(e.to_string()))?;

    let dim = shape.iter().last().copied().unwrap_or(0).max(0) as usize;
    debug!("Embedding output shape {:?}", shape);
    Ok(values.iter().take(dim).copied().collect())
}

#[async_trait]
impl EmbeddingModel for OnnxEmbeddingModel {
    async fn infer(&self, input: &RegionBuffer) -> Result<Vec<f32>, VisionError> {
        let size = input.size() as usize;
        let data = preprocess(input);
        let session = Arc::clone(&self.session);

        tokio::task::spawn_blocking(move || {
            let mut slot = session
                .lock()
                .map_err(|_| VisionError::Extraction("session poisoned".to_string()))?;
            let session = slot.as_mut().ok_or(VisionError::ModelNotReady)?;
            run(session, size, data)
        })
        .await
        .map_err(|e| VisionError::Extraction(e.to_string()))?
    }

    fn close(&self) {
        if let Ok(mut slot) = self.session.lock() {
            if slot.take().is_some() {
                info!("🗑️ ONNX session released");
            }
        }
    }
}
