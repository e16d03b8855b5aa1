use thiserror::Error;

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("Model load failed: {0}")]
    ModelLoad(String),
    #[error("Embedding model not ready")]
    ModelNotReady,
    #[error("Feature extraction failed: {0}")]
    Extraction(String),
    #[error("Feature dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
    #[error("Matching cycle {epoch} superseded")]
    StaleCycle { epoch: u64 },
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
    #[error("Reference image error: {0}")]
    ReferenceImage(String),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Recent extraction failure for {key}, backing off")]
    BackoffActive { key: String },
    #[error("Session closed")]
    Closed,
}

impl VisionError {
    /// Expected outcomes that are not worth a warning in the logs.
    pub fn is_quiet(&self) -> bool {
        matches!(
            self,
            VisionError::StaleCycle { .. } | VisionError::ModelNotReady | VisionError::BackoffActive { .. }
        )
    }
}
