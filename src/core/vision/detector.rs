use super::error::VisionError;
use super::frame::Frame;
use super::label::Detection;
use async_trait::async_trait;

/// Coarse object detector. Boxes are in the frame's own pixel space.
#[async_trait]
pub trait ObjectDetector: Send + Sync {
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, VisionError>;
}

pub struct MockObjectDetector {
    // 按帧号返回预设检测结果
    script: Box<dyn Fn(u64) -> Vec<Detection> + Send + Sync>,
}

impl MockObjectDetector {
    pub fn new() -> Self {
        Self::with_pattern(|_| Vec::new())
    }

    pub fn with_pattern<F>(pattern: F) -> Self
    where
        F: Fn(u64) -> Vec<Detection> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(pattern),
        }
    }

    pub fn always(detections: Vec<Detection>) -> Self {
        Self::with_pattern(move |_| detections.clone())
    }
}

impl Default for MockObjectDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectDetector for MockObjectDetector {
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, VisionError> {
        if !frame.is_ready() {
            return Ok(Vec::new());
        }
        Ok((self.script)(frame.frame_number))
    }
}
