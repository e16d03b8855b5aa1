use super::error::VisionError;
use image::RgbaImage;

/// 视频帧 (RGBA)
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>, // RGBA 格式
    /// Capture time, epoch milliseconds. Used as "now" for recurrence checks.
    pub timestamp_ms: u64,
    pub frame_number: u64,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>, timestamp_ms: u64, frame_number: u64) -> Self {
        Self {
            width,
            height,
            data,
            timestamp_ms,
            frame_number,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// A frame with no pixels or a short buffer is skipped, like a camera stream
    /// that has not produced its first picture yet.
    pub fn is_ready(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() == self.pixel_count() * 4
    }

    pub fn validate(&self) -> Result<(), VisionError> {
        if self.width == 0 || self.height == 0 {
            return Err(VisionError::InvalidFrame(format!(
                "empty frame {}x{}",
                self.width, self.height
            )));
        }
        let expected = self.pixel_count() * 4;
        if self.data.len() != expected {
            return Err(VisionError::InvalidFrame(format!(
                "expected {} RGBA bytes for {}x{}, got {}",
                expected,
                self.width,
                self.height,
                self.data.len()
            )));
        }
        Ok(())
    }

    pub fn to_image(&self) -> Result<RgbaImage, VisionError> {
        self.validate()?;
        RgbaImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| VisionError::InvalidFrame("buffer rejected by image".to_string()))
    }

    pub fn from_image(image: &RgbaImage, timestamp_ms: u64, frame_number: u64) -> Self {
        Self::new(
            image.width(),
            image.height(),
            image.as_raw().clone(),
            timestamp_ms,
            frame_number,
        )
    }
}

/// 从原生层传递的 YUV420 原始帧
#[derive(Debug)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub y_plane: Vec<u8>,
    pub u_plane: Vec<u8>,
    pub v_plane: Vec<u8>,
    pub timestamp_ms: u64,
    pub frame_number: u64,
}

impl RawFrame {
    pub fn to_rgba(&self) -> Result<Frame, VisionError> {
        let w = self.width as usize;
        let h = self.height as usize;
        let chroma_w = w.div_ceil(2);
        let chroma_len = chroma_w * h.div_ceil(2);

        if self.y_plane.len() < w * h
            || self.u_plane.len() < chroma_len
            || self.v_plane.len() < chroma_len
        {
            return Err(VisionError::InvalidFrame(format!(
                "YUV planes too small for {}x{} (y={}, u={}, v={})",
                w,
                h,
                self.y_plane.len(),
                self.u_plane.len(),
                self.v_plane.len()
            )));
        }

        let mut rgba = Vec::with_capacity(w * h * 4);
        for row in 0..h {
            let chroma_row = (row / 2) * chroma_w;
            for col in 0..w {
                let luma = self.y_plane[row * w + col] as f32;
                let uv_idx = chroma_row + col / 2;
                let u = self.u_plane[uv_idx] as f32 - 128.0;
                let v = self.v_plane[uv_idx] as f32 - 128.0;

                rgba.push((luma + 1.402 * v).clamp(0.0, 255.0) as u8);
                rgba.push((luma - 0.344136 * u - 0.714136 * v).clamp(0.0, 255.0) as u8);
                rgba.push((luma + 1.772 * u).clamp(0.0, 255.0) as u8);
                rgba.push(255);
            }
        }

        Ok(Frame::new(
            self.width,
            self.height,
            rgba,
            self.timestamp_ms,
            self.frame_number,
        ))
    }
}
