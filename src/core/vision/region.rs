//! 区域归一化 - 裁剪检测框并 letterbox 到模型输入尺寸

use super::label::BoundingBox;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage, RgbaImage};

/// Square model input, RGB, black letterbox bars.
#[derive(Debug, Clone)]
pub struct RegionBuffer {
    pub image: RgbImage,
}

impl RegionBuffer {
    pub fn size(&self) -> u32 {
        self.image.width()
    }

    /// NCHW float tensor data scaled to [0, 1].
    pub fn to_chw_f32(&self) -> Vec<f32> {
        let (w, h) = self.image.dimensions();
        let plane = (w * h) as usize;
        let mut out = vec![0.0f32; plane * 3];
        for (i, pixel) in self.image.pixels().enumerate() {
            out[i] = pixel[0] as f32 / 255.0;
            out[plane + i] = pixel[1] as f32 / 255.0;
            out[2 * plane + i] = pixel[2] as f32 / 255.0;
        }
        out
    }

    pub fn mean_rgb(&self) -> [f32; 3] {
        let mut sum = [0u64; 3];
        for pixel in self.image.pixels() {
            for (total, channel) in sum.iter_mut().zip(&pixel.0[..3]) {
                *total += *channel as u64;
            }
        }
        let n = (self.image.width() * self.image.height()).max(1) as f32;
        [sum[0] as f32 / n, sum[1] as f32 / n, sum[2] as f32 / n]
    }
}

/// Integer crop rectangle inside a source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    /// Clamp a detector box to the source bounds. Width and height never drop
    /// below one pixel.
    pub fn clamp(bbox: &BoundingBox, source_width: u32, source_height: u32) -> Self {
        let sw = source_width.max(1) as f32;
        let sh = source_height.max(1) as f32;

        let x = bbox.x.max(0.0).min(sw - 1.0).floor();
        let y = bbox.y.max(0.0).min(sh - 1.0).floor();
        let width = bbox.width.min(sw - x).max(1.0).round();
        let height = bbox.height.min(sh - y).max(1.0).round();

        Self {
            x: x as u32,
            y: y as u32,
            width: width as u32,
            height: height as u32,
        }
    }

    pub fn full(source_width: u32, source_height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width: source_width.max(1),
            height: source_height.max(1),
        }
    }
}

/// Placement of the scaled region inside the square target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Letterbox {
    pub draw_width: u32,
    pub draw_height: u32,
    pub offset_x: u32,
    pub offset_y: u32,
}

impl Letterbox {
    pub fn fit(region_width: u32, region_height: u32, target: u32) -> Self {
        let aspect = region_width.max(1) as f32 / region_height.max(1) as f32;
        let t = target as f32;

        if aspect > 1.0 {
            let draw_height = ((t / aspect).round() as u32).clamp(1, target);
            Self {
                draw_width: target,
                draw_height,
                offset_x: 0,
                offset_y: (target - draw_height) / 2,
            }
        } else {
            let draw_width = ((t * aspect).round() as u32).clamp(1, target);
            Self {
                draw_width,
                draw_height: target,
                offset_x: (target - draw_width) / 2,
                offset_y: 0,
            }
        }
    }
}

/// Crop `bbox` (or the whole source) out of `source` and letterbox it into a
/// `target`×`target` buffer.
pub fn normalize_region(source: &RgbaImage, bbox: Option<&BoundingBox>, target: u32) -> RegionBuffer {
    let (sw, sh) = source.dimensions();
    let mut canvas = RgbImage::from_pixel(target, target, Rgb([0, 0, 0]));

    if sw == 0 || sh == 0 || target == 0 {
        return RegionBuffer { image: canvas };
    }

    let rect = match bbox {
        Some(b) => CropRect::clamp(b, sw, sh),
        None => CropRect::full(sw, sh),
    };
    let placement = Letterbox::fit(rect.width, rect.height, target);

    let region = imageops::crop_imm(source, rect.x, rect.y, rect.width, rect.height).to_image();
    let scaled = imageops::resize(
        &region,
        placement.draw_width,
        placement.draw_height,
        FilterType::Triangle,
    );

    for (x, y, pixel) in scaled.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        // transparent pixels composite onto the black background
        let alpha = a as u32;
        canvas.put_pixel(
            placement.offset_x + x,
            placement.offset_y + y,
            Rgb([
                (r as u32 * alpha / 255) as u8,
                (g as u32 * alpha / 255) as u8,
                (b as u32 * alpha / 255) as u8,
            ]),
        );
    }

    RegionBuffer { image: canvas }
}
