use crate::core::vision::{
    BoundingBox, Category, CycleReport, Detection, Frame, Label, MatchResult, ReferenceImage, VisionError,
};
use serde::{Deserialize, Serialize};

/// Dart 侧传入的 RGBA 帧
#[derive(Debug, Clone)]
pub struct FrameInput {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
    pub timestamp_ms: u64,
    pub frame_number: u64,
}

impl From<FrameInput> for Frame {
    fn from(input: FrameInput) -> Self {
        Frame::new(input.width, input.height, input.rgba, input.timestamp_ms, input.frame_number)
    }
}

/// 检测器输出的一个框
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionInput {
    pub class: String,
    pub score: f32,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl From<DetectionInput> for Detection {
    fn from(input: DetectionInput) -> Self {
        Detection::new(
            input.class,
            input.score,
            BoundingBox::new(input.x, input.y, input.width, input.height),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelInput {
    pub id: String,
    pub name: String,
    /// "person" 或 "object"
    pub category: String,
    /// data URL、http(s) 地址或本地路径
    pub image_data: String,
    pub detected_objects: Vec<String>,
    pub last_seen_at_ms: Option<u64>,
}

impl From<LabelInput> for Label {
    fn from(input: LabelInput) -> Self {
        let category = if input.category.eq_ignore_ascii_case("person") {
            Category::Person
        } else {
            Category::Object
        };
        Label {
            id: input.id,
            name: input.name,
            category,
            reference_image: ReferenceImage::new(input.image_data),
            coarse_tags: input.detected_objects,
            last_seen_at_ms: input.last_seen_at_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchDto {
    pub label_id: String,
    pub label_name: String,
    pub similarity: f32,
    pub class: String,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl From<MatchResult> for MatchDto {
    fn from(m: MatchResult) -> Self {
        Self {
            label_id: m.label.id,
            label_name: m.label.name,
            similarity: m.similarity,
            class: m.detection.class,
            x: m.detection.bbox.x,
            y: m.detection.bbox.y,
            width: m.detection.bbox.width,
            height: m.detection.bbox.height,
        }
    }
}

/// 重复出现提醒
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceWarning {
    pub label_id: String,
    pub label_name: String,
    pub matched_at_ms: u64,
    pub dismiss_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReportDto {
    pub epoch: u64,
    pub frame_number: u64,
    pub timestamp_ms: u64,
    pub matches: Vec<MatchDto>,
    pub warnings: Vec<RecurrenceWarning>,
}

impl From<CycleReport> for CycleReportDto {
    fn from(report: CycleReport) -> Self {
        Self {
            epoch: report.epoch,
            frame_number: report.frame_number,
            timestamp_ms: report.timestamp_ms,
            matches: report.matches.into_iter().map(MatchDto::from).collect(),
            warnings: report
                .recurrences
                .into_iter()
                .map(|e| RecurrenceWarning {
                    label_id: e.label_id,
                    label_name: e.label_name,
                    matched_at_ms: e.matched_at_ms,
                    dismiss_at_ms: e.dismiss_at_ms,
                })
                .collect(),
        }
    }
}

/// 会话统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub cycles_scheduled: u64,
    pub cycles_committed: u64,
    pub cycles_discarded: u64,
    pub cycles_failed: u64,
    pub matches_emitted: u64,
    pub warnings_emitted: u64,
    pub cached_features: u64,
    pub labels: u64,
    pub model_ready: bool,
}

/// FRB 友好的错误类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionApiError {
    pub error_type: String,
    pub message: String,
}

impl From<VisionError> for VisionApiError {
    fn from(e: VisionError) -> Self {
        let error_type = match &e {
            VisionError::ModelLoad(_) => "ModelLoad",
            VisionError::ModelNotReady => "ModelNotReady",
            VisionError::Extraction(_) => "Extraction",
            VisionError::DimensionMismatch { .. } => "DimensionMismatch",
            VisionError::StaleCycle { .. } => "StaleCycle",
            VisionError::InvalidFrame(_) => "InvalidFrame",
            VisionError::ReferenceImage(_) => "ReferenceImage",
            VisionError::Image(_) => "Image",
            VisionError::Http(_) => "Http",
            VisionError::Io(_) => "Io",
            VisionError::Config(_) => "Config",
            VisionError::BackoffActive { .. } => "BackoffActive",
            VisionError::Closed => "Closed",
        };
        Self {
            error_type: error_type.to_string(),
            message: e.to_string(),
        }
    }
}

impl std::fmt::Display for VisionApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.error_type, self.message)
    }
}

impl std::error::Error for VisionApiError {}
