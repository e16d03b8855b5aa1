pub mod config;
pub mod detector;
pub mod embedding;
pub mod error;
pub mod feature_cache;
pub mod frame;
pub mod label;
pub mod matcher;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod recurrence;
pub mod reference;
pub mod region;
pub mod registry;
pub mod scheduler;
pub mod similarity;

pub use config::{MatcherConfig, MIN_CYCLE_INTERVAL_MS};
pub use detector::{MockObjectDetector, ObjectDetector};
pub use embedding::{
    EmbeddingExtractor, EmbeddingModel, EmbeddingModelProvider, FeatureVector, MockEmbeddingModel,
    MockEmbeddingProvider, ModelState,
};
pub use error::VisionError;
pub use feature_cache::LabelFeatureCache;
pub use frame::{Frame, RawFrame};
pub use label::{
    candidate_labels, coarse_tags_from_detections, BoundingBox, Category, Detection, Label, MatchResult,
};
pub use matcher::{CycleOutcome, CycleToken, EpochState, MatchContext, MatchInput, Matcher};
#[cfg(feature = "onnx")]
pub use onnx::{OnnxEmbeddingModel, OnnxEmbeddingProvider};
pub use recurrence::{RecurrenceEvent, RecurrenceTracker};
pub use reference::ReferenceImage;
pub use region::{normalize_region, RegionBuffer};
pub use registry::{InMemoryLabelRegistry, LabelRegistry, Upsert};
pub use scheduler::{CycleReport, MatchScheduler, SchedulerStats};
pub use similarity::{similarity, try_similarity};
