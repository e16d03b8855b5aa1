//! 检测框与 label 匹配 - 一个匹配周期
//!
//! For every detection, in detector order, the candidate labels (coarse tag
//! overlap, registration order) are scored one by one. The first candidate at
//! or above the threshold claims its label for the rest of the cycle and the
//! scan moves on to the next detection.

use super::config::MatcherConfig;
use super::embedding::{EmbeddingExtractor, FeatureVector};
use super::error::VisionError;
use super::feature_cache::LabelFeatureCache;
use super::frame::Frame;
use super::label::{candidate_labels, Detection, Label, MatchResult};
use super::recurrence::{RecurrenceEvent, RecurrenceTracker};
use super::region::{normalize_region, RegionBuffer};
use super::similarity::similarity;
use log::{debug, info};
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Epoch shared by every cycle of one scheduler. Only the cycle holding the
/// current epoch may write shared state, and it does so under `commit_lock`.
#[derive(Debug, Default)]
pub struct EpochState {
    current: AtomicU64,
    commit_lock: Mutex<()>,
}

impl EpochState {
    /// Start a new epoch, invalidating every outstanding token.
    pub fn advance(self: &Arc<Self>) -> CycleToken {
        let _commit = self.lock_commit();
        let epoch = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        CycleToken {
            epoch,
            state: Arc::clone(self),
        }
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    fn lock_commit(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.commit_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CycleToken {
    epoch: u64,
    state: Arc<EpochState>,
}

impl CycleToken {
    /// A token nobody else can supersede, for running a single cycle directly.
    pub fn standalone() -> Self {
        Arc::new(EpochState::default()).advance()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_live(&self) -> bool {
        self.state.current() == self.epoch
    }

    /// Run `apply` only if this cycle is still the live one. The check and the
    /// write happen under the commit lock, so a newer epoch cannot start in
    /// between.
    pub fn commit<R>(&self, apply: impl FnOnce() -> R) -> Result<R, VisionError> {
        let _commit = self.state.lock_commit();
        if self.state.current() != self.epoch {
            return Err(VisionError::StaleCycle { epoch: self.epoch });
        }
        Ok(apply())
    }

    fn ensure_live(&self) -> Result<(), VisionError> {
        if self.is_live() {
            Ok(())
        } else {
            Err(VisionError::StaleCycle { epoch: self.epoch })
        }
    }
}

/// Everything one cycle looks at. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MatchInput {
    pub frame: Arc<Frame>,
    pub detections: Arc<[Detection]>,
    pub labels: Arc<[Label]>,
}

impl MatchInput {
    pub fn new(frame: Frame, detections: Vec<Detection>, labels: Arc<[Label]>) -> Self {
        Self {
            frame: Arc::new(frame),
            detections: detections.into(),
            labels,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleOutcome {
    pub matches: Vec<MatchResult>,
    pub recurrences: Vec<RecurrenceEvent>,
}

/// State that outlives a single cycle.
pub struct MatchContext {
    pub config: MatcherConfig,
    pub extractor: Arc<EmbeddingExtractor>,
    pub cache: LabelFeatureCache,
    pub recurrence: RecurrenceTracker,
}

impl MatchContext {
    pub fn new(config: MatcherConfig, extractor: Arc<EmbeddingExtractor>) -> Self {
        Self {
            cache: LabelFeatureCache::with_backoff(config.cache_failure_backoff_ms),
            recurrence: RecurrenceTracker::new(config.recurrence_window_ms),
            config,
            extractor,
        }
    }
}

pub struct Matcher {
    ctx: MatchContext,
}

impl Matcher {
    pub fn new(ctx: MatchContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &MatchContext {
        &self.ctx
    }

    /// One matching cycle. Per-candidate failures score 0; only an invalid
    /// frame or a superseded token end the cycle early. Recurrence state is
    /// written once, at the end, and only while `token` is still live.
    pub async fn run_cycle(
        &self,
        input: &MatchInput,
        token: &CycleToken,
    ) -> Result<CycleOutcome, VisionError> {
        let matches = self.evaluate(input, token).await?;
        token.commit(|| self.record(matches, input.frame.timestamp_ms))
    }

    /// The read-only half of a cycle: scores every detection and returns the
    /// claims in detection order. Touches no shared state besides the
    /// write-once feature cache.
    pub async fn evaluate(&self, input: &MatchInput, token: &CycleToken) -> Result<Vec<MatchResult>, VisionError> {
        let mut matches = Vec::new();

        if input.detections.is_empty() || input.labels.is_empty() {
            return Ok(matches);
        }
        if !self.ctx.extractor.is_ready() {
            debug!("Embedding model not ready, skipping cycle {}", token.epoch());
            return Ok(matches);
        }

        let now_ms = input.frame.timestamp_ms;
        let input_size = self.ctx.config.input_size;
        let image = input.frame.to_image()?;

        let candidates: Vec<Vec<&Label>> = input
            .detections
            .iter()
            .map(|d| candidate_labels(d, &input.labels))
            .collect();

        // crops are pure, prepare them all up front
        let regions: Vec<Option<RegionBuffer>> = input
            .detections
            .par_iter()
            .zip(candidates.par_iter())
            .map(|(detection, labels)| {
                (!labels.is_empty()).then(|| normalize_region(&image, Some(&detection.bbox), input_size))
            })
            .collect();

        let mut claimed: HashSet<&str> = HashSet::new();

        for ((detection, labels), region) in input.detections.iter().zip(&candidates).zip(&regions) {
            let Some(region) = region else { continue };
            let mut detection_features: Option<FeatureVector> = None;

            for label in labels {
                if claimed.contains(label.id.as_str()) {
                    continue;
                }

                let score = self
                    .score_candidate(region, &mut detection_features, label, now_ms)
                    .await;
                token.ensure_live()?;

                // NaN never claims
                if !(score >= self.ctx.config.similarity_threshold) {
                    continue;
                }

                claimed.insert(label.id.as_str());
                matches.push(MatchResult {
                    label: (*label).clone(),
                    similarity: score,
                    detection: detection.clone(),
                });
                break;
            }
        }

        Ok(matches)
    }

    /// Apply a cycle's claims to the recurrence tracker, in claim order.
    /// Callers run this inside [`CycleToken::commit`].
    pub fn record(&self, matches: Vec<MatchResult>, now_ms: u64) -> CycleOutcome {
        let mut recurrences = Vec::new();
        for m in &matches {
            if self.ctx.recurrence.record_and_check(&m.label.id, now_ms) {
                info!("🔁 {} seen again within the recurrence window", m.label.name);
                recurrences.push(RecurrenceEvent::new(&m.label, now_ms, self.ctx.config.warning_display_ms));
            }
        }
        CycleOutcome { matches, recurrences }
    }

    async fn score_candidate(
        &self,
        region: &RegionBuffer,
        detection_features: &mut Option<FeatureVector>,
        label: &Label,
        now_ms: u64,
    ) -> f32 {
        let detected = match detection_features {
            Some(features) => features.clone(),
            None => match self.ctx.extractor.extract(region).await {
                Ok(features) => {
                    *detection_features = Some(features.clone());
                    features
                }
                Err(e) => {
                    debug!("Failed to extract features from detected region: {}", e);
                    return 0.0;
                }
            },
        };

        let reference = match self.label_features(label, now_ms).await {
            Ok(features) => features,
            Err(_) => return 0.0,
        };

        let score = similarity(&detected, &reference);
        if score > self.ctx.config.match_log_threshold {
            debug!("Visual match {}: {:.1}%", label.name, score * 100.0);
        }
        score
    }

    async fn label_features(&self, label: &Label, now_ms: u64) -> Result<FeatureVector, VisionError> {
        let extractor = &self.ctx.extractor;
        let input_size = self.ctx.config.input_size;
        let reference = &label.reference_image;

        self.ctx
            .cache
            .get_or_compute(reference, now_ms, move || async move {
                let image = reference.resolve_async().await?;
                let buffer = normalize_region(&image, None, input_size);
                extractor.extract(&buffer).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::vision::embedding::{EmbeddingModel, MockEmbeddingModel};
    use crate::core::vision::label::{BoundingBox, Category};
    use crate::core::vision::reference::ReferenceImage;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use image::{ImageOutputFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    const RED: [u8; 3] = [255, 0, 0];
    // cosine with red is about 0.4 after normalisation
    const OLIVE: [u8; 3] = [100, 230, 0];
    const BLUE: [u8; 3] = [0, 0, 255];

    fn data_url(color: [u8; 3]) -> String {
        let img = RgbaImage::from_pixel(8, 8, Rgba([color[0], color[1], color[2], 255]));
        let mut buffer = Cursor::new(Vec::new());
        img.write_to(&mut buffer, ImageOutputFormat::Png).unwrap();
        format!("data:image/png;base64,{}", STANDARD.encode(buffer.into_inner()))
    }

    fn label(id: &str, tags: &[&str], color: [u8; 3]) -> Label {
        Label {
            id: id.to_string(),
            name: id.to_string(),
            category: Category::Person,
            reference_image: ReferenceImage::new(data_url(color)),
            coarse_tags: tags.iter().map(|t| t.to_string()).collect(),
            last_seen_at_ms: None,
        }
    }

    fn solid_frame(color: [u8; 3], timestamp_ms: u64) -> Frame {
        let img = RgbaImage::from_pixel(320, 240, Rgba([color[0], color[1], color[2], 255]));
        Frame::from_image(&img, timestamp_ms, 1)
    }

    fn detection(class: &str, bbox: BoundingBox) -> Detection {
        Detection::new(class, 0.9, bbox)
    }

    fn matcher_with(model: Arc<MockEmbeddingModel>) -> Matcher {
        let extractor = Arc::new(EmbeddingExtractor::with_model(model as Arc<dyn EmbeddingModel>));
        Matcher::new(MatchContext::new(MatcherConfig::default(), extractor))
    }

    #[tokio::test]
    async fn test_dad_matches_above_threshold() {
        let matcher = matcher_with(Arc::new(MockEmbeddingModel::new()));
        let input = MatchInput::new(
            solid_frame(RED, 1_000),
            vec![detection("person", BoundingBox::new(10.0, 10.0, 100.0, 200.0))],
            vec![label("Dad", &["person"], RED)].into(),
        );

        let outcome = matcher.run_cycle(&input, &CycleToken::standalone()).await.unwrap();

        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].label.id, "Dad");
        assert!(outcome.matches[0].similarity >= 0.65);
        assert!(outcome.recurrences.is_empty());
        assert_eq!(matcher.context().recurrence.last_matched("Dad"), Some(1_000));
    }

    #[tokio::test]
    async fn test_low_similarity_yields_nothing() {
        let matcher = matcher_with(Arc::new(MockEmbeddingModel::new()));
        let input = MatchInput::new(
            solid_frame(OLIVE, 1_000),
            vec![detection("person", BoundingBox::new(10.0, 10.0, 100.0, 200.0))],
            vec![label("Dad", &["person"], RED)].into(),
        );

        let outcome = matcher.run_cycle(&input, &CycleToken::standalone()).await.unwrap();

        assert!(outcome.matches.is_empty());
        assert!(matcher.context().recurrence.is_empty());
    }

    #[tokio::test]
    async fn test_coarse_filter_skips_unrelated_labels() {
        let model = Arc::new(MockEmbeddingModel::new());
        let matcher = matcher_with(Arc::clone(&model));
        let input = MatchInput::new(
            solid_frame(RED, 0),
            vec![detection("dog", BoundingBox::new(0.0, 0.0, 50.0, 50.0))],
            vec![label("Cat", &["Cat", "feline"], RED)].into(),
        );

        let outcome = matcher.run_cycle(&input, &CycleToken::standalone()).await.unwrap();

        assert!(outcome.matches.is_empty());
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_label_claimed_once_per_cycle() {
        let matcher = matcher_with(Arc::new(MockEmbeddingModel::new()));
        let input = MatchInput::new(
            solid_frame(RED, 0),
            vec![
                detection("person", BoundingBox::new(0.0, 0.0, 50.0, 50.0)),
                detection("person", BoundingBox::new(100.0, 100.0, 50.0, 50.0)),
            ],
            vec![label("Mum", &["person"], RED), label("Dad", &["person"], RED)].into(),
        );

        let outcome = matcher.run_cycle(&input, &CycleToken::standalone()).await.unwrap();

        let ids: Vec<_> = outcome.matches.iter().map(|m| m.label.id.as_str()).collect();
        // first detection takes the first registered label, the second falls through
        assert_eq!(ids, vec!["Mum", "Dad"]);
        assert_eq!(outcome.matches[1].detection.bbox.x, 100.0);
    }

    #[tokio::test]
    async fn test_first_qualifying_candidate_wins() {
        let matcher = matcher_with(Arc::new(MockEmbeddingModel::new()));
        let input = MatchInput::new(
            solid_frame(RED, 0),
            vec![detection("cup", BoundingBox::new(0.0, 0.0, 60.0, 60.0))],
            vec![
                label("Blue mug", &["cup"], BLUE),
                label("Red mug", &["cup"], RED),
                label("Other red mug", &["cup"], RED),
            ]
            .into(),
        );

        let outcome = matcher.run_cycle(&input, &CycleToken::standalone()).await.unwrap();

        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].label.id, "Red mug");
    }

    #[tokio::test]
    async fn test_extraction_failure_is_non_match() {
        let matcher = matcher_with(Arc::new(MockEmbeddingModel::failing()));
        let input = MatchInput::new(
            solid_frame(RED, 0),
            vec![detection("person", BoundingBox::new(0.0, 0.0, 50.0, 50.0))],
            vec![label("Dad", &["person"], RED)].into(),
        );

        let outcome = matcher.run_cycle(&input, &CycleToken::standalone()).await.unwrap();
        assert!(outcome.matches.is_empty());
    }

    #[tokio::test]
    async fn test_broken_reference_is_non_match() {
        let matcher = matcher_with(Arc::new(MockEmbeddingModel::new()));
        let mut broken = label("Dad", &["person"], RED);
        broken.reference_image = ReferenceImage::new("data:image/png;base64,@@@");
        let input = MatchInput::new(
            solid_frame(RED, 0),
            vec![detection("person", BoundingBox::new(0.0, 0.0, 50.0, 50.0))],
            vec![broken.clone(), label("Mum", &["person"], RED)].into(),
        );

        let outcome = matcher.run_cycle(&input, &CycleToken::standalone()).await.unwrap();

        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].label.id, "Mum");
        assert_eq!(matcher.context().cache.failure_count(&broken.reference_image), 1);
    }

    #[tokio::test]
    async fn test_recurrence_across_cycles() {
        let matcher = matcher_with(Arc::new(MockEmbeddingModel::new()));
        let labels: Arc<[Label]> = vec![label("Keys", &["person"], RED)].into();
        let boxes = vec![detection("person", BoundingBox::new(0.0, 0.0, 50.0, 50.0))];

        let first = MatchInput::new(solid_frame(RED, 0), boxes.clone(), labels.clone());
        let second = MatchInput::new(solid_frame(RED, 10_000), boxes, labels);

        let token = CycleToken::standalone();
        let a = matcher.run_cycle(&first, &token).await.unwrap();
        let b = matcher.run_cycle(&second, &token).await.unwrap();

        assert!(a.recurrences.is_empty());
        assert_eq!(b.recurrences.len(), 1);
        assert_eq!(b.recurrences[0].label_id, "Keys");
        assert_eq!(b.recurrences[0].dismiss_at_ms, 15_000);
    }

    #[tokio::test]
    async fn test_stale_token_writes_nothing() {
        let matcher = matcher_with(Arc::new(MockEmbeddingModel::new()));
        let state = Arc::new(EpochState::default());
        let stale = state.advance();
        let _newer = state.advance();
        let input = MatchInput::new(
            solid_frame(RED, 0),
            vec![detection("person", BoundingBox::new(0.0, 0.0, 50.0, 50.0))],
            vec![label("Dad", &["person"], RED)].into(),
        );

        let result = matcher.run_cycle(&input, &stale).await;

        assert!(matches!(result, Err(VisionError::StaleCycle { epoch: 1 })));
        assert!(matcher.context().recurrence.is_empty());
    }

    #[tokio::test]
    async fn test_model_not_ready_is_quiet() {
        let extractor = Arc::new(EmbeddingExtractor::new());
        let matcher = Matcher::new(MatchContext::new(MatcherConfig::default(), extractor));
        let input = MatchInput::new(
            solid_frame(RED, 0),
            vec![detection("person", BoundingBox::new(0.0, 0.0, 50.0, 50.0))],
            vec![label("Dad", &["person"], RED)].into(),
        );

        let outcome = matcher.run_cycle(&input, &CycleToken::standalone()).await.unwrap();
        assert_eq!(outcome, CycleOutcome::default());
    }

    #[tokio::test]
    async fn test_reference_features_computed_once() {
        let model = Arc::new(MockEmbeddingModel::new());
        let matcher = matcher_with(Arc::clone(&model));
        let labels: Arc<[Label]> = vec![label("Dad", &["person"], BLUE)].into();
        let boxes = vec![detection("person", BoundingBox::new(0.0, 0.0, 50.0, 50.0))];
        let token = CycleToken::standalone();

        for ts in [0, 1_000, 2_000] {
            let input = MatchInput::new(solid_frame(RED, ts), boxes.clone(), labels.clone());
            matcher.run_cycle(&input, &token).await.unwrap();
        }

        // one reference embedding plus one region embedding per cycle
        assert_eq!(model.calls(), 4);
        assert_eq!(matcher.context().cache.len(), 1);
    }

    #[tokio::test]
    async fn test_nan_embedding_never_matches() {
        let matcher = matcher_with(Arc::new(MockEmbeddingModel::returning(vec![f32::NAN, 1.0, 0.0, 0.0])));
        let dad = label("Dad", &["person"], RED);
        matcher
            .context()
            .cache
            .insert(dad.reference_image.clone(), FeatureVector::from_raw(vec![0.0, 0.0, 1.0, 0.0]));
        let input = MatchInput::new(
            solid_frame(RED, 0),
            vec![detection("person", BoundingBox::new(0.0, 0.0, 50.0, 50.0))],
            vec![dad].into(),
        );

        let outcome = matcher.run_cycle(&input, &CycleToken::standalone()).await.unwrap();

        assert!(outcome.matches.is_empty());
        assert!(matcher.context().recurrence.is_empty());
    }

    /// Delegates to the colour mock and starts a new epoch on the given call.
    struct SupersedingModel {
        inner: MockEmbeddingModel,
        state: Arc<EpochState>,
        advance_on: usize,
    }

    #[async_trait::async_trait]
    impl EmbeddingModel for SupersedingModel {
        async fn infer(&self, input: &RegionBuffer) -> Result<Vec<f32>, VisionError> {
            let out = self.inner.infer(input).await;
            if self.inner.calls() == self.advance_on {
                let _ = self.state.advance();
            }
            out
        }
    }

    #[tokio::test]
    async fn test_superseded_mid_cycle_records_nothing() {
        let state = Arc::new(EpochState::default());
        let token = state.advance();
        // calls: first region, A's reference, second region
        let model = SupersedingModel {
            inner: MockEmbeddingModel::new(),
            state: Arc::clone(&state),
            advance_on: 3,
        };
        let extractor = Arc::new(EmbeddingExtractor::with_model(Arc::new(model) as Arc<dyn EmbeddingModel>));
        let matcher = Matcher::new(MatchContext::new(MatcherConfig::default(), extractor));
        let input = MatchInput::new(
            solid_frame(RED, 0),
            vec![
                detection("person", BoundingBox::new(0.0, 0.0, 50.0, 50.0)),
                detection("person", BoundingBox::new(100.0, 100.0, 50.0, 50.0)),
            ],
            vec![label("A", &["person"], RED), label("B", &["person"], RED)].into(),
        );

        let result = matcher.run_cycle(&input, &token).await;

        assert!(matches!(result, Err(VisionError::StaleCycle { epoch: 1 })));
        assert_eq!(matcher.context().recurrence.last_matched("A"), None);
        assert!(matcher.context().recurrence.is_empty());
    }
}
