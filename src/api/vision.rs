//! 视觉辅助会话 - 标签识别 + 重复出现提醒

use crate::api::models::vision::{
    CycleReportDto, DetectionInput, FrameInput, LabelInput, RecurrenceWarning, SessionStats, VisionApiError,
};
use crate::core::vision::{
    coarse_tags_from_detections, CycleReport, Detection, EmbeddingExtractor, EmbeddingModelProvider, Frame,
    InMemoryLabelRegistry, Label, LabelRegistry, MatchContext, MatchInput, MatchScheduler, Matcher, MatcherConfig,
    ModelState, ObjectDetector, RawFrame, RecurrenceEvent, Upsert, VisionError,
};
use flutter_rust_bridge::frb;
use log::{debug, error, info};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

/// 视觉辅助会话 - 每个相机画面一个
///
/// ```dart
/// final session = ElderVisionSession.create();
/// session.loadOnnxModel(modelPath: path);
/// session.setLabels(labels: labels);
/// session.submitFrame(frame: frame, detections: boxes);
/// final reports = session.pollReports();
/// ```
#[frb(opaque)]
pub struct ElderVisionSession {
    runtime: Option<Runtime>,
    config: MatcherConfig,
    matcher: Arc<Matcher>,
    registry: Arc<InMemoryLabelRegistry>,
    scheduler: MatchScheduler,
    detector: Mutex<Option<Arc<dyn ObjectDetector>>>,
    // held across next_report's wait, so not a std mutex
    reports: AsyncMutex<mpsc::UnboundedReceiver<CycleReport>>,
    warnings: Mutex<Vec<RecurrenceEvent>>,
    warnings_emitted: AtomicU64,
    last_frame_ms: AtomicU64,
}

impl ElderVisionSession {
    /// 创建会话，config_json5 为空时使用默认参数
    #[frb(sync)]
    pub fn create(config_json5: Option<String>) -> Result<Self, VisionApiError> {
        crate::init_logging();

        let config = match config_json5 {
            Some(text) => MatcherConfig::from_json5(&text)?,
            None => MatcherConfig::default(),
        };
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("elder-vision")
            .enable_time()
            .build()
            .map_err(VisionError::from)?;

        let extractor = Arc::new(EmbeddingExtractor::new());
        let matcher = Arc::new(Matcher::new(MatchContext::new(config.clone(), extractor)));
        let registry = Arc::new(InMemoryLabelRegistry::default());
        let (scheduler, reports) = MatchScheduler::new(Arc::clone(&matcher), &config, runtime.handle().clone());
        let scheduler = scheduler.with_registry(Arc::clone(&registry) as Arc<dyn LabelRegistry>);

        info!(
            "👁️ ElderVisionSession: created (threshold {:.2}, window {}ms)",
            config.similarity_threshold, config.recurrence_window_ms
        );
        Ok(Self {
            runtime: Some(runtime),
            config,
            matcher,
            registry,
            scheduler,
            detector: Mutex::new(None),
            reports: AsyncMutex::new(reports),
            warnings: Mutex::new(Vec::new()),
            warnings_emitted: AtomicU64::new(0),
            last_frame_ms: AtomicU64::new(0),
        })
    }

    /// 后台加载 ONNX 特征模型，进度通过 model_state 查询
    #[cfg(feature = "onnx")]
    #[frb(sync)]
    pub fn load_onnx_model(&self, model_path: String) -> Result<(), VisionApiError> {
        info!("🧠 Loading ONNX model from {}", model_path);
        let provider = crate::core::vision::OnnxEmbeddingProvider::from_file(model_path);
        self.attach_provider(Arc::new(provider))
    }

    /// Load the embedding model in the background, then warm the label cache.
    #[frb(ignore)]
    pub fn attach_provider(&self, provider: Arc<dyn EmbeddingModelProvider>) -> Result<(), VisionApiError> {
        let runtime = self.runtime()?;
        let matcher = Arc::clone(&self.matcher);
        let registry = Arc::clone(&self.registry);
        let input_size = self.config.input_size;
        let now_ms = self.last_frame_ms.load(Ordering::Relaxed);

        runtime.spawn(async move {
            let ctx = matcher.context();
            if ctx.extractor.load(provider.as_ref()).await.is_err() {
                // already logged, matching stays off for this session
                return;
            }
            let labels = registry.labels();
            let ready = ctx.cache.warm_up(&labels, &ctx.extractor, input_size, now_ms).await;
            info!("✅ {}/{} label features ready", ready, labels.len());
        });
        Ok(())
    }

    #[frb(sync, getter)]
    pub fn model_state(&self) -> ModelState {
        self.matcher.context().extractor.state()
    }

    /// 替换全部标签（保持注册顺序）
    #[frb(sync)]
    pub fn set_labels(&self, labels: Vec<LabelInput>) {
        self.replace_labels(labels.into_iter().map(Label::from).collect());
    }

    /// 以存储格式（imageData / detectedObjects / lastSeenAt）导入标签
    #[frb(sync)]
    pub fn set_labels_json(&self, json: String) -> Result<(), VisionApiError> {
        let labels: Vec<Label> =
            serde_json::from_str(&json).map_err(|e| VisionError::Config(format!("invalid labels: {}", e)))?;
        self.replace_labels(labels);
        Ok(())
    }

    /// 导出标签（含最新 lastSeenAt）供宿主持久化
    #[frb(sync)]
    pub fn labels_json(&self) -> Result<String, VisionApiError> {
        serde_json::to_string(&*self.registry.labels())
            .map_err(|e| VisionError::Config(format!("serialize labels: {}", e)).into())
    }

    #[frb(sync)]
    pub fn upsert_label(&self, label: LabelInput) -> Upsert {
        let label = Label::from(label);
        let previous = self.registry.get(&label.id);
        let outcome = self.registry.upsert(label);
        if let (Upsert::ImageChanged, Some(previous)) = (outcome, previous) {
            self.matcher.context().cache.invalidate(&previous.reference_image);
            debug!("Reference image changed for {}, cache entry dropped", previous.id);
        }
        self.spawn_warm_up();
        outcome
    }

    /// 提交一帧及其检测结果，取代尚未完成的匹配周期
    #[frb(sync)]
    pub fn submit_frame(&self, frame: FrameInput, detections: Vec<DetectionInput>) -> Result<u64, VisionApiError> {
        self.submit(Frame::from(frame), detections)
    }

    #[frb(sync)]
    pub fn submit_yuv_frame(&self, frame: RawFrame, detections: Vec<DetectionInput>) -> Result<u64, VisionApiError> {
        let frame = frame.to_rgba()?;
        self.submit(frame, detections)
    }

    /// 使用内置检测器：之后可直接 submit_camera_frame
    #[frb(ignore)]
    pub fn attach_detector(&self, detector: Arc<dyn ObjectDetector>) {
        *lock(&self.detector) = Some(detector);
        info!("📷 Object detector attached");
    }

    /// 提交一帧，由已挂载的检测器在匹配周期内检测
    #[frb(sync)]
    pub fn submit_camera_frame(&self, frame: FrameInput) -> Result<u64, VisionApiError> {
        let detector = lock(&self.detector)
            .clone()
            .ok_or_else(|| VisionError::Config("no object detector attached".to_string()))?;
        let frame = Frame::from(frame);
        frame.validate()?;
        self.last_frame_ms.fetch_max(frame.timestamp_ms, Ordering::Relaxed);
        Ok(self.scheduler.schedule_frame(frame, self.registry.labels(), detector)?)
    }

    /// 取出所有已完成周期的结果（非阻塞）；next_report 正在等待时返回空
    #[frb(sync)]
    pub fn poll_reports(&self) -> Vec<CycleReportDto> {
        let mut drained = Vec::new();
        if let Ok(mut rx) = self.reports.try_lock() {
            while let Ok(report) = rx.try_recv() {
                drained.push(report);
            }
        }
        drained.into_iter().map(|r| self.absorb(r)).collect()
    }

    /// 等待下一个周期结果，超时返回 None
    #[frb]
    pub fn next_report(&self, timeout_ms: u64) -> Option<CycleReportDto> {
        let runtime = self.runtime().ok()?;
        let received = runtime.block_on(tokio::time::timeout(Duration::from_millis(timeout_ms), async {
            self.reports.lock().await.recv().await
        }));
        match received {
            Ok(Some(report)) => Some(self.absorb(report)),
            _ => None,
        }
    }

    /// 当前应显示的提醒
    #[frb(sync)]
    pub fn active_warnings(&self, now_ms: u64) -> Vec<RecurrenceWarning> {
        let mut warnings = lock(&self.warnings);
        warnings.retain(|w| w.dismiss_at_ms > now_ms);
        warnings
            .iter()
            .filter(|w| w.is_visible(now_ms))
            .map(|w| RecurrenceWarning {
                label_id: w.label_id.clone(),
                label_name: w.label_name.clone(),
                matched_at_ms: w.matched_at_ms,
                dismiss_at_ms: w.dismiss_at_ms,
            })
            .collect()
    }

    #[frb(sync, getter)]
    pub fn stats(&self) -> SessionStats {
        let scheduler = self.scheduler.stats();
        SessionStats {
            cycles_scheduled: scheduler.cycles_scheduled,
            cycles_committed: scheduler.cycles_committed,
            cycles_discarded: scheduler.cycles_discarded,
            cycles_failed: scheduler.cycles_failed,
            matches_emitted: scheduler.matches_emitted,
            warnings_emitted: self.warnings_emitted.load(Ordering::Relaxed),
            cached_features: self.matcher.context().cache.len() as u64,
            labels: self.registry.labels().len() as u64,
            model_ready: self.matcher.context().extractor.is_ready(),
        }
    }

    /// 停止匹配并释放模型；之后提交帧会返回 Closed
    #[frb(sync)]
    pub fn close(&self) {
        self.scheduler.shutdown();
        self.matcher.context().extractor.close();
    }

    fn runtime(&self) -> Result<&Runtime, VisionError> {
        self.runtime.as_ref().ok_or(VisionError::Closed)
    }

    fn submit(&self, frame: Frame, detections: Vec<DetectionInput>) -> Result<u64, VisionApiError> {
        frame.validate()?;
        self.last_frame_ms.fetch_max(frame.timestamp_ms, Ordering::Relaxed);
        let detections: Vec<Detection> = detections.into_iter().map(Detection::from).collect();
        let input = MatchInput::new(frame, detections, self.registry.labels());
        Ok(self.scheduler.schedule(input)?)
    }

    fn replace_labels(&self, labels: Vec<Label>) {
        let kept: HashSet<_> = labels.iter().map(|l| l.reference_image.clone()).collect();
        for old in self.registry.labels().iter() {
            if !kept.contains(&old.reference_image) {
                self.matcher.context().cache.invalidate(&old.reference_image);
            }
        }
        info!("🏷️ {} labels registered", labels.len());
        self.registry.replace_all(labels);
        self.spawn_warm_up();
    }

    fn spawn_warm_up(&self) {
        let Ok(runtime) = self.runtime() else { return };
        if !self.matcher.context().extractor.is_ready() {
            // model load warms the cache once it finishes
            return;
        }
        let matcher = Arc::clone(&self.matcher);
        let labels = self.registry.labels();
        let input_size = self.config.input_size;
        let now_ms = self.last_frame_ms.load(Ordering::Relaxed);
        runtime.spawn(async move {
            let ctx = matcher.context();
            ctx.cache.warm_up(&labels, &ctx.extractor, input_size, now_ms).await;
        });
    }

    fn absorb(&self, report: CycleReport) -> CycleReportDto {
        if !report.recurrences.is_empty() {
            self.warnings_emitted
                .fetch_add(report.recurrences.len() as u64, Ordering::Relaxed);
            for event in &report.recurrences {
                info!("⚠️ {} appeared again", event.label_name);
            }
            lock(&self.warnings).extend(report.recurrences.iter().cloned());
        }
        CycleReportDto::from(report)
    }
}

impl Drop for ElderVisionSession {
    fn drop(&mut self) {
        self.close();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        info!("🗑️ ElderVisionSession: released");
    }
}

/// 从参考照片的检测结果生成 coarse tags（按首次出现去重）
#[frb(sync)]
pub fn derive_coarse_tags(detections: Vec<DetectionInput>) -> Vec<String> {
    let detections: Vec<Detection> = detections.into_iter().map(Detection::from).collect();
    coarse_tags_from_detections(&detections)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!("❌ Session lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}
