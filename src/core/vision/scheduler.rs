//! 匹配周期调度 - 防抖 + 节流
//!
//! Every new detection result bumps the epoch and replaces the in-flight
//! cycle. Cycles start at least `min_cycle_interval_ms` apart, and only a
//! cycle whose epoch is still current may publish a report.

use super::config::{MatcherConfig, MIN_CYCLE_INTERVAL_MS};
use super::detector::ObjectDetector;
use super::error::VisionError;
use super::frame::Frame;
use super::label::{Label, MatchResult};
use super::matcher::{CycleToken, EpochState, MatchInput, Matcher};
use super::recurrence::RecurrenceEvent;
use super::registry::LabelRegistry;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// What a committed cycle publishes.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub epoch: u64,
    pub frame_number: u64,
    pub timestamp_ms: u64,
    pub matches: Vec<MatchResult>,
    pub recurrences: Vec<RecurrenceEvent>,
}

/// 调度统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub cycles_scheduled: u64,
    pub cycles_started: u64,
    pub cycles_committed: u64,
    /// Superseded before or during the run.
    pub cycles_discarded: u64,
    pub cycles_failed: u64,
    pub matches_emitted: u64,
    pub recurrences_emitted: u64,
}

#[derive(Default)]
struct Counters {
    scheduled: AtomicU64,
    started: AtomicU64,
    committed: AtomicU64,
    discarded: AtomicU64,
    failed: AtomicU64,
    matches: AtomicU64,
    recurrences: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            cycles_scheduled: self.scheduled.load(Ordering::Relaxed),
            cycles_started: self.started.load(Ordering::Relaxed),
            cycles_committed: self.committed.load(Ordering::Relaxed),
            cycles_discarded: self.discarded.load(Ordering::Relaxed),
            cycles_failed: self.failed.load(Ordering::Relaxed),
            matches_emitted: self.matches.load(Ordering::Relaxed),
            recurrences_emitted: self.recurrences.load(Ordering::Relaxed),
        }
    }
}

/// Counts the cycle as discarded unless it settles. Lives inside the task
/// future, so an abort (even before the first poll) still drops it.
struct Settle {
    counters: Arc<Counters>,
    settled: bool,
}

impl Settle {
    fn new(counters: Arc<Counters>) -> Self {
        Self {
            counters,
            settled: false,
        }
    }

    fn done(&mut self) {
        self.settled = true;
    }
}

impl Drop for Settle {
    fn drop(&mut self) {
        if !self.settled {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Where a cycle's detections come from.
enum CycleSource {
    Detected(MatchInput),
    /// Run the detector on the frame first, inside the cycle.
    Camera {
        frame: Arc<Frame>,
        labels: Arc<[Label]>,
        detector: Arc<dyn ObjectDetector>,
    },
}

impl CycleSource {
    async fn into_input(self) -> Result<MatchInput, VisionError> {
        match self {
            CycleSource::Detected(input) => Ok(input),
            CycleSource::Camera { frame, labels, detector } => {
                let detections = detector.detect(&frame).await?;
                Ok(MatchInput {
                    frame,
                    detections: detections.into(),
                    labels,
                })
            }
        }
    }
}

struct CycleTask {
    matcher: Arc<Matcher>,
    registry: Option<Arc<dyn LabelRegistry>>,
    last_start: Arc<Mutex<Option<Instant>>>,
    reports: mpsc::UnboundedSender<CycleReport>,
    counters: Arc<Counters>,
    min_interval: Duration,
}

impl CycleTask {
    async fn run(self, source: CycleSource, token: CycleToken, mut settle: Settle) {
        let start_at = lock(&self.last_start).map(|last| last + self.min_interval);
        if let Some(at) = start_at {
            sleep_until(at).await;
        }

        // claim the start slot only while still current
        if token.commit(|| *lock(&self.last_start) = Some(Instant::now())).is_err() {
            return;
        }
        self.counters.started.fetch_add(1, Ordering::Relaxed);
        debug!("▶️ Matching cycle {} started", token.epoch());

        let evaluated = match source.into_input().await {
            Ok(input) => self.matcher.evaluate(&input, &token).await.map(|m| (input, m)),
            Err(e) => Err(e),
        };
        let (input, matches) = match evaluated {
            Ok(evaluated) => evaluated,
            Err(e) if e.is_quiet() => {
                debug!("Cycle {} dropped: {}", token.epoch(), e);
                return;
            }
            Err(e) => {
                warn!("⚠️ Matching cycle {} failed: {}", token.epoch(), e);
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                settle.done();
                return;
            }
        };

        let published = token.commit(|| {
            let outcome = self.matcher.record(matches, input.frame.timestamp_ms);
            let report = CycleReport {
                epoch: token.epoch(),
                frame_number: input.frame.frame_number,
                timestamp_ms: input.frame.timestamp_ms,
                matches: outcome.matches,
                recurrences: outcome.recurrences,
            };

            if let Some(registry) = &self.registry {
                for m in &report.matches {
                    if let Err(e) = registry.touch_last_seen(&m.label.id, report.timestamp_ms) {
                        warn!("⚠️ Failed to update lastSeenAt for {}: {}", m.label.id, e);
                    }
                }
            }

            // counted before the report is visible to the receiver
            self.counters.committed.fetch_add(1, Ordering::Relaxed);
            self.counters.matches.fetch_add(report.matches.len() as u64, Ordering::Relaxed);
            self.counters.recurrences.fetch_add(report.recurrences.len() as u64, Ordering::Relaxed);

            let epoch = report.epoch;
            if self.reports.send(report).is_err() {
                debug!("Report receiver gone, dropping cycle {}", epoch);
            }
        });

        if published.is_ok() {
            settle.done();
        }
    }
}

pub struct MatchScheduler {
    matcher: Arc<Matcher>,
    registry: Option<Arc<dyn LabelRegistry>>,
    epochs: Arc<EpochState>,
    last_start: Arc<Mutex<Option<Instant>>>,
    in_flight: Mutex<Option<JoinHandle<()>>>,
    reports: mpsc::UnboundedSender<CycleReport>,
    counters: Arc<Counters>,
    min_interval: Duration,
    closed: AtomicBool,
    runtime: Handle,
}

impl MatchScheduler {
    /// Cycles are spawned on `runtime`; reports arrive on the returned receiver.
    pub fn new(
        matcher: Arc<Matcher>,
        config: &MatcherConfig,
        runtime: Handle,
    ) -> (Self, mpsc::UnboundedReceiver<CycleReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let interval_ms = config.min_cycle_interval_ms.max(MIN_CYCLE_INTERVAL_MS);
        let scheduler = Self {
            matcher,
            registry: None,
            epochs: Arc::new(EpochState::default()),
            last_start: Arc::new(Mutex::new(None)),
            in_flight: Mutex::new(None),
            reports: tx,
            counters: Arc::new(Counters::default()),
            min_interval: Duration::from_millis(interval_ms),
            closed: AtomicBool::new(false),
            runtime,
        };
        (scheduler, rx)
    }

    /// Write `lastSeenAt` back to this registry for every committed match.
    pub fn with_registry(mut self, registry: Arc<dyn LabelRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn matcher(&self) -> &Arc<Matcher> {
        &self.matcher
    }

    /// Replace whatever cycle is pending or running with one over `input`.
    /// Returns the new cycle's epoch.
    pub fn schedule(&self, input: MatchInput) -> Result<u64, VisionError> {
        self.spawn_cycle(CycleSource::Detected(input))
    }

    /// Like [`schedule`](Self::schedule), but the cycle runs `detector` on
    /// `frame` itself. A superseded cycle stops before matching.
    pub fn schedule_frame(
        &self,
        frame: Frame,
        labels: Arc<[Label]>,
        detector: Arc<dyn ObjectDetector>,
    ) -> Result<u64, VisionError> {
        self.spawn_cycle(CycleSource::Camera {
            frame: Arc::new(frame),
            labels,
            detector,
        })
    }

    fn spawn_cycle(&self, source: CycleSource) -> Result<u64, VisionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VisionError::Closed);
        }

        let mut in_flight = lock(&self.in_flight);
        let token = self.epochs.advance();
        if let Some(previous) = in_flight.take() {
            previous.abort();
        }
        self.counters.scheduled.fetch_add(1, Ordering::Relaxed);

        let epoch = token.epoch();
        let task = CycleTask {
            matcher: Arc::clone(&self.matcher),
            registry: self.registry.clone(),
            last_start: Arc::clone(&self.last_start),
            reports: self.reports.clone(),
            counters: Arc::clone(&self.counters),
            min_interval: self.min_interval,
        };
        let settle = Settle::new(Arc::clone(&self.counters));
        *in_flight = Some(self.runtime.spawn(task.run(source, token, settle)));
        Ok(epoch)
    }

    pub fn current_epoch(&self) -> u64 {
        self.epochs.current()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.counters.snapshot()
    }

    /// Invalidate and cancel the in-flight cycle; later `schedule` calls fail.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut in_flight = lock(&self.in_flight);
        self.epochs.advance();
        if let Some(handle) = in_flight.take() {
            handle.abort();
        }
        info!("🛑 MatchScheduler: shut down");
    }
}

impl Drop for MatchScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::vision::detector::MockObjectDetector;
    use crate::core::vision::embedding::{EmbeddingExtractor, FeatureVector, MockEmbeddingModel};
    use crate::core::vision::label::{BoundingBox, Category, Detection};
    use crate::core::vision::matcher::MatchContext;
    use crate::core::vision::reference::ReferenceImage;
    use crate::core::vision::registry::InMemoryLabelRegistry;
    use image::{Rgba, RgbaImage};

    fn dad() -> Label {
        Label {
            id: "Dad".to_string(),
            name: "Dad".to_string(),
            category: Category::Person,
            reference_image: ReferenceImage::new("ref://dad"),
            coarse_tags: vec!["person".to_string()],
            last_seen_at_ms: None,
        }
    }

    fn matcher(latency_ms: u64) -> Arc<Matcher> {
        let model = Arc::new(MockEmbeddingModel::with_latency(Duration::from_millis(latency_ms)));
        let extractor = Arc::new(EmbeddingExtractor::with_model(model));
        let matcher = Matcher::new(MatchContext::new(MatcherConfig::default(), extractor));
        // skip reference decoding, the cycle only runs region inference
        matcher.context().cache.insert(
            dad().reference_image,
            FeatureVector::from_raw(MockEmbeddingModel::embed_color([255.0, 0.0, 0.0])),
        );
        Arc::new(matcher)
    }

    fn input(frame_number: u64, timestamp_ms: u64) -> MatchInput {
        let img = RgbaImage::from_pixel(64, 64, Rgba([255, 0, 0, 255]));
        MatchInput::new(
            Frame::from_image(&img, timestamp_ms, frame_number),
            vec![Detection::new("person", 0.9, BoundingBox::new(0.0, 0.0, 32.0, 32.0))],
            vec![dad()].into(),
        )
    }

    fn scheduler(matcher: Arc<Matcher>) -> (MatchScheduler, mpsc::UnboundedReceiver<CycleReport>) {
        MatchScheduler::new(matcher, &MatcherConfig::default(), Handle::current())
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_keeps_latest() {
        let (scheduler, mut rx) = scheduler(matcher(100));

        scheduler.schedule(input(1, 0)).unwrap();
        scheduler.schedule(input(2, 100)).unwrap();

        let report = rx.recv().await.unwrap();
        assert_eq!(report.frame_number, 2);
        assert_eq!(report.matches.len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());

        let stats = scheduler.stats();
        assert_eq!(stats.cycles_scheduled, 2);
        assert_eq!(stats.cycles_committed, 1);
        assert_eq!(stats.cycles_discarded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_cycle_leaves_no_trace() {
        let matcher = matcher(200);
        let (scheduler, mut rx) = scheduler(Arc::clone(&matcher));

        scheduler.schedule(input(1, 0)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.stats().cycles_started, 1);

        scheduler.schedule(input(2, 10_000)).unwrap();
        let report = rx.recv().await.unwrap();

        assert_eq!(report.frame_number, 2);
        // the first cycle never reached its recurrence update
        assert!(report.recurrences.is_empty());
        assert_eq!(matcher.context().recurrence.last_matched("Dad"), Some(10_000));
        assert_eq!(scheduler.stats().cycles_discarded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_respect_min_interval() {
        let (scheduler, mut rx) = scheduler(matcher(10));
        let t0 = Instant::now();

        scheduler.schedule(input(1, 0)).unwrap();
        rx.recv().await.unwrap();
        assert!(t0.elapsed() < Duration::from_millis(500));

        scheduler.schedule(input(2, 1_000)).unwrap();
        rx.recv().await.unwrap();
        assert!(t0.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurrence_reported_on_second_sighting() {
        let (scheduler, mut rx) = scheduler(matcher(10));

        scheduler.schedule(input(1, 0)).unwrap();
        let first = rx.recv().await.unwrap();
        scheduler.schedule(input(2, 10_000)).unwrap();
        let second = rx.recv().await.unwrap();

        assert!(first.recurrences.is_empty());
        assert_eq!(second.recurrences.len(), 1);
        assert_eq!(second.recurrences[0].label_name, "Dad");
        assert_eq!(scheduler.stats().recurrences_emitted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_last_seen_updated_on_commit() {
        let registry = Arc::new(InMemoryLabelRegistry::new(vec![dad()]));
        let (scheduler, mut rx) = scheduler(matcher(10));
        let scheduler = scheduler.with_registry(registry.clone());

        scheduler.schedule(input(7, 4_200)).unwrap();
        rx.recv().await.unwrap();

        assert_eq!(registry.get("Dad").unwrap().last_seen_at_ms, Some(4_200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_and_rejects() {
        let (scheduler, mut rx) = scheduler(matcher(100));

        scheduler.schedule(input(1, 0)).unwrap();
        scheduler.shutdown();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(rx.try_recv().is_err());
        assert!(matches!(scheduler.schedule(input(2, 0)), Err(VisionError::Closed)));
        assert_eq!(scheduler.stats().cycles_committed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_visible_with_report() {
        let (scheduler, mut rx) = scheduler(matcher(10));

        scheduler.schedule(input(1, 0)).unwrap();
        rx.recv().await.unwrap();

        let stats = scheduler.stats();
        assert_eq!(stats.cycles_committed, 1);
        assert_eq!(stats.matches_emitted, 1);
    }

    fn red_frame(frame_number: u64, timestamp_ms: u64) -> Frame {
        let img = RgbaImage::from_pixel(64, 64, Rgba([255, 0, 0, 255]));
        Frame::from_image(&img, timestamp_ms, frame_number)
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_cycle_runs_detector() {
        let (scheduler, mut rx) = scheduler(matcher(10));
        let detector = Arc::new(MockObjectDetector::always(vec![Detection::new(
            "person",
            0.9,
            BoundingBox::new(0.0, 0.0, 32.0, 32.0),
        )]));

        scheduler
            .schedule_frame(red_frame(3, 500), vec![dad()].into(), detector)
            .unwrap();
        let report = rx.recv().await.unwrap();

        assert_eq!(report.frame_number, 3);
        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.matches[0].detection.class, "person");
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_cycle_without_detections_reports_empty() {
        let (scheduler, mut rx) = scheduler(matcher(10));

        scheduler
            .schedule_frame(red_frame(4, 0), vec![dad()].into(), Arc::new(MockObjectDetector::new()))
            .unwrap();
        let report = rx.recv().await.unwrap();

        assert!(report.matches.is_empty());
        assert_eq!(scheduler.stats().cycles_committed, 1);
    }
}
