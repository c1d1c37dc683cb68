//! Per-source detection pipeline.
//!
//! One pipeline owns one source for its whole life and moves through
//! `Connecting → Running → (Draining) → Terminated`:
//!
//! - `Connecting`: classify the address, load the detector, open the source.
//!   Stream sources race a bounded connect. Any failure goes straight to
//!   `Terminated`.
//! - `Running`: acquire a frame, run the detector, keep candidates above the
//!   confidence threshold, fuse them and hand the frame's objects to the sink.
//!   Image sources run one iteration.
//! - `Draining`: process-wide shutdown was requested between two frames.
//! - `Terminated`: the source is closed and the detector dropped, on every exit
//!   path.

use anyhow::{anyhow, Result};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::alert::AlertDispatcher;
use crate::catalog::{Catalog, DetectionEvent};
use crate::detect::{raw_detections, BlobParams, DetectorBackend};
use crate::frame::Frame;
use crate::fusion::{
    classify, fuse, BoundingBox, Candidate, DetectedObject, DEFAULT_OVERLAP_THRESHOLD,
};
use crate::ingest::{ConnectOutcome, FrameRead, FrameSource, SourceKind, SourceOpener};
use crate::labels::ClassLabels;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.75;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Connecting,
    Running,
    Draining,
    Terminated,
}

/// Why a pipeline reached `Terminated`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// Video or stream ran out of frames.
    EndOfInput,
    /// Single pass over an image source completed.
    ImageProcessed,
    /// The renderer asked to stop.
    Cancelled,
    /// Process-wide shutdown.
    Shutdown,
    ConnectTimedOut,
    ConnectFailed,
    UnsupportedSource,
    ModelLoadFailed,
    /// Too many consecutive read failures.
    SourceFailed,
    /// The task thread panicked.
    Panicked,
}

impl ExitReason {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimedOut
                | Self::ConnectFailed
                | Self::UnsupportedSource
                | Self::ModelLoadFailed
                | Self::SourceFailed
                | Self::Panicked
        )
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::EndOfInput => "end of input",
            Self::ImageProcessed => "image processed",
            Self::Cancelled => "cancelled",
            Self::Shutdown => "shutdown",
            Self::ConnectTimedOut => "connection timed out",
            Self::ConnectFailed => "connection failed",
            Self::UnsupportedSource => "unsupported source",
            Self::ModelLoadFailed => "model load failed",
            Self::SourceFailed => "source failed",
            Self::Panicked => "panicked",
        };
        f.write_str(text)
    }
}

/// How a frame's objects map to persisted events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClassResolution {
    /// One event per frame, classed by the first object. Assumes a
    /// single-class model.
    #[default]
    FirstObjectOnly,
    /// One event per distinct class in the frame, in first-seen order.
    PerObjectBreakdown,
}

impl FromStr for ClassResolution {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "first_object" | "first_object_only" => Ok(Self::FirstObjectOnly),
            "per_object" | "per_object_breakdown" => Ok(Self::PerObjectBreakdown),
            other => Err(anyhow!(
                "unknown class resolution '{}' (first_object/per_object)",
                other
            )),
        }
    }
}

impl fmt::Display for ClassResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirstObjectOnly => write!(f, "first_object"),
            Self::PerObjectBreakdown => write!(f, "per_object"),
        }
    }
}

/// Immutable per-run settings, shared read-only by every task.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Candidates must score strictly above this.
    pub confidence_threshold: f32,
    pub overlap_threshold: f64,
    pub labels: ClassLabels,
    pub blob: BlobParams,
    /// Consecutive failed reads before the source is given up.
    pub max_consecutive_failures: u32,
    pub class_resolution: ClassResolution,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            overlap_threshold: DEFAULT_OVERLAP_THRESHOLD,
            labels: ClassLabels::default(),
            blob: BlobParams::default(),
            max_consecutive_failures: 50,
            class_resolution: ClassResolution::default(),
        }
    }
}

impl PipelineConfig {
    /// Integer percent in (0, 100] to a threshold; anything else is 0.75.
    pub fn threshold_from_percent(percent: i64) -> f32 {
        if percent > 0 && percent <= 100 {
            percent as f32 / 100.0
        } else {
            DEFAULT_CONFIDENCE_THRESHOLD
        }
    }
}

/// Run the detector over one frame and fuse its output.
pub fn detect_objects(
    detector: &mut dyn DetectorBackend,
    frame: &Frame,
    config: &PipelineConfig,
) -> Result<Vec<DetectedObject>> {
    let outputs = detector.infer(frame, &config.blob)?;

    let candidates: Vec<Candidate> = raw_detections(&outputs)
        .filter_map(|raw| {
            let (class_index, confidence) = classify(raw.scores);
            if confidence <= config.confidence_threshold {
                return None;
            }
            Some(Candidate {
                class_index,
                confidence,
                bbox: BoundingBox::from_normalized(
                    raw.center_x,
                    raw.center_y,
                    raw.width,
                    raw.height,
                    frame.width,
                    frame.height,
                ),
            })
        })
        .collect();

    Ok(fuse(candidates, config.overlap_threshold)
        .into_iter()
        .map(|c| DetectedObject::from_candidate(c, config.labels.name(c.class_index)))
        .collect())
}

/// What a sink did with one frame's objects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Nothing persisted (no objects, or the catalog refused the event).
    Skipped,
    Persisted { events: usize, alerts: usize },
    Rendered,
    /// Stop this task.
    Cancel,
}

/// Receives every processed frame of one task.
pub trait FrameSink: Send {
    fn handle(
        &mut self,
        address: &str,
        frame: &Frame,
        objects: &[DetectedObject],
        captured_at: i64,
    ) -> FrameOutcome;
}

/// Persists non-empty frames as detection events and dispatches alerts.
pub struct ProductionSink {
    catalog: Arc<dyn Catalog>,
    dispatcher: Arc<AlertDispatcher>,
    resolution: ClassResolution,
}

impl ProductionSink {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        dispatcher: Arc<AlertDispatcher>,
        resolution: ClassResolution,
    ) -> Self {
        Self {
            catalog,
            dispatcher,
            resolution,
        }
    }

    fn groups<'a>(&self, objects: &'a [DetectedObject]) -> Vec<(&'a str, Vec<DetectedObject>)> {
        match self.resolution {
            ClassResolution::FirstObjectOnly => match objects.first() {
                Some(first) => vec![(first.class_name.as_str(), objects.to_vec())],
                None => Vec::new(),
            },
            ClassResolution::PerObjectBreakdown => {
                let mut groups: Vec<(&'a str, Vec<DetectedObject>)> = Vec::new();
                for obj in objects {
                    match groups.iter_mut().find(|(name, _)| *name == obj.class_name) {
                        Some((_, members)) => members.push(obj.clone()),
                        None => groups.push((obj.class_name.as_str(), vec![obj.clone()])),
                    }
                }
                groups
            }
        }
    }
}

impl FrameSink for ProductionSink {
    fn handle(
        &mut self,
        address: &str,
        _frame: &Frame,
        objects: &[DetectedObject],
        captured_at: i64,
    ) -> FrameOutcome {
        if objects.is_empty() {
            return FrameOutcome::Skipped;
        }

        let mut events = 0;
        let mut alerts = 0;
        for (class_name, members) in self.groups(objects) {
            let class_id = match self.catalog.class_id_for(class_name) {
                Ok(Some(id)) => id,
                Ok(None) => {
                    log::warn!("{}: no class with label {}, event skipped", address, class_name);
                    continue;
                }
                Err(err) => {
                    log::error!("{}: class lookup for {} failed: {:#}", address, class_name, err);
                    continue;
                }
            };

            let count = members.len();
            let event = DetectionEvent {
                stream_address: address.to_string(),
                class_id,
                captured_at,
                objects: members,
            };
            let event_id = match self.catalog.persist_event(&event) {
                Ok(id) => id,
                Err(err) => {
                    log::error!("{}: failed to persist detection event: {:#}", address, err);
                    continue;
                }
            };
            events += 1;
            log::info!(
                "{}: event {} with {} {} object(s)",
                address,
                event_id,
                count,
                class_name
            );

            if event_id > 0 {
                alerts += self
                    .dispatcher
                    .dispatch(address, event_id, class_name, count, captured_at);
            }
        }

        if events == 0 {
            FrameOutcome::Skipped
        } else {
            FrameOutcome::Persisted { events, alerts }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderControl {
    Continue,
    Cancel,
}

/// Displays a frame's objects in inspection mode.
pub trait Renderer: Send {
    fn render(&mut self, address: &str, frame: &Frame, objects: &[DetectedObject])
        -> RenderControl;
}

/// Renderer that writes each object's label and box to the log.
#[derive(Clone, Debug, Default)]
pub struct LogRenderer;

impl Renderer for LogRenderer {
    fn render(
        &mut self,
        address: &str,
        frame: &Frame,
        objects: &[DetectedObject],
    ) -> RenderControl {
        log::info!(
            "{}: {} object(s) in {}x{} frame",
            address,
            objects.len(),
            frame.width,
            frame.height
        );
        for obj in objects {
            log::info!(
                "  {} at ({}, {}) {}x{}",
                obj.label,
                obj.bbox.left,
                obj.bbox.top,
                obj.bbox.width,
                obj.bbox.height
            );
        }
        RenderControl::Continue
    }
}

/// Hands every frame to a renderer; nothing is persisted.
pub struct InspectionSink {
    renderer: Box<dyn Renderer>,
}

impl InspectionSink {
    pub fn new(renderer: Box<dyn Renderer>) -> Self {
        Self { renderer }
    }
}

impl FrameSink for InspectionSink {
    fn handle(
        &mut self,
        address: &str,
        frame: &Frame,
        objects: &[DetectedObject],
        _captured_at: i64,
    ) -> FrameOutcome {
        match self.renderer.render(address, frame, objects) {
            RenderControl::Continue => FrameOutcome::Rendered,
            RenderControl::Cancel => FrameOutcome::Cancel,
        }
    }
}

/// Builds the task's detector. Called once, on the task's own thread.
pub type DetectorLoader = Box<dyn FnOnce() -> Result<Box<dyn DetectorBackend>> + Send>;

/// Summary of one finished task.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineReport {
    pub address: String,
    pub kind: Option<SourceKind>,
    pub frames: u64,
    pub events: u64,
    pub alerts: u64,
    pub exit: ExitReason,
    /// States visited, in order.
    pub trace: Vec<PipelineState>,
}

impl PipelineReport {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            kind: None,
            frames: 0,
            events: 0,
            alerts: 0,
            exit: ExitReason::SourceFailed,
            trace: Vec::new(),
        }
    }
}

/// Closes the source when dropped, including during unwinding.
struct OpenSource(Box<dyn FrameSource>);

impl Drop for OpenSource {
    fn drop(&mut self) {
        self.0.close();
    }
}

pub struct DetectionPipeline {
    address: String,
    config: Arc<PipelineConfig>,
    opener: Arc<dyn SourceOpener>,
    sink: Box<dyn FrameSink>,
    shutdown: Arc<AtomicBool>,
    clock: fn() -> Result<i64>,
    report: PipelineReport,
}

impl DetectionPipeline {
    pub fn new(
        address: &str,
        config: Arc<PipelineConfig>,
        opener: Arc<dyn SourceOpener>,
        sink: Box<dyn FrameSink>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            address: address.to_string(),
            config,
            opener,
            sink,
            shutdown,
            clock: crate::now_s,
            report: PipelineReport::new(address),
        }
    }

    /// Replace the capture-time clock (epoch seconds).
    pub fn with_clock(mut self, clock: fn() -> Result<i64>) -> Self {
        self.clock = clock;
        self
    }

    fn enter(&mut self, state: PipelineState) {
        log::debug!("{}: {:?}", self.address, state);
        self.report.trace.push(state);
    }

    fn terminate(mut self, exit: ExitReason) -> PipelineReport {
        self.enter(PipelineState::Terminated);
        self.report.exit = exit;
        self.report
    }

    /// Drive the task to `Terminated`.
    pub fn run(mut self, load_detector: DetectorLoader) -> PipelineReport {
        self.enter(PipelineState::Connecting);

        let Some(kind) = SourceKind::classify(&self.address) else {
            log::error!("{}: unsupported source", self.address);
            return self.terminate(ExitReason::UnsupportedSource);
        };
        self.report.kind = Some(kind);
        log::info!("{}: source type {}", self.address, kind);

        let mut detector = match load_detector() {
            Ok(detector) => detector,
            Err(err) => {
                log::error!("{}: failed to load detector: {:#}", self.address, err);
                return self.terminate(ExitReason::ModelLoadFailed);
            }
        };
        if let Err(err) = detector.warm_up() {
            log::error!("{}: detector warm-up failed: {:#}", self.address, err);
            return self.terminate(ExitReason::ModelLoadFailed);
        }

        let source = match self.opener.open(&self.address, kind) {
            ConnectOutcome::Connected(source) => OpenSource(source),
            ConnectOutcome::TimedOut(after) => {
                log::error!("{}: connection timed out after {:?}", self.address, after);
                return self.terminate(ExitReason::ConnectTimedOut);
            }
            ConnectOutcome::Failed(err) => {
                log::error!("{}: error opening source: {:#}", self.address, err);
                return self.terminate(ExitReason::ConnectFailed);
            }
        };

        self.enter(PipelineState::Running);
        let exit = self.run_frames(source, detector.as_mut(), kind);
        drop(detector);
        log::info!(
            "{}: terminated ({}) after {} frame(s), {} event(s), {} alert(s)",
            self.address,
            exit,
            self.report.frames,
            self.report.events,
            self.report.alerts
        );
        self.terminate(exit)
    }

    fn run_frames(
        &mut self,
        mut source: OpenSource,
        detector: &mut dyn DetectorBackend,
        kind: SourceKind,
    ) -> ExitReason {
        let mut consecutive_failures = 0u32;

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                self.enter(PipelineState::Draining);
                return ExitReason::Shutdown;
            }

            let frame = match source.0.next_frame() {
                Ok(FrameRead::Frame(frame)) => frame,
                Ok(FrameRead::EndOfInput) => return ExitReason::EndOfInput,
                Ok(FrameRead::Empty) => {
                    log::debug!("{}: no frame captured", self.address);
                    continue;
                }
                Err(err) => {
                    consecutive_failures += 1;
                    log::warn!(
                        "{}: frame read failed ({}/{}): {:#}",
                        self.address,
                        consecutive_failures,
                        self.config.max_consecutive_failures,
                        err
                    );
                    if consecutive_failures >= self.config.max_consecutive_failures {
                        return ExitReason::SourceFailed;
                    }
                    continue;
                }
            };
            consecutive_failures = 0;
            let captured_at = match (self.clock)() {
                Ok(at) => at,
                Err(err) => {
                    log::warn!("{}: no capture time, frame dropped: {:#}", self.address, err);
                    if kind == SourceKind::Image {
                        return ExitReason::ImageProcessed;
                    }
                    continue;
                }
            };
            self.report.frames += 1;

            let objects = match detect_objects(detector, &frame, &self.config) {
                Ok(objects) => objects,
                Err(err) => {
                    log::warn!("{}: inference failed: {:#}", self.address, err);
                    if kind == SourceKind::Image {
                        return ExitReason::ImageProcessed;
                    }
                    continue;
                }
            };

            match self
                .sink
                .handle(&self.address, &frame, &objects, captured_at)
            {
                FrameOutcome::Persisted { events, alerts } => {
                    self.report.events += events as u64;
                    self.report.alerts += alerts as u64;
                }
                FrameOutcome::Cancel => return ExitReason::Cancelled,
                FrameOutcome::Skipped | FrameOutcome::Rendered => {}
            }

            if kind == SourceKind::Image {
                return ExitReason::ImageProcessed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::detect::StubBackend;
    use crate::notify::Notifier;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Row for one anchor: center/size, objectness, then class scores.
    fn row(cx: f32, cy: f32, w: f32, h: f32, scores: &[f32]) -> Vec<f32> {
        let mut row = vec![cx, cy, w, h, 1.0];
        row.extend_from_slice(scores);
        row
    }

    fn frame() -> Frame {
        Frame::new(vec![0u8; 100 * 100 * 3], 100, 100).expect("frame")
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            labels: ClassLabels::new(vec!["bird".to_string(), "squirrel".to_string()]),
            ..PipelineConfig::default()
        }
    }

    struct ScriptedSource {
        address: String,
        kind: SourceKind,
        reads: VecDeque<Result<FrameRead>>,
        closed: Arc<AtomicBool>,
    }

    impl FrameSource for ScriptedSource {
        fn address(&self) -> &str {
            &self.address
        }

        fn kind(&self) -> SourceKind {
            self.kind
        }

        fn next_frame(&mut self) -> Result<FrameRead> {
            self.reads.pop_front().unwrap_or(Ok(FrameRead::EndOfInput))
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct ScriptedOpener {
        reads: Mutex<Option<Vec<Result<FrameRead>>>>,
        timed_out: bool,
        closed: Arc<AtomicBool>,
    }

    impl ScriptedOpener {
        fn with_reads(reads: Vec<Result<FrameRead>>) -> Self {
            Self {
                reads: Mutex::new(Some(reads)),
                timed_out: false,
                closed: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl SourceOpener for ScriptedOpener {
        fn open(&self, address: &str, kind: SourceKind) -> ConnectOutcome<Box<dyn FrameSource>> {
            if self.timed_out {
                return ConnectOutcome::TimedOut(std::time::Duration::from_secs(5));
            }
            let reads = self.reads.lock().expect("reads").take().unwrap_or_default();
            ConnectOutcome::Connected(Box::new(ScriptedSource {
                address: address.to_string(),
                kind,
                reads: reads.into(),
                closed: self.closed.clone(),
            }))
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<String>>,
    }

    impl Notifier for RecordingNotifier {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn send(&self, recipient: &str, _subject: &str, _body: &str) -> Result<()> {
            self.sent.lock().expect("sent").push(recipient.to_string());
            Ok(())
        }
    }

    struct CountingRenderer {
        seen: Arc<Mutex<Vec<Vec<DetectedObject>>>>,
        cancel_after: usize,
    }

    impl Renderer for CountingRenderer {
        fn render(&mut self, _: &str, _: &Frame, objects: &[DetectedObject]) -> RenderControl {
            let mut seen = self.seen.lock().expect("seen");
            seen.push(objects.to_vec());
            if seen.len() >= self.cancel_after {
                RenderControl::Cancel
            } else {
                RenderControl::Continue
            }
        }
    }

    fn stub_loader(rows: Vec<Vec<f32>>) -> DetectorLoader {
        Box::new(move || -> Result<Box<dyn DetectorBackend>> {
            Ok(Box::new(StubBackend::with_rows(&rows)?))
        })
    }

    fn production_sink(
        catalog: Arc<InMemoryCatalog>,
        notifier: Arc<RecordingNotifier>,
        resolution: ClassResolution,
    ) -> Box<dyn FrameSink> {
        let dispatcher = Arc::new(AlertDispatcher::new(catalog.clone(), notifier));
        Box::new(ProductionSink::new(catalog, dispatcher, resolution))
    }

    fn seeded_catalog() -> Result<Arc<InMemoryCatalog>> {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.add_class("bird")?;
        catalog.add_class("squirrel")?;
        let stream = catalog.add_stream("rtsp://cam/1", "Feeder", "http://cam/1")?;
        let alice = catalog.add_observer("alice@example.com")?;
        catalog.subscribe(alice, stream, "15m", true)?;
        Ok(catalog)
    }

    #[test]
    fn threshold_from_percent_falls_back() {
        assert!((PipelineConfig::threshold_from_percent(90) - 0.9).abs() < 1e-6);
        assert!((PipelineConfig::threshold_from_percent(100) - 1.0).abs() < 1e-6);
        assert_eq!(PipelineConfig::threshold_from_percent(0), 0.75);
        assert_eq!(PipelineConfig::threshold_from_percent(-5), 0.75);
        assert_eq!(PipelineConfig::threshold_from_percent(150), 0.75);
    }

    #[test]
    fn class_resolution_parses() -> Result<()> {
        assert_eq!(
            "first_object".parse::<ClassResolution>()?,
            ClassResolution::FirstObjectOnly
        );
        assert_eq!(
            "per-object".parse::<ClassResolution>()?,
            ClassResolution::PerObjectBreakdown
        );
        assert!("random".parse::<ClassResolution>().is_err());
        Ok(())
    }

    #[test]
    fn detect_objects_filters_and_fuses() -> Result<()> {
        let mut detector = StubBackend::with_rows(&[
            row(0.5, 0.5, 0.2, 0.2, &[0.8, 0.1]),
            row(0.5, 0.5, 0.2, 0.2, &[0.95, 0.1]),
            row(0.1, 0.1, 0.1, 0.1, &[0.1, 0.6]),
            row(0.9, 0.9, 0.1, 0.1, &[0.2, 0.9]),
        ])?;
        let objects = detect_objects(&mut detector, &frame(), &config())?;

        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].class_name, "bird");
        assert!((objects[0].confidence - 0.95).abs() < 1e-6);
        assert_eq!(objects[0].label, "bird - 95%");
        assert_eq!(objects[0].bbox, BoundingBox::new(40, 40, 20, 20));
        assert_eq!(objects[1].class_name, "squirrel");
        Ok(())
    }

    #[test]
    fn confidence_must_strictly_exceed_threshold() -> Result<()> {
        let mut detector = StubBackend::with_rows(&[row(0.5, 0.5, 0.2, 0.2, &[0.75])])?;
        assert!(detect_objects(&mut detector, &frame(), &config())?.is_empty());
        Ok(())
    }

    #[test]
    fn same_frame_yields_same_objects() -> Result<()> {
        let mut detector = StubBackend::with_rows(&[
            row(0.3, 0.3, 0.2, 0.2, &[0.9]),
            row(0.31, 0.3, 0.2, 0.2, &[0.85]),
            row(0.7, 0.7, 0.2, 0.2, &[0.8]),
        ])?;
        let frame = frame();
        let first = detect_objects(&mut detector, &frame, &config())?;
        let second = detect_objects(&mut detector, &frame, &config())?;
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        Ok(())
    }

    #[test]
    fn image_source_runs_once_and_persists() -> Result<()> {
        let catalog = seeded_catalog()?;
        let notifier = Arc::new(RecordingNotifier::default());
        let opener = Arc::new(ScriptedOpener::with_reads(vec![Ok(FrameRead::Frame(frame()))]));
        let closed = opener.closed.clone();

        let pipeline = DetectionPipeline::new(
            "birds.jpg",
            Arc::new(config()),
            opener,
            production_sink(catalog.clone(), notifier.clone(), ClassResolution::default()),
            Arc::new(AtomicBool::new(false)),
        );
        let report = pipeline.run(stub_loader(vec![row(0.5, 0.5, 0.2, 0.2, &[0.9])]));

        assert_eq!(report.exit, ExitReason::ImageProcessed);
        assert_eq!(report.kind, Some(SourceKind::Image));
        assert_eq!(report.frames, 1);
        assert_eq!(report.events, 1);
        // No subscribers on birds.jpg.
        assert_eq!(report.alerts, 0);
        assert_eq!(
            report.trace,
            vec![
                PipelineState::Connecting,
                PipelineState::Running,
                PipelineState::Terminated
            ]
        );
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(catalog.events()?.len(), 1);
        Ok(())
    }

    #[test]
    fn stream_frames_alert_once_per_interval() -> Result<()> {
        let catalog = seeded_catalog()?;
        let notifier = Arc::new(RecordingNotifier::default());
        let opener = Arc::new(ScriptedOpener::with_reads(vec![
            Ok(FrameRead::Frame(frame())),
            Ok(FrameRead::Empty),
            Err(anyhow!("decoder hiccup")),
            Ok(FrameRead::Frame(frame())),
            Ok(FrameRead::EndOfInput),
        ]));

        let pipeline = DetectionPipeline::new(
            "rtsp://cam/1",
            Arc::new(config()),
            opener,
            production_sink(catalog.clone(), notifier.clone(), ClassResolution::default()),
            Arc::new(AtomicBool::new(false)),
        );
        let report = pipeline.run(stub_loader(vec![row(0.5, 0.5, 0.2, 0.2, &[0.9])]));

        assert_eq!(report.exit, ExitReason::EndOfInput);
        assert_eq!(report.frames, 2);
        assert_eq!(report.events, 2);
        assert_eq!(report.alerts, 1);
        assert_eq!(notifier.sent.lock().expect("sent").len(), 1);
        Ok(())
    }

    #[test]
    fn clock_failure_drops_frames_instead_of_stamping_zero() -> Result<()> {
        let catalog = seeded_catalog()?;
        let notifier = Arc::new(RecordingNotifier::default());
        let opener = Arc::new(ScriptedOpener::with_reads(vec![
            Ok(FrameRead::Frame(frame())),
            Ok(FrameRead::Frame(frame())),
            Ok(FrameRead::EndOfInput),
        ]));

        let pipeline = DetectionPipeline::new(
            "rtsp://cam/1",
            Arc::new(config()),
            opener,
            production_sink(catalog.clone(), notifier.clone(), ClassResolution::default()),
            Arc::new(AtomicBool::new(false)),
        )
        .with_clock(|| Err(anyhow!("clock before epoch")));
        let report = pipeline.run(stub_loader(vec![row(0.5, 0.5, 0.2, 0.2, &[0.9])]));

        assert_eq!(report.exit, ExitReason::EndOfInput);
        assert_eq!(report.frames, 0);
        assert_eq!(report.events, 0);
        assert!(catalog.events()?.is_empty());
        assert!(notifier.sent.lock().expect("sent").is_empty());
        Ok(())
    }

    #[test]
    fn empty_frames_persist_nothing() -> Result<()> {
        let catalog = seeded_catalog()?;
        let opener = Arc::new(ScriptedOpener::with_reads(vec![
            Ok(FrameRead::Frame(frame())),
            Ok(FrameRead::EndOfInput),
        ]));
        let pipeline = DetectionPipeline::new(
            "clip.mp4",
            Arc::new(config()),
            opener,
            production_sink(
                catalog.clone(),
                Arc::new(RecordingNotifier::default()),
                ClassResolution::default(),
            ),
            Arc::new(AtomicBool::new(false)),
        );
        let report = pipeline.run(stub_loader(Vec::new()));
        assert_eq!(report.frames, 1);
        assert_eq!(report.events, 0);
        assert!(catalog.events()?.is_empty());
        Ok(())
    }

    #[test]
    fn unknown_class_skips_event_and_continues() -> Result<()> {
        let catalog = Arc::new(InMemoryCatalog::new());
        let opener = Arc::new(ScriptedOpener::with_reads(vec![
            Ok(FrameRead::Frame(frame())),
            Ok(FrameRead::Frame(frame())),
        ]));
        let pipeline = DetectionPipeline::new(
            "clip.mp4",
            Arc::new(config()),
            opener,
            production_sink(
                catalog.clone(),
                Arc::new(RecordingNotifier::default()),
                ClassResolution::default(),
            ),
            Arc::new(AtomicBool::new(false)),
        );
        let report = pipeline.run(stub_loader(vec![row(0.5, 0.5, 0.2, 0.2, &[0.9])]));
        assert_eq!(report.exit, ExitReason::EndOfInput);
        assert_eq!(report.frames, 2);
        assert_eq!(report.events, 0);
        Ok(())
    }

    #[test]
    fn per_object_breakdown_persists_one_event_per_class() -> Result<()> {
        let catalog = seeded_catalog()?;
        let opener = Arc::new(ScriptedOpener::with_reads(vec![Ok(FrameRead::Frame(frame()))]));
        let pipeline = DetectionPipeline::new(
            "feeder.png",
            Arc::new(config()),
            opener,
            production_sink(
                catalog.clone(),
                Arc::new(RecordingNotifier::default()),
                ClassResolution::PerObjectBreakdown,
            ),
            Arc::new(AtomicBool::new(false)),
        );
        let report = pipeline.run(stub_loader(vec![
            row(0.2, 0.2, 0.1, 0.1, &[0.9, 0.0]),
            row(0.8, 0.8, 0.1, 0.1, &[0.0, 0.9]),
            row(0.5, 0.2, 0.1, 0.1, &[0.9, 0.0]),
        ]));
        assert_eq!(report.events, 2);

        let events = catalog.events()?;
        assert_eq!(events[0].1.class_id, 1);
        assert_eq!(events[0].1.count(), 2);
        assert_eq!(events[1].1.class_id, 2);
        assert_eq!(events[1].1.count(), 1);
        Ok(())
    }

    #[test]
    fn renderer_cancel_stops_the_task() -> Result<()> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let opener = Arc::new(ScriptedOpener::with_reads(
            (0..10).map(|_| Ok(FrameRead::Frame(frame()))).collect(),
        ));
        let closed = opener.closed.clone();
        let pipeline = DetectionPipeline::new(
            "0",
            Arc::new(config()),
            opener,
            Box::new(InspectionSink::new(Box::new(CountingRenderer {
                seen: seen.clone(),
                cancel_after: 3,
            }))),
            Arc::new(AtomicBool::new(false)),
        );
        let report = pipeline.run(stub_loader(vec![row(0.5, 0.5, 0.2, 0.2, &[0.9])]));
        assert_eq!(report.exit, ExitReason::Cancelled);
        assert_eq!(report.frames, 3);
        assert_eq!(seen.lock().expect("seen").len(), 3);
        assert!(closed.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn shutdown_drains_before_next_frame() -> Result<()> {
        let opener = Arc::new(ScriptedOpener::with_reads(vec![Ok(FrameRead::Frame(frame()))]));
        let closed = opener.closed.clone();
        let pipeline = DetectionPipeline::new(
            "rtsp://cam/1",
            Arc::new(config()),
            opener,
            Box::new(InspectionSink::new(Box::new(LogRenderer))),
            Arc::new(AtomicBool::new(true)),
        );
        let report = pipeline.run(stub_loader(Vec::new()));
        assert_eq!(report.exit, ExitReason::Shutdown);
        assert_eq!(report.frames, 0);
        assert_eq!(
            report.trace,
            vec![
                PipelineState::Connecting,
                PipelineState::Running,
                PipelineState::Draining,
                PipelineState::Terminated
            ]
        );
        assert!(closed.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn connect_timeout_never_enters_running() {
        let opener = Arc::new(ScriptedOpener {
            timed_out: true,
            ..ScriptedOpener::with_reads(Vec::new())
        });
        let pipeline = DetectionPipeline::new(
            "rtsp://cam/1",
            Arc::new(config()),
            opener,
            Box::new(InspectionSink::new(Box::new(LogRenderer))),
            Arc::new(AtomicBool::new(false)),
        );
        let report = pipeline.run(stub_loader(Vec::new()));
        assert_eq!(report.exit, ExitReason::ConnectTimedOut);
        assert!(report.exit.is_failure());
        assert_eq!(
            report.trace,
            vec![PipelineState::Connecting, PipelineState::Terminated]
        );
    }

    #[test]
    fn unsupported_source_and_model_failure_terminate() {
        let pipeline = DetectionPipeline::new(
            "http://example.com/feed",
            Arc::new(config()),
            Arc::new(ScriptedOpener::with_reads(Vec::new())),
            Box::new(InspectionSink::new(Box::new(LogRenderer))),
            Arc::new(AtomicBool::new(false)),
        );
        let report = pipeline.run(stub_loader(Vec::new()));
        assert_eq!(report.exit, ExitReason::UnsupportedSource);
        assert_eq!(report.kind, None);

        let pipeline = DetectionPipeline::new(
            "clip.mp4",
            Arc::new(config()),
            Arc::new(ScriptedOpener::with_reads(Vec::new())),
            Box::new(InspectionSink::new(Box::new(LogRenderer))),
            Arc::new(AtomicBool::new(false)),
        );
        let report = pipeline.run(Box::new(|| -> Result<Box<dyn DetectorBackend>> {
            Err(anyhow!("model.onnx: no such file"))
        }));
        assert_eq!(report.exit, ExitReason::ModelLoadFailed);
    }

    #[test]
    fn repeated_read_failures_give_up() {
        let opener = Arc::new(ScriptedOpener::with_reads(
            (0..5).map(|_| Err(anyhow!("corrupt packet"))).collect(),
        ));
        let closed = opener.closed.clone();
        let pipeline = DetectionPipeline::new(
            "clip.mp4",
            Arc::new(PipelineConfig {
                max_consecutive_failures: 3,
                ..config()
            }),
            opener,
            Box::new(InspectionSink::new(Box::new(LogRenderer))),
            Arc::new(AtomicBool::new(false)),
        );
        let report = pipeline.run(stub_loader(Vec::new()));
        assert_eq!(report.exit, ExitReason::SourceFailed);
        assert!(closed.load(Ordering::SeqCst));
    }
}
