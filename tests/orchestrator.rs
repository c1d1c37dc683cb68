use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};

use detection_agent::orchestrator::{inspection_sinks, production_sinks, SinkFactory};
use detection_agent::{
    AlertDispatcher, BackendRegistry, Catalog, ClassLabels, ConnectOutcome, DefaultSourceOpener,
    DetectedObject, DetectorBackend, ExitReason, Frame, FrameOutcome, FrameRead, FrameSink,
    FrameSource, InMemoryCatalog, LogNotifier, ModelSpec, Orchestrator, PipelineConfig,
    SourceKind, SourceOpener, StubBackend,
};

/// Serves `frames` blank frames per source, then ends. Addresses containing
/// "down" refuse to connect.
struct FakeOpener {
    frames: usize,
    endless: bool,
    closed: Arc<AtomicUsize>,
}

impl FakeOpener {
    fn new(frames: usize) -> Self {
        Self {
            frames,
            endless: false,
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn endless() -> Self {
        Self {
            endless: true,
            ..Self::new(0)
        }
    }
}

struct FakeSource {
    address: String,
    kind: SourceKind,
    remaining: usize,
    endless: bool,
    closed: Arc<AtomicUsize>,
}

impl FrameSource for FakeSource {
    fn address(&self) -> &str {
        &self.address
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn next_frame(&mut self) -> Result<FrameRead> {
        if !self.endless {
            if self.remaining == 0 {
                return Ok(FrameRead::EndOfInput);
            }
            self.remaining -= 1;
        }
        Ok(FrameRead::Frame(Frame::new(vec![0u8; 64 * 64 * 3], 64, 64)?))
    }

    fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl SourceOpener for FakeOpener {
    fn open(&self, address: &str, kind: SourceKind) -> ConnectOutcome<Box<dyn FrameSource>> {
        if address.contains("down") {
            return ConnectOutcome::Failed(anyhow!("connection refused"));
        }
        ConnectOutcome::Connected(Box::new(FakeSource {
            address: address.to_string(),
            kind,
            remaining: self.frames,
            endless: self.endless,
            closed: self.closed.clone(),
        }))
    }
}

/// Row for one centred bird at 90% confidence.
fn bird_row() -> Vec<f32> {
    vec![0.5, 0.5, 0.25, 0.25, 1.0, 0.9]
}

fn registry() -> Arc<BackendRegistry> {
    let mut registry = BackendRegistry::new();
    registry.register("stub", |_spec| {
        Ok(Box::new(StubBackend::with_rows(&[bird_row()])?) as Box<dyn DetectorBackend>)
    });
    registry.register("broken", |_spec| Err(anyhow!("model file missing")));
    Arc::new(registry)
}

fn pipeline_config() -> Arc<PipelineConfig> {
    Arc::new(PipelineConfig {
        labels: ClassLabels::new(vec!["bird".to_string()]),
        ..PipelineConfig::default()
    })
}

fn orchestrator(opener: Arc<dyn SourceOpener>, sinks: Arc<SinkFactory>) -> Orchestrator {
    Orchestrator::new(
        pipeline_config(),
        opener,
        registry(),
        ModelSpec::default(),
        sinks,
    )
}

fn seeded_catalog() -> Result<Arc<InMemoryCatalog>> {
    let catalog = Arc::new(InMemoryCatalog::new());
    catalog.add_class("bird")?;
    let stream = catalog.add_stream("rtsp://cam/1", "Feeder", "http://cam/1")?;
    let alice = catalog.add_observer("alice@example.com")?;
    catalog.subscribe(alice, stream, "1h", true)?;
    Ok(catalog)
}

fn production(catalog: Arc<InMemoryCatalog>) -> Arc<SinkFactory> {
    let catalog: Arc<dyn Catalog> = catalog;
    let dispatcher = Arc::new(AlertDispatcher::new(catalog.clone(), Arc::new(LogNotifier)));
    production_sinks(catalog, dispatcher, Default::default())
}

#[test]
fn empty_source_list_returns_immediately() {
    let orchestrator = orchestrator(Arc::new(FakeOpener::new(1)), inspection_sinks());
    assert!(orchestrator.run(&[]).is_empty());
}

#[test]
fn reports_follow_source_order_and_failures_stay_isolated() -> Result<()> {
    let catalog = seeded_catalog()?;
    let opener = Arc::new(FakeOpener::new(3));
    let closed = opener.closed.clone();
    let orchestrator = orchestrator(opener, production(catalog.clone()));

    let sources = vec![
        "rtsp://cam/1".to_string(),
        "ftp://cam/2".to_string(),
        "rtsp://down/3".to_string(),
        "rtsp://cam/1".to_string(),
    ];
    let reports = orchestrator.run(&sources);

    let exits: Vec<ExitReason> = reports.iter().map(|r| r.exit).collect();
    assert_eq!(
        exits,
        vec![
            ExitReason::EndOfInput,
            ExitReason::UnsupportedSource,
            ExitReason::ConnectFailed,
            ExitReason::EndOfInput,
        ]
    );
    let addresses: Vec<&str> = reports.iter().map(|r| r.address.as_str()).collect();
    assert_eq!(addresses, sources.iter().map(String::as_str).collect::<Vec<_>>());

    assert_eq!(reports[0].frames, 3);
    assert_eq!(reports[0].events, 3);
    assert_eq!(reports[3].events, 3);
    assert_eq!(catalog.events()?.len(), 6);
    // Both tasks share the subscription, which admits one alert per hour.
    assert_eq!(reports[0].alerts + reports[3].alerts, 1);
    assert_eq!(closed.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn model_load_failure_ends_every_task_before_connecting() {
    let opener = Arc::new(FakeOpener::new(1));
    let closed = opener.closed.clone();
    let orchestrator = orchestrator(opener, inspection_sinks())
        .with_backend(Some("broken".to_string()));

    let reports = orchestrator.run(&["rtsp://cam/1".to_string(), "rtsp://cam/2".to_string()]);
    assert!(reports
        .iter()
        .all(|r| r.exit == ExitReason::ModelLoadFailed));
    assert_eq!(closed.load(Ordering::SeqCst), 0);
}

struct PanickingSink;

impl FrameSink for PanickingSink {
    fn handle(&mut self, _: &str, _: &Frame, _: &[DetectedObject], _: i64) -> FrameOutcome {
        panic!("sink exploded");
    }
}

#[test]
fn panicking_task_does_not_take_down_siblings() {
    let opener = Arc::new(FakeOpener::new(2));
    let closed = opener.closed.clone();
    let sinks: Arc<SinkFactory> = Arc::new(|address: &str| -> Box<dyn FrameSink> {
        if address.ends_with("/bad") {
            Box::new(PanickingSink)
        } else {
            Box::new(detection_agent::InspectionSink::new(Box::new(
                detection_agent::LogRenderer,
            )))
        }
    });
    let orchestrator = orchestrator(opener, sinks);

    let reports = orchestrator.run(&["rtsp://cam/bad".to_string(), "rtsp://cam/good".to_string()]);
    assert_eq!(reports[0].exit, ExitReason::Panicked);
    assert_eq!(reports[1].exit, ExitReason::EndOfInput);
    assert_eq!(reports[1].frames, 2);
    // The panicking task still released its source while unwinding.
    assert_eq!(closed.load(Ordering::SeqCst), 2);
}

/// Requests shutdown once it has seen `after` frames.
struct StopAfter {
    seen: usize,
    after: usize,
    shutdown: Arc<AtomicBool>,
}

impl FrameSink for StopAfter {
    fn handle(&mut self, _: &str, _: &Frame, _: &[DetectedObject], _: i64) -> FrameOutcome {
        self.seen += 1;
        if self.seen >= self.after {
            self.shutdown.store(true, Ordering::SeqCst);
        }
        FrameOutcome::Rendered
    }
}

#[test]
fn shutdown_flag_drains_endless_sources() {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    let sinks: Arc<SinkFactory> = Arc::new(move |_address: &str| -> Box<dyn FrameSink> {
        Box::new(StopAfter {
            seen: 0,
            after: 5,
            shutdown: flag.clone(),
        })
    });
    let opener = Arc::new(FakeOpener::endless());
    let closed = opener.closed.clone();
    let orchestrator = orchestrator(opener, sinks).with_shutdown(shutdown.clone());
    assert!(Arc::ptr_eq(&orchestrator.shutdown_flag(), &shutdown));

    let reports = orchestrator.run(&["0".to_string(), "rtsp://cam/1".to_string()]);
    assert!(reports.iter().all(|r| r.exit == ExitReason::Shutdown));
    assert_eq!(closed.load(Ordering::SeqCst), 2);
}

#[test]
fn image_file_is_processed_once() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("feeder.png");
    image::RgbImage::from_pixel(32, 32, image::Rgb([10, 20, 30])).save(&path)?;
    let address = path.to_string_lossy().to_string();

    let catalog = Arc::new(InMemoryCatalog::new());
    catalog.add_class("bird")?;
    let orchestrator = orchestrator(
        Arc::new(DefaultSourceOpener::default()),
        production(catalog.clone()),
    );

    let reports = orchestrator.run(&[address.clone()]);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].exit, ExitReason::ImageProcessed);
    assert_eq!(reports[0].kind, Some(SourceKind::Image));
    assert_eq!(reports[0].frames, 1);
    assert_eq!(reports[0].events, 1);

    let events = catalog.events()?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1.stream_address, address);
    assert_eq!(events[0].1.count(), 1);
    assert_eq!(events[0].1.objects[0].class_name, "bird");
    Ok(())
}
