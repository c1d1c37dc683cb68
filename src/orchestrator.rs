//! Multi-source orchestration.
//!
//! Every source gets its own named thread running a `DetectionPipeline`. The
//! orchestrator shares only read-only configuration and the thread-safe
//! collaborators with its tasks, and `run` returns once every task has
//! terminated. A failing or panicking task never affects its siblings.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::alert::AlertDispatcher;
use crate::catalog::Catalog;
use crate::detect::{BackendRegistry, DetectorBackend, ModelSpec};
use crate::ingest::SourceOpener;
use crate::pipeline::{
    ClassResolution, DetectionPipeline, DetectorLoader, ExitReason, FrameSink, InspectionSink,
    LogRenderer, PipelineConfig, PipelineReport, ProductionSink,
};

/// Builds the frame sink of one task, given its source address.
pub type SinkFactory = dyn Fn(&str) -> Box<dyn FrameSink> + Send + Sync;

/// Sinks that persist events and dispatch alerts.
pub fn production_sinks(
    catalog: Arc<dyn Catalog>,
    dispatcher: Arc<AlertDispatcher>,
    resolution: ClassResolution,
) -> Arc<SinkFactory> {
    Arc::new(move |_address: &str| -> Box<dyn FrameSink> {
        Box::new(ProductionSink::new(
            catalog.clone(),
            dispatcher.clone(),
            resolution,
        ))
    })
}

/// Sinks that log each frame's objects.
pub fn inspection_sinks() -> Arc<SinkFactory> {
    Arc::new(|_address: &str| -> Box<dyn FrameSink> {
        Box::new(InspectionSink::new(Box::new(LogRenderer)))
    })
}

pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    opener: Arc<dyn SourceOpener>,
    registry: Arc<BackendRegistry>,
    backend: Option<String>,
    model: ModelSpec,
    sinks: Arc<SinkFactory>,
    shutdown: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<PipelineConfig>,
        opener: Arc<dyn SourceOpener>,
        registry: Arc<BackendRegistry>,
        model: ModelSpec,
        sinks: Arc<SinkFactory>,
    ) -> Self {
        Self {
            config,
            opener,
            registry,
            backend: None,
            model,
            sinks,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Use a named backend instead of the registry default.
    pub fn with_backend(mut self, name: Option<String>) -> Self {
        self.backend = name;
        self
    }

    /// Share an externally owned shutdown flag (e.g. set by a signal handler).
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    fn detector_loader(&self) -> DetectorLoader {
        let registry = self.registry.clone();
        let backend = self.backend.clone();
        let spec = self.model.clone();
        Box::new(move || -> anyhow::Result<Box<dyn DetectorBackend>> {
            match backend.as_deref() {
                Some(name) => registry.create(name, &spec),
                None => registry.create_default(&spec),
            }
        })
    }

    /// Run one task per source and wait for all of them. Reports come back in
    /// source order.
    pub fn run(&self, sources: &[String]) -> Vec<PipelineReport> {
        if sources.is_empty() {
            log::warn!("no sources configured, nothing to do");
            return Vec::new();
        }

        let mut handles = Vec::with_capacity(sources.len());
        for (index, address) in sources.iter().enumerate() {
            let pipeline = DetectionPipeline::new(
                address,
                self.config.clone(),
                self.opener.clone(),
                (self.sinks)(address.as_str()),
                self.shutdown.clone(),
            );
            let loader = self.detector_loader();
            let spawned = std::thread::Builder::new()
                .name(format!("detect-{}", index))
                .spawn(move || pipeline.run(loader));
            match spawned {
                Ok(handle) => handles.push((address.clone(), Some(handle))),
                Err(err) => {
                    log::error!("{}: failed to spawn task: {}", address, err);
                    handles.push((address.clone(), None));
                }
            }
        }
        log::info!("started {} detection task(s)", handles.len());

        let mut reports = Vec::with_capacity(handles.len());
        for (address, handle) in handles {
            let report = match handle {
                Some(handle) => handle.join().unwrap_or_else(|_| {
                    log::error!("{}: task panicked", address);
                    PipelineReport {
                        exit: ExitReason::Panicked,
                        ..PipelineReport::new(&address)
                    }
                }),
                None => PipelineReport::new(&address),
            };
            reports.push(report);
        }

        for report in &reports {
            let kind = report
                .kind
                .map(|kind| kind.to_string())
                .unwrap_or_else(|| "?".to_string());
            if report.exit.is_failure() {
                log::warn!(
                    "{} [{}]: {} ({} frames, {} events, {} alerts)",
                    report.address,
                    kind,
                    report.exit,
                    report.frames,
                    report.events,
                    report.alerts
                );
            } else {
                log::info!(
                    "{} [{}]: {} ({} frames, {} events, {} alerts)",
                    report.address,
                    kind,
                    report.exit,
                    report.frames,
                    report.events,
                    report.alerts
                );
            }
        }
        reports
    }
}
