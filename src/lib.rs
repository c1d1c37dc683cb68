//! Detection Agent
//!
//! This crate implements a multi-source object detection agent. Every configured
//! source (image, video file, local camera or network stream) is processed by an
//! independent task that runs a detector over its frames, fuses overlapping raw
//! detections into a stable per-frame object list, persists detection events and
//! notifies subscribed observers through a per-subscription alert throttle.
//!
//! # Module Structure
//!
//! - `fusion`: Box overlap scoring, class selection and duplicate merging
//! - `frame`: RGB frame container handed from sources to detectors
//! - `ingest`: Frame sources (images, FFmpeg video, GStreamer streams) and
//!   bounded-time connection setup
//! - `detect`: Detector backends, the backend registry and raw output layout
//! - `pipeline`: Per-source state machine (`Connecting → Running → Draining → Terminated`)
//! - `orchestrator`: One thread per source, global join
//! - `catalog`: Streams, observers, subscriptions and detection events
//! - `throttle` / `alert`: Alert throttling and observer notification
//! - `notify`: Outbound delivery (SMTP, MQTT, log)
//! - `config`: Layered configuration (file, environment, CLI)

use anyhow::Result;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod alert;
pub mod catalog;
pub mod config;
pub mod detect;
pub mod frame;
pub mod fusion;
pub mod ingest;
pub mod labels;
pub mod notify;
pub mod orchestrator;
pub mod pipeline;
pub mod throttle;

pub use alert::AlertDispatcher;
pub use catalog::{
    Catalog, DetectionEvent, InMemoryCatalog, SqliteCatalog, StreamInfo, SubscribedObserver,
};
pub use config::{AgentConfig, OperatingMode};
pub use detect::{
    BackendRegistry, BlobParams, ComputeTarget, DetectorBackend, ModelSpec, OutputTensor,
    RawDetection, StubBackend,
};
pub use frame::Frame;
pub use fusion::{classify, fuse, overlap_ratio, BoundingBox, Candidate, DetectedObject};
pub use ingest::{
    connect_bounded, ConnectOutcome, DefaultSourceOpener, FrameRead, FrameSource, SourceKind,
    SourceOpener, SourceSettings,
};
pub use labels::ClassLabels;
pub use notify::{AlertMessage, LogNotifier, MqttNotifier, Notifier, SmtpNotifier};
pub use orchestrator::Orchestrator;
pub use pipeline::{
    ClassResolution, DetectionPipeline, ExitReason, FrameOutcome, FrameSink, InspectionSink,
    LogRenderer, PipelineConfig, PipelineReport, PipelineState, ProductionSink, RenderControl,
    Renderer,
};
pub use throttle::{AlertInterval, AlertThrottle, IntervalUnit, ThrottleDecision};

/// Current wall-clock time in whole seconds since the Unix epoch.
pub fn now_s() -> Result<i64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64)
}
