//! Frame ingestion sources.
//!
//! This module resolves a source address to a `SourceKind` and opens it:
//! - Images (`.jpg`, `.jpeg`, `.png`): decoded once, the same frame is
//!   returned on every read
//! - Video files (`.mp4`) and local devices (`0`, `1`, ..): FFmpeg decode,
//!   each read skips a configured stride of frames (feature: ingest-file-ffmpeg)
//! - Network streams (`rtsp://..`): GStreamer decode, each read returns the
//!   freshest frame (feature: rtsp-gstreamer)
//!
//! Opening a network stream is a bounded-time operation: the connection attempt
//! runs on its own thread and races a timer (`connect_bounded`), resolving to
//! exactly one of connected, timed out or failed.

mod connect;
pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
pub mod image_file;
pub mod rtsp;

use anyhow::{anyhow, Result};
use std::fmt;
use std::time::Duration;

use crate::frame::Frame;

pub use connect::{connect_bounded, ConnectOutcome};
pub use file::{VideoConfig, VideoSource};
pub use image_file::ImageSource;
pub use rtsp::{StreamConfig, StreamSource};

/// Frames skipped between two video reads.
pub const DEFAULT_VIDEO_STRIDE: u32 = 25;
/// Upper bound on network stream connection setup.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Source type derived from the address syntax.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Image,
    Video,
    Stream,
}

impl SourceKind {
    /// Classify an address; `None` for unsupported sources.
    pub fn classify(address: &str) -> Option<Self> {
        let address = address.trim();
        let lower = address.to_lowercase();
        if lower.ends_with(".jpg") || lower.ends_with(".jpeg") || lower.ends_with(".png") {
            Some(Self::Image)
        } else if lower.ends_with(".mp4") || is_device_index(address) {
            Some(Self::Video)
        } else if lower.starts_with("rtsp") {
            Some(Self::Stream)
        } else {
            None
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image => write!(f, "IMAGE"),
            Self::Video => write!(f, "VIDEO"),
            Self::Stream => write!(f, "STREAM"),
        }
    }
}

pub(crate) fn is_device_index(address: &str) -> bool {
    !address.is_empty() && address.chars().all(|c| c.is_ascii_digit())
}

/// Result of one acquisition attempt.
#[derive(Debug)]
pub enum FrameRead {
    Frame(Frame),
    /// Nothing decodable this time; the next read may succeed.
    Empty,
    /// The source is exhausted or closed. Not an error.
    EndOfInput,
}

/// A connected frame source, owned by exactly one pipeline task.
pub trait FrameSource: Send {
    fn address(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Acquire the next frame according to the source's policy.
    fn next_frame(&mut self) -> Result<FrameRead>;

    /// Release the underlying connection. Called once on every exit path.
    fn close(&mut self) {}
}

/// Per-source acquisition settings shared by every task.
#[derive(Clone, Debug)]
pub struct SourceSettings {
    pub video_stride: u32,
    pub connect_timeout: Duration,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            video_stride: DEFAULT_VIDEO_STRIDE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Opens sources for pipeline tasks.
pub trait SourceOpener: Send + Sync {
    fn open(&self, address: &str, kind: SourceKind) -> ConnectOutcome<Box<dyn FrameSource>>;
}

/// Opener backed by the built-in image, video and stream sources.
#[derive(Clone, Debug, Default)]
pub struct DefaultSourceOpener {
    settings: SourceSettings,
}

impl DefaultSourceOpener {
    pub fn new(settings: SourceSettings) -> Self {
        Self { settings }
    }
}

impl SourceOpener for DefaultSourceOpener {
    fn open(&self, address: &str, kind: SourceKind) -> ConnectOutcome<Box<dyn FrameSource>> {
        match kind {
            SourceKind::Image => ConnectOutcome::from_result(
                ImageSource::open(address).map(|s| Box::new(s) as Box<dyn FrameSource>),
            ),
            SourceKind::Video => {
                let config = VideoConfig {
                    address: address.to_string(),
                    stride: self.settings.video_stride,
                };
                ConnectOutcome::from_result(
                    VideoSource::open(config).map(|s| Box::new(s) as Box<dyn FrameSource>),
                )
            }
            SourceKind::Stream => {
                let config = StreamConfig {
                    url: address.to_string(),
                    connect_timeout: self.settings.connect_timeout,
                    ..StreamConfig::default()
                };
                StreamSource::connect(config).map(|s| Box::new(s) as Box<dyn FrameSource>)
            }
        }
    }
}

/// Helper for sources that cannot produce frames without a feature.
pub(crate) fn feature_required(what: &str, feature: &str) -> anyhow::Error {
    anyhow!("{} requires the {} feature", what, feature)
}
