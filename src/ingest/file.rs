//! Local video frame source.
//!
//! This module provides `VideoSource` for video files and local capture
//! devices. The video source is responsible for:
//! - Opening a local file or `/dev/videoN` device (device index `N`)
//! - Skipping `stride` decoded frames before each returned frame
//! - Reporting end of stream as `FrameRead::EndOfInput`, not as an error
//!
//! Decoding requires the `ingest-file-ffmpeg` feature.

use anyhow::{anyhow, Result};

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegVideoSource;
use super::{is_device_index, FrameRead, FrameSource, SourceKind};

/// Configuration for a local video source.
#[derive(Clone, Debug)]
pub struct VideoConfig {
    /// File path (e.g. "/var/lib/agent/feeder.mp4") or device index ("0").
    pub address: String,
    /// Decoded frames discarded before each returned frame.
    pub stride: u32,
}

impl VideoConfig {
    /// Path handed to the decoder; device indices map to V4L2 nodes.
    pub fn decoder_path(&self) -> String {
        if is_device_index(&self.address) {
            format!("/dev/video{}", self.address)
        } else {
            self.address.clone()
        }
    }

    pub fn is_device(&self) -> bool {
        is_device_index(&self.address)
    }
}

/// Local video frame source.
pub struct VideoSource {
    address: String,
    #[cfg(feature = "ingest-file-ffmpeg")]
    backend: FfmpegVideoSource,
}

impl VideoSource {
    pub fn open(config: VideoConfig) -> Result<Self> {
        if config.address.contains("://") {
            return Err(anyhow!(
                "video ingestion only supports local paths and device indices (no URL schemes)"
            ));
        }

        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            let address = config.address.clone();
            let backend = FfmpegVideoSource::open(config)?;
            Ok(Self { address, backend })
        }
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            Err(super::feature_required(
                &format!("video source {}", config.address),
                "ingest-file-ffmpeg",
            ))
        }
    }

    /// Frames returned so far.
    pub fn frames_captured(&self) -> u64 {
        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            self.backend.frames_captured()
        }
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            0
        }
    }
}

impl FrameSource for VideoSource {
    fn address(&self) -> &str {
        &self.address
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Video
    }

    fn next_frame(&mut self) -> Result<FrameRead> {
        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            self.backend.next_frame()
        }
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            Ok(FrameRead::EndOfInput)
        }
    }

    fn close(&mut self) {
        log::info!(
            "VideoSource: closed {} after {} frames",
            self.address,
            self.frames_captured()
        );
    }
}
