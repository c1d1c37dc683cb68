//! Network stream frame source.
//!
//! `StreamSource` decodes an RTSP stream through a GStreamer pipeline:
//! `rtspsrc ! decodebin ! videoconvert ! appsink`. The appsink keeps a single
//! buffer and drops older ones, so every read returns the freshest frame and
//! the pipeline never accumulates backlog behind a slow detector.
//!
//! Connecting is bounded by `StreamConfig::connect_timeout`. Requires the
//! `rtsp-gstreamer` feature; without it every connect attempt fails.

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::{anyhow, Context};
use anyhow::Result;
use std::time::Duration;

use super::{ConnectOutcome, FrameRead, FrameSource, SourceKind, DEFAULT_CONNECT_TIMEOUT};
#[cfg(feature = "rtsp-gstreamer")]
use crate::frame::Frame;

/// Configuration for a network stream source.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Stream URL (e.g. "rtsp://10.0.0.5:554/live").
    pub url: String,
    /// Bound on pipeline setup.
    pub connect_timeout: Duration,
    /// How long a single read waits for a fresh sample.
    pub frame_timeout: Duration,
    /// Jitter buffer latency handed to rtspsrc, in milliseconds.
    pub latency_ms: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            frame_timeout: Duration::from_millis(500),
            latency_ms: 0,
        }
    }
}

impl StreamConfig {
    fn pipeline_description(&self) -> String {
        format!(
            "rtspsrc location={} latency={} ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            self.url, self.latency_ms
        )
    }
}

/// A connected network stream.
pub struct StreamSource {
    url: String,
    frame_count: u64,
    #[cfg(feature = "rtsp-gstreamer")]
    inner: GstreamerStream,
}

impl StreamSource {
    /// Build the pipeline and bring it to Playing within the configured bound.
    pub fn connect(config: StreamConfig) -> ConnectOutcome<Self> {
        if !config.url.to_lowercase().starts_with("rtsp") {
            return ConnectOutcome::Failed(anyhow::anyhow!(
                "stream source {} is not an rtsp url",
                config.url
            ));
        }

        #[cfg(feature = "rtsp-gstreamer")]
        {
            let url = config.url.clone();
            let timeout = config.connect_timeout;
            let outcome = super::connect_bounded(&url.clone(), timeout, move || {
                GstreamerStream::start(config)
            });
            match &outcome {
                ConnectOutcome::Connected(_) => log::info!("StreamSource: connected to {}", url),
                ConnectOutcome::TimedOut(after) => {
                    log::warn!("StreamSource: {} did not connect within {:?}", url, after)
                }
                ConnectOutcome::Failed(err) => {
                    log::warn!("StreamSource: failed to connect to {}: {:#}", url, err)
                }
            }
            outcome.map(|inner| Self {
                url,
                frame_count: 0,
                inner,
            })
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            ConnectOutcome::Failed(super::feature_required(
                &format!("stream source {}", config.url),
                "rtsp-gstreamer",
            ))
        }
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }
}

impl FrameSource for StreamSource {
    fn address(&self) -> &str {
        &self.url
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Stream
    }

    fn next_frame(&mut self) -> Result<FrameRead> {
        #[cfg(feature = "rtsp-gstreamer")]
        {
            let read = self.inner.next_frame()?;
            if matches!(read, FrameRead::Frame(_)) {
                self.frame_count += 1;
            }
            Ok(read)
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            Ok(FrameRead::EndOfInput)
        }
    }

    fn close(&mut self) {
        #[cfg(feature = "rtsp-gstreamer")]
        self.inner.stop();
        log::info!(
            "StreamSource: closed {} after {} frames",
            self.url,
            self.frame_count
        );
    }
}

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerStream {
    config: StreamConfig,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    stopped: bool,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerStream {
    fn start(config: StreamConfig) -> Result<Self> {
        use gstreamer::prelude::*;

        gstreamer::init().context("initialize gstreamer")?;

        let pipeline = gstreamer::parse::launch(&config.pipeline_description())
            .context("build stream pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("stream pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        let mut stream = Self {
            config,
            pipeline,
            appsink,
            stopped: false,
        };

        stream
            .pipeline
            .set_state(gstreamer::State::Playing)
            .context("set stream pipeline to Playing")?;

        // Bounded here as well so an abandoned attempt still tears down.
        let wait = gstreamer::ClockTime::from_mseconds(
            stream.config.connect_timeout.as_millis() as u64,
        );
        let (result, current, _pending) = stream.pipeline.state(wait);
        if let Err(err) = result {
            stream.stop();
            return Err(anyhow!("stream pipeline failed to start: {}", err));
        }
        if current != gstreamer::State::Playing {
            stream.stop();
            return Err(anyhow!(
                "stream pipeline stuck in {:?} for {}",
                current,
                stream.config.url
            ));
        }

        Ok(stream)
    }

    fn next_frame(&mut self) -> Result<FrameRead> {
        if self.bus_reached_end()? {
            return Ok(FrameRead::EndOfInput);
        }

        let wait =
            gstreamer::ClockTime::from_mseconds(self.config.frame_timeout.as_millis() as u64);
        let Some(sample) = self.appsink.try_pull_sample(wait) else {
            if self.appsink.is_eos() {
                return Ok(FrameRead::EndOfInput);
            }
            return Ok(FrameRead::Empty);
        };

        let (pixels, width, height) = sample_to_pixels(&sample)?;
        if pixels.is_empty() {
            return Ok(FrameRead::Empty);
        }
        Ok(FrameRead::Frame(Frame::new(pixels, width, height)?))
    }

    /// Drain pending bus messages. Errors are fatal, EOS ends the stream.
    fn bus_reached_end(&mut self) -> Result<bool> {
        use gstreamer::prelude::*;

        let Some(bus) = self.pipeline.bus() else {
            return Ok(false);
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(anyhow!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => return Ok(true),
                _ => {}
            }
        }
        Ok(false)
    }

    fn stop(&mut self) {
        use gstreamer::prelude::*;

        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("StreamSource: failed to stop {}: {}", self.config.url, err);
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl Drop for GstreamerStream {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("stream sample missing buffer")?;
    let caps = sample.caps().context("stream sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse stream caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map stream buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let pixels = data
            .get(..row_bytes * height as usize)
            .context("stream buffer is shorter than its caps")?;
        return Ok((pixels.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("stream buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
