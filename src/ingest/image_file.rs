//! Still image frame source.
//!
//! The image is decoded once at open time. Every read returns the same cached
//! frame; pipelines run a single detection pass over image sources.

use anyhow::{anyhow, Context, Result};

use super::{FrameRead, FrameSource, SourceKind};
use crate::frame::Frame;

pub struct ImageSource {
    address: String,
    frame: Frame,
}

impl ImageSource {
    pub fn open(path: &str) -> Result<Self> {
        let decoded = image::open(path)
            .with_context(|| format!("error reading image from {}", path))?
            .to_rgb8();
        let (width, height) = decoded.dimensions();
        if width == 0 || height == 0 {
            return Err(anyhow!("image {} is empty", path));
        }
        let frame = Frame::new(decoded.into_raw(), width, height)?;
        log::info!("ImageSource: loaded {} ({}x{})", path, width, height);
        Ok(Self {
            address: path.to_string(),
            frame,
        })
    }
}

impl FrameSource for ImageSource {
    fn address(&self) -> &str {
        &self.address
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Image
    }

    fn next_frame(&mut self) -> Result<FrameRead> {
        Ok(FrameRead::Frame(self.frame.clone()))
    }
}
