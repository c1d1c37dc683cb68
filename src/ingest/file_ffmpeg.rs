//! FFmpeg-backed video decoding.
//!
//! Decodes the best video track of a local file or capture device to RGB24.
//! Each `next_frame` call discards `stride` decoded frames and returns the one
//! after them; a drained decoder reports end of input.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::file::VideoConfig;
use super::FrameRead;
use crate::frame::Frame;

pub(crate) struct FfmpegVideoSource {
    config: VideoConfig,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    frame_count: u64,
    eof_sent: bool,
    finished: bool,
}

impl FfmpegVideoSource {
    pub(crate) fn open(config: VideoConfig) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        if config.is_device() {
            ffmpeg::device::register_all();
        }

        let path = config.decoder_path();
        let input = ffmpeg::format::input(&path)
            .with_context(|| format!("error opening video capture device: {}", path))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("{} has no video track", path))?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        log::info!(
            "VideoSource: opened {} ({}x{}, stride {})",
            path,
            decoder.width(),
            decoder.height(),
            config.stride
        );

        Ok(Self {
            config,
            input,
            stream_index,
            decoder,
            scaler,
            frame_count: 0,
            eof_sent: false,
            finished: false,
        })
    }

    pub(crate) fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    pub(crate) fn next_frame(&mut self) -> Result<FrameRead> {
        for _ in 0..self.config.stride {
            if self.decode_next()?.is_none() {
                return Ok(FrameRead::EndOfInput);
            }
        }

        let Some(decoded) = self.decode_next()? else {
            return Ok(FrameRead::EndOfInput);
        };

        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(&decoded, &mut rgb_frame)
            .context("scale frame to RGB")?;
        let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
        if pixels.is_empty() {
            return Ok(FrameRead::Empty);
        }

        self.frame_count += 1;
        Ok(FrameRead::Frame(Frame::new(pixels, width, height)?))
    }

    /// Next decoded frame, or `None` once the decoder is drained.
    fn decode_next(&mut self) -> Result<Option<ffmpeg::frame::Video>> {
        if self.finished {
            return Ok(None);
        }

        let mut decoded = ffmpeg::frame::Video::empty();
        if self.decoder.receive_frame(&mut decoded).is_ok() {
            return Ok(Some(decoded));
        }

        while !self.eof_sent {
            let mut sent = false;
            for (stream, packet) in self.input.packets() {
                if stream.index() != self.stream_index {
                    continue;
                }
                self.decoder
                    .send_packet(&packet)
                    .context("send packet to ffmpeg decoder")?;
                sent = true;
                break;
            }

            if !sent {
                self.decoder.send_eof().context("flush ffmpeg decoder")?;
                self.eof_sent = true;
            }

            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return Ok(Some(decoded));
            }
        }

        if self.decoder.receive_frame(&mut decoded).is_ok() {
            return Ok(Some(decoded));
        }

        self.finished = true;
        Ok(None)
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
