//! Frame container.
//!
//! `Frame` is the unit handed from a frame source to a detector backend:
//! tightly packed RGB8 pixels plus dimensions. Frames are ephemeral; the
//! pipeline keeps at most the frame currently being processed.

use anyhow::{anyhow, Result};

/// Packed RGB8 frame (`width * height * 3` bytes, row-major, no padding).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected_len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;

        if pixels.len() != expected_len {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{} frame, received {}",
                expected_len,
                width,
                height,
                pixels.len()
            ));
        }

        Ok(Self {
            pixels,
            width,
            height,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// True when the frame carries no pixels at all.
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_mismatched_buffer() {
        assert!(Frame::new(vec![0u8; 10], 2, 2).is_err());
        let frame = Frame::new(vec![0u8; 12], 2, 2).unwrap();
        assert_eq!(frame.pixels().len(), 12);
        assert!(!frame.is_empty());
    }

    #[test]
    fn zero_sized_frame_is_empty() {
        let frame = Frame::new(Vec::new(), 0, 0).unwrap();
        assert!(frame.is_empty());
    }
}
