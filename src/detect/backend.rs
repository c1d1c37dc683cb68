use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::str::FromStr;

use crate::detect::result::OutputTensor;
use crate::frame::Frame;

/// Normalization applied when a frame is turned into a network input blob.
///
/// Pixel value `v` in channel `c` becomes `(v - mean[c]) * scale` after the
/// frame is resized to `width x height`. Frames are RGB; `swap_rb` swaps the
/// first and last channel before normalization.
#[derive(Clone, Debug, PartialEq)]
pub struct BlobParams {
    pub scale: f32,
    pub width: u32,
    pub height: u32,
    pub mean: [f32; 3],
    pub swap_rb: bool,
}

impl Default for BlobParams {
    fn default() -> Self {
        Self {
            scale: 1.0 / 255.0,
            width: 416,
            height: 416,
            mean: [0.0, 0.0, 0.0],
            swap_rb: false,
        }
    }
}

/// Where a backend should run its model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ComputeTarget {
    #[default]
    Cpu,
    Gpu,
}

impl FromStr for ComputeTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "gpu" | "cuda" => Ok(Self::Gpu),
            other => Err(anyhow!("unknown compute target '{}' (cpu/gpu)", other)),
        }
    }
}

impl std::fmt::Display for ComputeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Gpu => write!(f, "gpu"),
        }
    }
}

/// Model artifact, placement and input geometry handed to backend factories.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelSpec {
    pub model_path: PathBuf,
    pub target: ComputeTarget,
    pub blob: BlobParams,
}

/// Detector backend trait.
///
/// A backend is the inference collaborator: it turns one frame into raw output
/// tensors whose rows follow the `[x, y, w, h, objectness, class scores..]`
/// layout. Each pipeline task owns its own backend instance, so `infer` may
/// keep per-call scratch state.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run inference on a frame.
    fn infer(&mut self, frame: &Frame, blob: &BlobParams) -> Result<Vec<OutputTensor>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
