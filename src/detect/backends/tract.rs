#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use tract_onnx::prelude::*;

use crate::detect::backend::{BlobParams, ComputeTarget, DetectorBackend, ModelSpec};
use crate::detect::result::OutputTensor;
use crate::frame::Frame;

/// Tract-based backend for ONNX inference.
///
/// Loads a local detection model (e.g. a YOLO export whose outputs are
/// `[.., anchors, 5 + classes]`) and runs it on the CPU.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference at the
    /// blob's input size.
    pub fn new<P: AsRef<Path>>(model_path: P, blob: &BlobParams) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, blob.height as usize, blob.width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width: blob.width,
            height: blob.height,
        })
    }

    /// Registry factory: GPU placement is not available and falls back to CPU.
    pub fn from_spec(spec: &ModelSpec) -> Result<Box<dyn DetectorBackend>> {
        if spec.target == ComputeTarget::Gpu {
            log::warn!("tract backend runs on cpu only; ignoring gpu target");
        }
        Ok(Box::new(Self::new(&spec.model_path, &spec.blob)?))
    }

    fn build_input(&self, frame: &Frame, blob: &BlobParams) -> Result<Tensor> {
        if blob.width != self.width || blob.height != self.height {
            return Err(anyhow!(
                "blob size {}x{} does not match model input {}x{}",
                blob.width,
                blob.height,
                self.width,
                self.height
            ));
        }

        let rgb = image::RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;
        let resized = if frame.width == blob.width && frame.height == blob.height {
            rgb
        } else {
            image::imageops::resize(&rgb, blob.width, blob.height, FilterType::Triangle)
        };

        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, blob.height as usize, blob.width as usize),
            |(_, channel, y, x)| {
                let source_channel = if blob.swap_rb { 2 - channel } else { channel };
                let value = resized.get_pixel(x as u32, y as u32)[source_channel] as f32;
                (value - blob.mean[channel]) * blob.scale
            },
        );

        Ok(input.into_tensor())
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn infer(&mut self, frame: &Frame, blob: &BlobParams) -> Result<Vec<OutputTensor>> {
        let input = self.build_input(frame, blob)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;

        let mut tensors = Vec::with_capacity(outputs.len());
        for output in outputs.iter() {
            let view = output
                .to_array_view::<f32>()
                .context("model output tensor was not f32")?;
            let cols = view.shape().last().copied().unwrap_or(0);
            let data: Vec<f32> = view.iter().copied().collect();
            tensors.push(OutputTensor::new(cols, data)?);
        }
        Ok(tensors)
    }
}
