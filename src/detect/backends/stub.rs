use anyhow::Result;

use crate::detect::backend::{BlobParams, DetectorBackend};
use crate::detect::result::OutputTensor;
use crate::frame::Frame;

/// Stub backend for testing and dry runs. Replays the same rows for every frame.
pub struct StubBackend {
    output: Option<OutputTensor>,
    calls: u64,
}

impl StubBackend {
    /// Backend that reports the given rows on every call.
    pub fn with_rows(rows: &[Vec<f32>]) -> Result<Self> {
        Ok(Self {
            output: Some(OutputTensor::from_rows(rows)?),
            calls: 0,
        })
    }

    /// Backend that never detects anything.
    pub fn empty() -> Self {
        Self {
            output: None,
            calls: 0,
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::empty()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(&mut self, _frame: &Frame, _blob: &BlobParams) -> Result<Vec<OutputTensor>> {
        self.calls += 1;
        Ok(self.output.iter().cloned().collect())
    }
}
