use anyhow::{anyhow, Result};

/// Column where the class-score vector starts in every output row
/// (`x, y, w, h, objectness`, then one score per class).
pub const CLASS_SCORE_OFFSET: usize = 5;

/// One raw output tensor flattened to a row-major `rows x cols` matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputTensor {
    cols: usize,
    data: Vec<f32>,
}

impl OutputTensor {
    pub fn new(cols: usize, data: Vec<f32>) -> Result<Self> {
        if cols == 0 && !data.is_empty() {
            return Err(anyhow!("output tensor with zero columns carries data"));
        }
        if cols != 0 && data.len() % cols != 0 {
            return Err(anyhow!(
                "output tensor length {} is not a multiple of {} columns",
                data.len(),
                cols
            ));
        }
        Ok(Self { cols, data })
    }

    /// Build a tensor from explicit rows; all rows must share one width.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let cols = rows.first().map(Vec::len).unwrap_or(0);
        if rows.iter().any(|row| row.len() != cols) {
            return Err(anyhow!("output rows have inconsistent widths"));
        }
        Self::new(cols, rows.concat())
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn row_count(&self) -> usize {
        if self.cols == 0 {
            0
        } else {
            self.data.len() / self.cols
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        // cols == 0 implies no data
        self.data.chunks_exact(self.cols.max(1))
    }
}

/// One anchor's raw output, borrowed from its tensor row.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawDetection<'a> {
    /// Normalized center and size, relative to the frame.
    pub center_x: f32,
    pub center_y: f32,
    pub width: f32,
    pub height: f32,
    pub scores: &'a [f32],
}

impl<'a> RawDetection<'a> {
    /// `None` for rows too short to hold geometry and objectness.
    pub fn from_row(row: &'a [f32]) -> Option<Self> {
        if row.len() < CLASS_SCORE_OFFSET {
            return None;
        }
        Some(Self {
            center_x: row[0],
            center_y: row[1],
            width: row[2],
            height: row[3],
            scores: &row[CLASS_SCORE_OFFSET..],
        })
    }
}

/// All raw detections across output tensors, in scan order.
pub fn raw_detections(outputs: &[OutputTensor]) -> impl Iterator<Item = RawDetection<'_>> {
    outputs
        .iter()
        .flat_map(|output| output.rows())
        .filter_map(RawDetection::from_row)
}
