use anyhow::{Context, Result};
use std::path::Path;

/// Class-name table indexed by detector class index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassLabels {
    names: Vec<String>,
}

impl ClassLabels {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Read one class name per line. Trailing whitespace is dropped, blank
    /// lines keep their slot so indices stay aligned with the model.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read class labels from {}", path.display()))?;
        Ok(Self::parse(&raw))
    }

    pub fn parse(raw: &str) -> Self {
        Self {
            names: raw.lines().map(|line| line.trim_end().to_string()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Name for a class index; indices outside the table are named `class{N}`.
    pub fn name(&self, class_index: usize) -> String {
        self.names
            .get(class_index)
            .cloned()
            .unwrap_or_else(|| format!("class{}", class_index))
    }
}
