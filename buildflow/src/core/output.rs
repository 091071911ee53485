//! Handle to a stage's captured output.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where a stage's output went.
///
/// The full stream is written to `log_path` when log persistence is enabled;
/// `excerpt` always holds the last lines kept in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputHandle {
    /// The tail of the merged stdout/stderr stream.
    #[serde(default)]
    pub excerpt: String,
    /// Number of lines the stage produced.
    #[serde(default)]
    pub line_count: u64,
    /// The persisted log file, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

impl OutputHandle {
    /// Creates a handle from an excerpt.
    #[must_use]
    pub fn new(excerpt: impl Into<String>, line_count: u64) -> Self {
        Self {
            excerpt: excerpt.into(),
            line_count,
            log_path: None,
        }
    }

    /// Sets the log file path.
    #[must_use]
    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Returns true if the stage produced no output.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.line_count == 0
    }
}
