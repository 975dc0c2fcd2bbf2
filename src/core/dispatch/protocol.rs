//! Line protocol spoken by external normalization workers.
//!
//! The worker receives one argument: the base64 encoding of a JSON array
//! of tile directory paths. It reports on its combined stdout/stderr:
//! - a line equal to [`PROGRESS_SENTINEL`] finishes one directory
//! - a line containing [`FAILURE_MARKER`] reports a failed directory
//! - anything else is free status text
//!
//! Exit code 0 means every directory was processed.

use crate::error::DispatchError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::path::PathBuf;

/// One unit of progress
pub const PROGRESS_SENTINEL: &str = "Next";
/// Substring of any line reporting a failed directory
pub const FAILURE_MARKER: &str = "Failed to normalize";
/// Status shown for a worker whose output has ended
pub const DONE_LINE: &str = "[Done]";
/// Environment variable carrying the protocol version to workers
pub const PROTOCOL_ENV: &str = "SLIDE_NORM_PROTOCOL";
pub const PROTOCOL_VERSION: &str = "1";

const PANEL_PLACEHOLDER: &str = "[Retrieving processor updates...]";

/// Encode a directory list into a single shell-safe argument
pub fn encode_argument(directories: &[PathBuf]) -> Result<String, DispatchError> {
    let paths: Vec<String> = directories
        .iter()
        .map(|p| p.to_string_lossy().to_string())
        .collect();
    let json =
        serde_json::to_string(&paths).map_err(|e| DispatchError::EncodeFailed(e.to_string()))?;
    Ok(STANDARD.encode(json))
}

/// Inverse of [`encode_argument`], for worker implementations
pub fn decode_argument(argument: &str) -> Result<Vec<PathBuf>, DispatchError> {
    let bytes = STANDARD
        .decode(argument.trim())
        .map_err(|e| DispatchError::EncodeFailed(e.to_string()))?;
    let paths: Vec<String> =
        serde_json::from_slice(&bytes).map_err(|e| DispatchError::EncodeFailed(e.to_string()))?;
    Ok(paths.into_iter().map(PathBuf::from).collect())
}

/// Meaning of one output line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerLine<'a> {
    Progress,
    Failure(&'a str),
    Status(&'a str),
}

impl<'a> WorkerLine<'a> {
    pub fn classify(line: &'a str) -> Self {
        if line == PROGRESS_SENTINEL {
            WorkerLine::Progress
        } else if line.contains(FAILURE_MARKER) {
            WorkerLine::Failure(line)
        } else {
            WorkerLine::Status(line)
        }
    }
}

/// Fixed multi-line status: a header, a blank line, one line per worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPanel {
    lines: Vec<String>,
}

impl StatusPanel {
    pub fn new(workers: usize) -> Self {
        Self {
            lines: vec![PANEL_PLACEHOLDER.to_string(); workers],
        }
    }

    pub fn workers(&self) -> usize {
        self.lines.len()
    }

    /// Replace the line of `worker` (1-based); out-of-range workers are ignored
    pub fn set(&mut self, worker: usize, line: &str) {
        if let Some(slot) = worker.checked_sub(1).and_then(|i| self.lines.get_mut(i)) {
            *slot = line.to_string();
        }
    }

    pub fn render(&self) -> String {
        let mut out = format!("Normalizing images (No. processes: {})\n", self.lines.len());
        for (i, line) in self.lines.iter().enumerate() {
            out.push('\n');
            out.push_str(&format!("Process #{}: {}", i + 1, line));
        }
        out
    }
}
