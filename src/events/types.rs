//! Event type definitions for progress reporting.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// All events emitted by the normalization pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// Run-level events
    Pipeline(PipelineEvent),
    /// External worker events
    Worker(WorkerEvent),
}

/// Stages of a normalization run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStage {
    Init,
    Enumerating,
    Tiling,
    Normalizing,
    Stitching,
    RebuildingProject,
    Done,
    Cancelled,
    Failed,
}

impl RunStage {
    /// Terminal stages accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStage::Done | RunStage::Cancelled | RunStage::Failed)
    }

    /// Share of the total progress bar owned by this stage
    pub fn weight(&self) -> f64 {
        match self {
            RunStage::Tiling => 0.25,
            RunStage::Normalizing => 0.40,
            RunStage::Stitching => 0.32,
            RunStage::RebuildingProject => 0.03,
            _ => 0.0,
        }
    }
}

impl std::fmt::Display for RunStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStage::Init => write!(f, "Starting"),
            RunStage::Enumerating => write!(f, "Gathering image entries"),
            RunStage::Tiling => write!(f, "Writing tiles"),
            RunStage::Normalizing => write!(f, "Normalizing"),
            RunStage::Stitching => write!(f, "Stitching"),
            RunStage::RebuildingProject => write!(f, "Transferring to new project"),
            RunStage::Done => write!(f, "Done"),
            RunStage::Cancelled => write!(f, "Cancelled"),
            RunStage::Failed => write!(f, "Failed"),
        }
    }
}

/// How a run ended, as seen by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Succeeded,
    SucceededWithErrors,
    Cancelled,
    Aborted,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Succeeded => write!(f, "Run completed!"),
            RunOutcome::SucceededWithErrors => {
                write!(f, "Run completed with errors. See log for details.")
            }
            RunOutcome::Cancelled => write!(f, "Run cancelled."),
            RunOutcome::Aborted => {
                write!(f, "Run aborted due to an unhandled error. See log for details.")
            }
        }
    }
}

/// Run-level events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    /// Run has started
    Started,
    /// Moving to a new stage
    StageChanged { stage: RunStage },
    /// Progress ratio in [0, 1] plus the current status text
    Progress { ratio: f64, message: String },
    /// One image or tile directory failed; the run continues
    ItemFailed { item: String, message: String },
    /// Run finished (possibly with per-item errors)
    Completed { summary: RunSummary },
    /// Run was cancelled
    Cancelled,
    /// Run was aborted by a fatal error
    Aborted { message: String },
}

/// Events from external normalization workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerEvent {
    /// A worker process was started on a partition of directories
    Launched { worker: usize, directories: usize },
    /// One line of combined worker output
    Output { worker: usize, line: String },
    /// A worker process exited
    Exited { worker: usize, code: Option<i32> },
}

/// Summary of a finished run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// How the run ended
    pub outcome: RunOutcome,
    /// Project entries accepted for normalization
    pub entries_retained: usize,
    /// Tile directories written during tiling
    pub tile_sets: usize,
    /// Normalized images written to the final directory
    pub images_stitched: usize,
    /// Entries registered in the new project
    pub entries_migrated: usize,
    /// Root of the run's working directories, if they were created
    pub workspace: Option<PathBuf>,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

impl RunSummary {
    /// Human-readable elapsed time, e.g. `Total processing time: 1h 2m 3s.`
    pub fn elapsed_text(&self) -> String {
        format_elapsed(self.duration_ms / 1000)
    }
}

/// Format a duration in seconds, omitting leading zero units
pub fn format_elapsed(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours == 0 && minutes == 0 {
        format!("Total processing time: {}s.", seconds)
    } else if hours == 0 {
        format!("Total processing time: {}m {}s.", minutes, seconds)
    } else {
        format!("Total processing time: {}h {}m {}s.", hours, minutes, seconds)
    }
}
