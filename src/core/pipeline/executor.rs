//! Pipeline execution implementation.

use super::enumerate::{enumerate_entries, tiling_passes, SourceImageRecord};
use super::state::{CancellationToken, RunState};
use crate::core::dispatch::{list_directories, processors_to_use, WorkerCommand, WorkerDispatcher};
use crate::core::project::{ImageEntry, ImageType, ProjectStore, SqliteProject, StainVectors};
use crate::core::slide::{PyramidWriter, RasterSlideOpener, SlideOpener, TiffPyramidWriter};
use crate::core::tiles::{extract_tiles, stitch, ExtractOptions, StitchOptions, DEFAULT_FINAL_SUFFIX};
use crate::core::tiling::{build_exclusion_geometry, MaskMode, Watermark};
use crate::core::workspace::{delete_directory, WorkspaceLayout};
use crate::error::{NormalizerError, ProjectError, SlideError, TilingError};
use crate::events::{null_sender, EventSender, PipelineEvent, RunOutcome, RunStage, RunSummary};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Default worker executable, looked up on `PATH`
pub const DEFAULT_WORKER: &str = "slide-norm-worker";

/// Configuration for a normalization run
#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    /// Edge length of extracted tiles, in pixels
    pub tile_size: u32,
    /// Appended to the base name of every stitched image
    pub final_suffix: String,
    pub worker: WorkerCommand,
    /// Number of worker processes
    pub workers: usize,
    pub tile_mask: MaskMode,
    pub reference_mask: MaskMode,
    /// Remove each tile directory once it is stitched
    pub delete_patches: bool,
    /// Read and write tiles on the rayon pool
    pub parallel_io: bool,
    /// Rows per strip of the written pyramids
    pub pyramid_tile_size: u32,
    /// Largest region, in pixels, the stitcher may compose in one read
    pub max_canvas_pixels: Option<u64>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            tile_size: 5000,
            final_suffix: DEFAULT_FINAL_SUFFIX.to_string(),
            worker: WorkerCommand::new(DEFAULT_WORKER),
            workers: 1,
            tile_mask: MaskMode::Watermarked(Watermark::default()),
            reference_mask: MaskMode::Solid,
            delete_patches: true,
            parallel_io: true,
            pyramid_tile_size: 512,
            max_canvas_pixels: None,
        }
    }
}

impl NormalizerConfig {
    fn extract_options(&self) -> ExtractOptions {
        ExtractOptions {
            tile_size: self.tile_size,
            tile_mask: self.tile_mask.clone(),
            reference_mask: self.reference_mask.clone(),
            parallel: self.parallel_io,
        }
    }

    fn stitch_options(&self) -> StitchOptions {
        StitchOptions {
            suffix: self.final_suffix.clone(),
            delete_on_completion: self.delete_patches,
            parallel: self.parallel_io,
            max_canvas_pixels: self.max_canvas_pixels,
        }
    }
}

/// Opens (or creates) the project the normalized images are registered in
pub type ProjectFactory =
    Box<dyn Fn(&Path) -> Result<Box<dyn ProjectStore>, ProjectError> + Send + Sync>;

fn open_sqlite_project(dir: &Path) -> Result<Box<dyn ProjectStore>, ProjectError> {
    Ok(Box::new(SqliteProject::open(dir)?))
}

/// Builder for the orchestrator
pub struct OrchestratorBuilder {
    config: NormalizerConfig,
    workspace_root: Option<PathBuf>,
    opener: Option<Box<dyn SlideOpener>>,
    writer: Option<Box<dyn PyramidWriter>>,
    project_factory: Option<ProjectFactory>,
    cancel: CancellationToken,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: NormalizerConfig::default(),
            workspace_root: None,
            opener: None,
            writer: None,
            project_factory: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: NormalizerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tile_size(mut self, tile_size: u32) -> Self {
        self.config.tile_size = tile_size;
        self
    }

    pub fn final_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.config.final_suffix = suffix.into();
        self
    }

    pub fn worker(mut self, command: WorkerCommand) -> Self {
        self.config.worker = command;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers.max(1);
        self
    }

    /// One worker, or as many as [`processors_to_use`] suggests
    pub fn multiprocess(mut self, enabled: bool) -> Self {
        self.config.workers = if enabled { processors_to_use() } else { 1 };
        self
    }

    pub fn tile_mask(mut self, mode: MaskMode) -> Self {
        self.config.tile_mask = mode;
        self
    }

    pub fn reference_mask(mut self, mode: MaskMode) -> Self {
        self.config.reference_mask = mode;
        self
    }

    /// Watermark tiles with `watermark` instead of the built-in glyph
    pub fn watermark(mut self, watermark: Watermark) -> Self {
        self.config.tile_mask = MaskMode::Watermarked(watermark);
        self
    }

    pub fn delete_patches(mut self, delete: bool) -> Self {
        self.config.delete_patches = delete;
        self
    }

    pub fn parallel_io(mut self, parallel: bool) -> Self {
        self.config.parallel_io = parallel;
        self
    }

    pub fn pyramid_tile_size(mut self, rows: u32) -> Self {
        self.config.pyramid_tile_size = rows.max(1);
        self
    }

    pub fn max_canvas_pixels(mut self, max: u64) -> Self {
        self.config.max_canvas_pixels = Some(max);
        self
    }

    /// Create the working directories under `root` instead of next to the
    /// source project
    pub fn workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    pub fn opener(mut self, opener: Box<dyn SlideOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    pub fn writer(mut self, writer: Box<dyn PyramidWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn project_factory(mut self, factory: ProjectFactory) -> Self {
        self.project_factory = Some(factory);
        self
    }

    /// Share an existing cancellation token
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn build(self) -> Orchestrator {
        let writer = self
            .writer
            .unwrap_or_else(|| Box::new(TiffPyramidWriter::new(self.config.pyramid_tile_size)));
        Orchestrator {
            config: self.config,
            workspace_root: self.workspace_root,
            opener: self.opener.unwrap_or_else(|| Box::new(RasterSlideOpener::new())),
            writer,
            project_factory: self
                .project_factory
                .unwrap_or_else(|| Box::new(open_sqlite_project)),
            cancel: self.cancel,
        }
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters collected while a run progresses
#[derive(Debug, Default)]
struct RunProgress {
    stage: Option<RunStage>,
    layout: Option<WorkspaceLayout>,
    entries_retained: usize,
    tile_sets: usize,
    images_stitched: usize,
    entries_migrated: usize,
}

/// Drives a normalization run from project entries to a new project
pub struct Orchestrator {
    config: NormalizerConfig,
    workspace_root: Option<PathBuf>,
    opener: Box<dyn SlideOpener>,
    writer: Box<dyn PyramidWriter>,
    project_factory: ProjectFactory,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Token that cancels this orchestrator's runs
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ask the current run to stop. Items in flight finish first.
    pub fn request_cancel(&self) {
        info!("Cancellation requested");
        self.cancel.cancel();
    }

    /// Run without events
    pub fn run(&self, source: &dyn ProjectStore) -> RunSummary {
        self.run_with_events(source, &null_sender())
    }

    /// Normalize every usable entry of `source`, reporting through `events`.
    ///
    /// Never fails: the outcome is reported in the summary and any fatal
    /// error is logged. The temp directory is removed whatever happens.
    pub fn run_with_events(&self, source: &dyn ProjectStore, events: &EventSender) -> RunSummary {
        let state = RunState::new(self.cancel.clone(), events.clone());
        state.start();
        events.pipeline(PipelineEvent::Started);

        let mut progress = RunProgress::default();
        let result = self.execute(source, &state, &mut progress);

        if let Some(layout) = &progress.layout {
            if layout.temp_dir().exists() && !delete_directory(layout.temp_dir()) {
                warn!(dir = %layout.temp_dir().display(), "Could not fully remove temp directory");
            }
        }

        let outcome = match &result {
            Ok(()) if state.has_error() => RunOutcome::SucceededWithErrors,
            Ok(()) => RunOutcome::Succeeded,
            Err(e) if e.is_cancelled() => {
                warn!("Run cancelled by user");
                RunOutcome::Cancelled
            }
            Err(e) => {
                error!(error = %e, stage = ?progress.stage, "Run aborted");
                RunOutcome::Aborted
            }
        };

        let final_stage = match outcome {
            RunOutcome::Succeeded | RunOutcome::SucceededWithErrors => RunStage::Done,
            RunOutcome::Cancelled => RunStage::Cancelled,
            RunOutcome::Aborted => RunStage::Failed,
        };
        self.enter(&state, &mut progress, final_stage);
        state.set_message(outcome.to_string());

        let summary = RunSummary {
            outcome,
            entries_retained: progress.entries_retained,
            tile_sets: progress.tile_sets,
            images_stitched: progress.images_stitched,
            entries_migrated: progress.entries_migrated,
            workspace: progress.layout.as_ref().map(|l| l.main_dir().to_path_buf()),
            duration_ms: state.elapsed_ms(),
        };
        info!(outcome = ?summary.outcome, "{}", summary.elapsed_text());

        match outcome {
            RunOutcome::Cancelled => events.pipeline(PipelineEvent::Cancelled),
            RunOutcome::Aborted => events.pipeline(PipelineEvent::Aborted {
                message: outcome.to_string(),
            }),
            _ => {}
        }
        events.pipeline(PipelineEvent::Completed {
            summary: summary.clone(),
        });

        summary
    }

    fn enter(&self, state: &RunState, progress: &mut RunProgress, stage: RunStage) {
        if progress.stage.is_some_and(|s| s.is_terminal()) {
            return;
        }
        progress.stage = Some(stage);
        info!(stage = ?stage, "Entering stage");
        state.events().pipeline(PipelineEvent::StageChanged { stage });
    }

    fn checkpoint(state: &RunState) -> Result<(), NormalizerError> {
        if state.is_cancelled() {
            Err(NormalizerError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn item_failed(state: &RunState, item: &str, e: &dyn std::fmt::Display) {
        error!(item, error = %e, "Item failed");
        state.set_error();
        state.events().pipeline(PipelineEvent::ItemFailed {
            item: item.to_string(),
            message: e.to_string(),
        });
    }

    fn execute(
        &self,
        source: &dyn ProjectStore,
        state: &RunState,
        progress: &mut RunProgress,
    ) -> Result<(), NormalizerError> {
        self.enter(state, progress, RunStage::Init);
        if self.config.tile_size == 0 {
            return Err(NormalizerError::Config("tile size must be greater than 0".into()));
        }

        let entries = source.entries()?;
        if entries.is_empty() {
            return Err(NormalizerError::Config("This project has no images!".into()));
        }

        state.set_message("Setting up directories...");
        let root = self
            .workspace_root
            .clone()
            .unwrap_or_else(|| source.base_dir().to_path_buf());
        let layout = WorkspaceLayout::create(&root)?;
        progress.layout = Some(layout.clone());
        Self::checkpoint(state)?;

        self.enter(state, progress, RunStage::Enumerating);
        state.set_message("Gathering image entries...");
        let enumeration = enumerate_entries(&entries);
        progress.entries_retained = enumeration.records.len();
        info!(
            retained = enumeration.records.len(),
            skipped = enumeration.skipped,
            "Gathered image entries"
        );
        Self::checkpoint(state)?;

        self.enter(state, progress, RunStage::Tiling);
        self.tile_all(&enumeration.records, &layout, state, progress)?;

        self.enter(state, progress, RunStage::Normalizing);
        state.set_message("Initializing normalization algorithm...");
        let directories = list_directories(layout.temp_dir())?;
        let dispatcher = WorkerDispatcher::new(self.config.worker.clone(), self.config.workers);
        let report = dispatcher
            .dispatch(&directories, state, RunStage::Normalizing.weight())
            .inspect_err(|e| {
                if !matches!(e, crate::error::DispatchError::Cancelled) {
                    state.set_error();
                }
            })?;
        info!(
            workers = report.workers,
            directories = report.directories,
            failures = report.failure_lines,
            "Normalization finished"
        );
        Self::checkpoint(state)?;

        self.enter(state, progress, RunStage::Stitching);
        state.set_message("Stitching images...");
        self.stitch_all(&layout, state, progress)?;

        self.enter(state, progress, RunStage::RebuildingProject);
        state.set_message("Transferring to new project...");
        progress.entries_migrated = self.rebuild_project(&enumeration.records, &layout)?;
        state.add_progress(RunStage::RebuildingProject.weight());

        state.set_progress(1.0);
        state.set_message("Done!");
        Ok(())
    }

    fn tile_all(
        &self,
        records: &[SourceImageRecord],
        layout: &WorkspaceLayout,
        state: &RunState,
        progress: &mut RunProgress,
    ) -> Result<(), NormalizerError> {
        let passes = tiling_passes(records);
        let step = RunStage::Tiling.weight() / passes.len().max(1) as f64;
        let options = self.config.extract_options();

        for record in passes {
            Self::checkpoint(state)?;
            state.set_message(format!("Opening {}", record.entry_name));
            match self.tile_record(record, layout, &options, state) {
                Ok(()) => progress.tile_sets += 1,
                Err(e) => {
                    if matches!(
                        e,
                        NormalizerError::Slide(SlideError::ResourceExhausted { .. })
                            | NormalizerError::Tiling(TilingError::Slide(
                                SlideError::ResourceExhausted { .. }
                            ))
                    ) {
                        warn!(
                            entry = %record.entry_name,
                            "Ran out of memory; consider a smaller tile size"
                        );
                    }
                    Self::item_failed(state, &record.entry_name, &e);
                }
            }
            state.add_progress(step);
        }
        Ok(())
    }

    fn tile_record(
        &self,
        record: &SourceImageRecord,
        layout: &WorkspaceLayout,
        options: &ExtractOptions,
        state: &RunState,
    ) -> Result<(), NormalizerError> {
        let slide = self.opener.open(&record.path)?;
        let exclusion = build_exclusion_geometry(&record.annotations);

        state.set_message(format!("Writing tiles for {}", record.entry_name));
        let extracted = extract_tiles(
            slide.as_ref(),
            &exclusion,
            layout.temp_dir(),
            &record.base_name,
            options,
        )?;
        info!(
            entry = %record.entry_name,
            tiles = extracted.tiles.len(),
            dir = %extracted.dir.display(),
            "Tiles written"
        );
        Ok(())
    }

    fn stitch_all(
        &self,
        layout: &WorkspaceLayout,
        state: &RunState,
        progress: &mut RunProgress,
    ) -> Result<(), NormalizerError> {
        let directories = list_directories(layout.temp_dir())?;
        let step = RunStage::Stitching.weight() / directories.len().max(1) as f64;
        let options = self.config.stitch_options();

        for dir in &directories {
            Self::checkpoint(state)?;
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            state.set_message(format!("Stitching for {}", name));

            match stitch(dir, layout.final_dir(), self.writer.as_ref(), &options) {
                Ok(output) => {
                    info!(output = %output.display(), "Stitched image written");
                    progress.images_stitched += 1;
                }
                Err(e) => Self::item_failed(state, &name, &e),
            }
            state.add_progress(step);
        }
        Ok(())
    }

    fn rebuild_project(
        &self,
        records: &[SourceImageRecord],
        layout: &WorkspaceLayout,
    ) -> Result<usize, NormalizerError> {
        let project = (self.project_factory)(layout.project_dir())?;
        let mut migrated = 0;

        for record in records {
            let Some(image) =
                find_normalized_image(layout.final_dir(), &record.base_name, &self.config.final_suffix)
            else {
                warn!(entry = %record.entry_name, "No normalized image found");
                continue;
            };

            let mut entry = ImageEntry::new(image);
            project.add_entry(&entry)?;
            entry.image_type = ImageType::BrightfieldHE;
            entry.stains = Some(StainVectors::normalized());
            entry.objects = record.annotations.clone();
            project.save_entry(&entry)?;
            migrated += 1;
        }

        info!(migrated, project = %layout.project_dir().display(), "Project rebuilt");
        Ok(migrated)
    }
}

/// Find the stitched image of `base_name` in `final_dir`.
///
/// A file matches when its name, with the extension and `suffix` removed,
/// equals `base_name` exactly.
pub fn find_normalized_image(final_dir: &Path, base_name: &str, suffix: &str) -> Option<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(final_dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();

    files.into_iter().find(|path| {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
            return false;
        };
        let stem = match name.rfind('.') {
            Some(dot) => &name[..dot],
            None => &name[..],
        };
        stem.strip_suffix(suffix) == Some(base_name)
    })
}
