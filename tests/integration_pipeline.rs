//! Integration tests for the pipeline module.
//!
//! These tests run whole normalization runs against a real SQLite project,
//! with `/bin/sh` scripts standing in for the normalization worker:
//! - Identity normalization round trip
//! - Exclusion masking and annotation migration
//! - Per-item failures and failed workers
//! - Cancellation while tiling and while normalizing
//! - Event sequence

#![cfg(unix)]

use image::{Rgb, RgbImage};
use slide_normalizer::core::dispatch::{encode_argument, WorkerCommand};
use slide_normalizer::core::pipeline::{CancellationToken, Orchestrator};
use slide_normalizer::core::project::{
    ImageEntry, ImageType, PathObject, ProjectStore, SqliteProject, StainVectors,
};
use slide_normalizer::core::slide::{RasterSlideOpener, SlideImage, SlideOpener};
use slide_normalizer::core::tiling::{MaskMode, Polygon, IGNORE_CLASS};
use slide_normalizer::error::SlideError;
use slide_normalizer::events::{
    Event, EventChannel, EventReceiver, PipelineEvent, RunOutcome, RunStage, WorkerEvent,
};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn gradient(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 5 % 256) as u8, (y * 7 % 256) as u8, ((x + y) % 256) as u8])
    })
}

fn write_slide(dir: &Path, name: &str, pixels: &RgbImage) -> PathBuf {
    let path = dir.join(name);
    pixels.save(&path).unwrap();
    path
}

fn he_entry(path: &Path) -> ImageEntry {
    let mut entry = ImageEntry::new(path.to_path_buf());
    entry.image_type = ImageType::BrightfieldHE;
    entry
}

/// Worker printing the progress sentinel `count` times
fn echo_worker(dir: &Path, count: usize, extra: &str) -> WorkerCommand {
    let path = dir.join("worker.sh");
    let body = format!("{}for i in $(seq {}); do echo Next; done\n", extra, count);
    std::fs::write(&path, body).unwrap();
    WorkerCommand::new("/bin/sh").arg(path.to_string_lossy())
}

struct Fixture {
    _temp: TempDir,
    root: PathBuf,
    project: SqliteProject,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        let project = SqliteProject::open(&root.join("project")).unwrap();
        Self {
            _temp: temp,
            root,
            project,
        }
    }

    fn add(&self, entry: ImageEntry) -> ImageEntry {
        self.project.add_entry(&entry).unwrap();
        entry
    }

    fn workspace(&self) -> PathBuf {
        self.root.join("project").join("normalized")
    }
}

#[test]
fn identity_normalization_reproduces_the_source() {
    let fx = Fixture::new();
    let pixels = gradient(45, 31);
    let slide = write_slide(&fx.root, "case_7.png", &pixels);
    fx.add(he_entry(&slide));

    let summary = Orchestrator::builder()
        .tile_size(16)
        .worker(echo_worker(&fx.root, 1, ""))
        .build()
        .run(&fx.project);

    assert_eq!(summary.outcome, RunOutcome::Succeeded);
    assert_eq!(summary.tile_sets, 1);
    assert_eq!(summary.images_stitched, 1);

    let workspace = summary.workspace.unwrap();
    assert_eq!(workspace, fx.workspace());
    assert!(!workspace.join("img_temp").exists());

    let output = workspace.join("img_final").join("case_7_norm.ome.tiff");
    let stitched = image::open(&output).unwrap().to_rgb8();
    assert_eq!(stitched.dimensions(), (45, 31));
    assert_eq!(stitched, pixels);
}

#[test]
fn rebuilt_project_carries_annotations_and_normalized_stains() {
    let fx = Fixture::new();
    let slide = write_slide(&fx.root, "liver.png", &gradient(40, 40));

    let mut masked = he_entry(&slide);
    masked
        .objects
        .push(PathObject::annotation(Some(IGNORE_CLASS), Polygon::rectangle(0.0, 0.0, 10.0, 10.0)));
    masked
        .objects
        .push(PathObject::annotation(Some("Tumor"), Polygon::rectangle(20.0, 20.0, 5.0, 5.0)));
    fx.add(masked);

    let summary = Orchestrator::builder()
        .tile_size(20)
        .tile_mask(MaskMode::Solid)
        .worker(echo_worker(&fx.root, 1, ""))
        .build()
        .run(&fx.project);

    assert_eq!(summary.outcome, RunOutcome::Succeeded);
    assert_eq!(summary.entries_migrated, 1);

    let final_dir = fx.workspace().join("img_final");
    let stitched = image::open(final_dir.join("liver_1_norm.ome.tiff"))
        .unwrap()
        .to_rgb8();
    assert_eq!(*stitched.get_pixel(5, 5), Rgb([0, 0, 0]));
    assert_ne!(*stitched.get_pixel(30, 30), Rgb([0, 0, 0]));

    let rebuilt = SqliteProject::open_existing(&fx.workspace().join("QuPath_project")).unwrap();
    let entries = rebuilt.entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "liver_1_norm.ome.tiff");
    assert_eq!(entries[0].image_type, ImageType::BrightfieldHE);
    assert_eq!(entries[0].stains, Some(StainVectors::normalized()));
    assert_eq!(entries[0].objects.len(), 2);
}

#[test]
fn entries_sharing_a_file_are_tiled_once() {
    let fx = Fixture::new();
    let slide = write_slide(&fx.root, "shared.png", &gradient(20, 20));
    fx.add(he_entry(&slide));
    fx.add(he_entry(&slide));

    let summary = Orchestrator::builder()
        .tile_size(8)
        .worker(echo_worker(&fx.root, 1, ""))
        .build()
        .run(&fx.project);

    assert_eq!(summary.entries_retained, 2);
    assert_eq!(summary.tile_sets, 1);
    assert_eq!(summary.images_stitched, 1);
    assert_eq!(summary.entries_migrated, 2);
}

#[test]
fn unsupported_entries_are_left_out() {
    let fx = Fixture::new();
    let slide = write_slide(&fx.root, "a.png", &gradient(10, 10));
    let mut fluorescence = he_entry(&slide);
    fluorescence.image_type = ImageType::Fluorescence;
    fx.add(fluorescence);
    fx.add(he_entry(&fx.root.join("missing.png")));
    fx.add(he_entry(&slide));

    let summary = Orchestrator::builder()
        .tile_size(8)
        .worker(echo_worker(&fx.root, 1, ""))
        .build()
        .run(&fx.project);

    assert_eq!(summary.outcome, RunOutcome::Succeeded);
    assert_eq!(summary.entries_retained, 1);
    assert_eq!(summary.entries_migrated, 1);
}

#[test]
fn error_sentinel_fails_only_that_image() {
    let fx = Fixture::new();
    fx.add(he_entry(&write_slide(&fx.root, "good.png", &gradient(12, 12))));
    fx.add(he_entry(&write_slide(&fx.root, "bad.png", &gradient(12, 12))));

    let bad_dir = fx.workspace().join("img_temp").join("bad");
    let mark_bad = format!("touch '{}/ERROR.txt'\n", bad_dir.display());

    let summary = Orchestrator::builder()
        .tile_size(8)
        .worker(echo_worker(&fx.root, 2, &mark_bad))
        .build()
        .run(&fx.project);

    assert_eq!(summary.outcome, RunOutcome::SucceededWithErrors);
    assert_eq!(summary.tile_sets, 2);
    assert_eq!(summary.images_stitched, 1);
    assert_eq!(summary.entries_migrated, 1);
    assert!(fx.workspace().join("img_final/good_norm.ome.tiff").is_file());
    assert!(!fx.workspace().join("img_final/bad_norm.ome.tiff").exists());
}

#[test]
fn failed_worker_aborts_before_stitching() {
    let fx = Fixture::new();
    fx.add(he_entry(&write_slide(&fx.root, "a.png", &gradient(12, 12))));
    fx.add(he_entry(&write_slide(&fx.root, "b.png", &gradient(12, 12))));

    // Directories are partitioned in name order, so worker 2 gets `b`
    let failing = encode_argument(&[fx.workspace().join("img_temp").join("b")]).unwrap();
    let script = fx.root.join("worker.sh");
    let body = format!(
        "if [ \"$1\" = \"{}\" ]; then echo 'Failed to normalize b'; exit 3; fi\necho Next\n",
        failing
    );
    std::fs::write(&script, body).unwrap();
    let worker = WorkerCommand::new("/bin/sh").arg(script.to_string_lossy());

    let (sender, receiver) = EventChannel::new();
    let summary = Orchestrator::builder()
        .tile_size(8)
        .workers(2)
        .worker(worker)
        .build()
        .run_with_events(&fx.project, &sender);
    drop(sender);

    assert_eq!(summary.outcome, RunOutcome::Aborted);
    assert_eq!(summary.images_stitched, 0);
    assert_eq!(summary.entries_migrated, 0);
    assert!(!fx.workspace().join("img_temp").exists());

    let stages: Vec<RunStage> = receiver
        .iter()
        .filter_map(|e| match e {
            Event::Pipeline(PipelineEvent::StageChanged { stage }) => Some(stage),
            _ => None,
        })
        .collect();
    assert!(!stages.contains(&RunStage::Stitching));
    assert_eq!(stages.last(), Some(&RunStage::Failed));
}

#[test]
fn successful_run_walks_every_stage_in_order() {
    let fx = Fixture::new();
    fx.add(he_entry(&write_slide(&fx.root, "a.png", &gradient(10, 10))));

    let (sender, receiver) = EventChannel::new();
    let summary = Orchestrator::builder()
        .tile_size(8)
        .worker(echo_worker(&fx.root, 1, ""))
        .build()
        .run_with_events(&fx.project, &sender);
    drop(sender);
    assert_eq!(summary.outcome, RunOutcome::Succeeded);

    let events: Vec<Event> = receiver.iter().collect();
    let stages: Vec<RunStage> = events
        .iter()
        .filter_map(|e| match e {
            Event::Pipeline(PipelineEvent::StageChanged { stage }) => Some(*stage),
            _ => None,
        })
        .collect();
    assert_eq!(
        stages,
        vec![
            RunStage::Init,
            RunStage::Enumerating,
            RunStage::Tiling,
            RunStage::Normalizing,
            RunStage::Stitching,
            RunStage::RebuildingProject,
            RunStage::Done,
        ]
    );

    let last_ratio = events
        .iter()
        .rev()
        .find_map(|e| match e {
            Event::Pipeline(PipelineEvent::Progress { ratio, .. }) => Some(*ratio),
            _ => None,
        })
        .unwrap();
    assert_eq!(last_ratio, 1.0);
    assert!(matches!(
        events.last(),
        Some(Event::Pipeline(PipelineEvent::Completed { .. }))
    ));
}

/// Opens slides only once the run has been cancelled
struct OpenAfterCancel {
    token: CancellationToken,
    inner: RasterSlideOpener,
}

impl SlideOpener for OpenAfterCancel {
    fn open(&self, path: &Path) -> Result<Box<dyn SlideImage>, SlideError> {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !self.token.is_cancelled() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        self.inner.open(path)
    }
}

/// Collect stage changes, cancelling `token` at the first event `trigger` accepts
fn cancel_on(
    receiver: EventReceiver,
    token: CancellationToken,
    trigger: fn(&Event) -> bool,
) -> JoinHandle<Vec<RunStage>> {
    thread::spawn(move || {
        let mut stages = Vec::new();
        for event in receiver.iter() {
            if trigger(&event) {
                token.cancel();
            }
            if let Event::Pipeline(PipelineEvent::StageChanged { stage }) = event {
                stages.push(stage);
            }
        }
        stages
    })
}

#[test]
fn cancel_while_tiling_stops_before_the_next_entry() {
    let fx = Fixture::new();
    for name in ["a.png", "b.png", "c.png"] {
        fx.add(he_entry(&write_slide(&fx.root, name, &gradient(12, 12))));
    }
    let launched = fx.root.join("launched");
    let marker = format!("touch '{}'\n", launched.display());

    let token = CancellationToken::new();
    let orchestrator = Orchestrator::builder()
        .tile_size(8)
        .cancel_token(token.clone())
        .opener(Box::new(OpenAfterCancel {
            token: token.clone(),
            inner: RasterSlideOpener::new(),
        }))
        .worker(echo_worker(&fx.root, 3, &marker))
        .build();

    let (sender, receiver) = EventChannel::new();
    let listener = cancel_on(receiver, token, |event| {
        matches!(
            event,
            Event::Pipeline(PipelineEvent::StageChanged {
                stage: RunStage::Tiling
            })
        )
    });
    let summary = orchestrator.run_with_events(&fx.project, &sender);
    drop(sender);
    let stages = listener.join().unwrap();

    assert_eq!(summary.outcome, RunOutcome::Cancelled);
    assert_eq!(summary.tile_sets, 1);
    assert_eq!(summary.images_stitched, 0);
    assert_eq!(summary.entries_migrated, 0);
    assert!(!stages.contains(&RunStage::Normalizing));
    assert_eq!(stages.last(), Some(&RunStage::Cancelled));
    assert!(!launched.exists());
    assert!(!fx.workspace().join("img_temp").exists());
}

#[test]
fn cancel_while_normalizing_stops_a_sleeping_worker() {
    let fx = Fixture::new();
    fx.add(he_entry(&write_slide(&fx.root, "a.png", &gradient(12, 12))));
    fx.add(he_entry(&write_slide(&fx.root, "b.png", &gradient(12, 12))));

    let script = fx.root.join("worker.sh");
    std::fs::write(&script, "echo started\nsleep 30\necho Next\n").unwrap();
    let orchestrator = Orchestrator::builder()
        .tile_size(8)
        .worker(WorkerCommand::new("/bin/sh").arg(script.to_string_lossy()))
        .build();

    let (sender, receiver) = EventChannel::new();
    let listener = cancel_on(receiver, orchestrator.cancel_token(), |event| {
        matches!(
            event,
            Event::Worker(WorkerEvent::Output { line, .. }) if line == "started"
        )
    });
    let started = Instant::now();
    let summary = orchestrator.run_with_events(&fx.project, &sender);
    drop(sender);
    let stages = listener.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(15));
    assert_eq!(summary.outcome, RunOutcome::Cancelled);
    assert_eq!(summary.tile_sets, 2);
    assert_eq!(summary.images_stitched, 0);
    assert!(stages.contains(&RunStage::Normalizing));
    assert!(!stages.contains(&RunStage::Stitching));
    assert_eq!(stages.last(), Some(&RunStage::Cancelled));
    assert!(!fx.workspace().join("img_temp").exists());
    let finals = std::fs::read_dir(fx.workspace().join("img_final")).unwrap();
    assert_eq!(finals.count(), 0);
}
