//! # CLI Module
//!
//! Command-line interface for the slide normalizer.
//!
//! ## Usage
//! ```bash
//! # Register an image, with annotations exported as JSON
//! slide-norm add ~/projects/liver ~/slides/case_12.tif --annotations case_12.json
//!
//! # Normalize every H&E entry with half the cores
//! slide-norm run ~/projects/liver --worker ./normalize --multiprocess
//!
//! # JSON summary for scripting
//! slide-norm run ~/projects/liver --worker ./normalize --output json
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use console::{style, Term};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use slide_normalizer::core::dispatch::WorkerCommand;
use slide_normalizer::core::pipeline::{Orchestrator, DEFAULT_WORKER};
use slide_normalizer::core::project::{ImageEntry, ImageType, PathObject, ProjectStore, SqliteProject};
use slide_normalizer::error::{NormalizerError, Result};
use slide_normalizer::events::{Event, EventChannel, PipelineEvent, RunOutcome, RunSummary};
use std::path::{Path, PathBuf};
use std::thread;

const PROGRESS_STEPS: u64 = 1000;

/// Slide Normalizer - batch stain normalization for whole-slide images
#[derive(Parser, Debug)]
#[command(name = "slide-norm")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Normalize every Brightfield H&E entry of a project
    Run {
        /// Project directory
        project: PathBuf,

        /// Worker executable
        #[arg(short, long, default_value = DEFAULT_WORKER)]
        worker: PathBuf,

        /// Argument passed to the worker before the directory list
        #[arg(long = "worker-arg")]
        worker_args: Vec<String>,

        /// Number of worker processes
        #[arg(short, long, conflicts_with = "multiprocess")]
        processes: Option<usize>,

        /// Pick the worker count from the number of cores
        #[arg(short, long)]
        multiprocess: bool,

        /// Tile edge length in pixels
        #[arg(short, long, default_value = "5000")]
        tile_size: u32,

        /// Launch the worker in place instead of from a temporary copy
        #[arg(long)]
        no_stage: bool,

        /// Output format
        #[arg(short, long, default_value = "pretty")]
        output: OutputFormat,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Register an image in a project
    Add {
        /// Project directory (created if missing)
        project: PathBuf,

        /// Image file
        image: PathBuf,

        /// How the image should be interpreted
        #[arg(long, default_value = "he")]
        image_type: ImageKind,

        /// JSON file holding a list of annotations
        #[arg(long)]
        annotations: Option<PathBuf>,
    },

    /// List the entries of a project
    List {
        /// Project directory
        project: PathBuf,

        /// Output format
        #[arg(short, long, default_value = "pretty")]
        output: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ImageKind {
    /// Brightfield, H&E
    He,
    /// Brightfield, other stains
    Other,
    Fluorescence,
}

impl From<ImageKind> for ImageType {
    fn from(kind: ImageKind) -> Self {
        match kind {
            ImageKind::He => ImageType::BrightfieldHE,
            ImageKind::Other => ImageType::BrightfieldOther,
            ImageKind::Fluorescence => ImageType::Fluorescence,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable output with colors
    Pretty,
    /// JSON output for scripting
    Json,
}

/// Run the CLI
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            project,
            worker,
            worker_args,
            processes,
            multiprocess,
            tile_size,
            no_stage,
            output,
            verbose,
        } => {
            slide_normalizer::init_tracing(verbose);
            let mut command = WorkerCommand::new(worker).staged(!no_stage);
            for arg in worker_args {
                command = command.arg(arg);
            }
            let mut builder = Orchestrator::builder().worker(command).tile_size(tile_size);
            builder = match processes {
                Some(n) => builder.workers(n),
                None => builder.multiprocess(multiprocess),
            };
            run_pipeline(&project, builder.build(), output)
        }
        Commands::Add {
            project,
            image,
            image_type,
            annotations,
        } => {
            slide_normalizer::init_tracing(false);
            add_entry(&project, image, image_type.into(), annotations.as_deref())
        }
        Commands::List { project, output } => {
            slide_normalizer::init_tracing(false);
            list_entries(&project, output)
        }
    }
}

fn run_pipeline(project: &Path, orchestrator: Orchestrator, output: OutputFormat) -> Result<()> {
    let term = Term::stderr();
    let source = SqliteProject::open_existing(project)?;

    if matches!(output, OutputFormat::Pretty) {
        term.write_line(&format!(
            "{} {}",
            style("Slide Normalizer").bold().cyan(),
            style(env!("CARGO_PKG_VERSION")).dim()
        ))
        .ok();
        if term.is_term() {
            term.write_line(&format!("{}", style("Press 'c' to cancel").dim()))
                .ok();
        }
        term.write_line("").ok();
    }

    // Cancel on 'c'. The thread stays blocked on the terminal until exit.
    if term.is_term() {
        let token = orchestrator.cancel_token();
        let keys = Term::stderr();
        thread::spawn(move || {
            while let Ok(key) = keys.read_char() {
                if key.eq_ignore_ascii_case(&'c') {
                    token.cancel();
                    break;
                }
            }
        });
    }

    let (sender, receiver) = EventChannel::new();

    let progress = if matches!(output, OutputFormat::Pretty) {
        let pb = ProgressBar::new(PROGRESS_STEPS);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {percent:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓░"),
        );
        Some(pb)
    } else {
        None
    };

    let progress_clone = progress.clone();
    let event_thread = thread::spawn(move || {
        for event in receiver.iter() {
            let Some(ref pb) = progress_clone else {
                continue;
            };
            match event {
                Event::Pipeline(PipelineEvent::Progress { ratio, message }) => {
                    pb.set_position((ratio * PROGRESS_STEPS as f64).round() as u64);
                    // Worker panels span several lines
                    let line: Vec<&str> = message.lines().filter(|l| !l.is_empty()).collect();
                    pb.set_message(line.join(" | "));
                }
                Event::Pipeline(PipelineEvent::ItemFailed { item, message }) => {
                    pb.println(format!("{} {}: {}", style("✗").red(), item, message));
                }
                Event::Pipeline(PipelineEvent::Completed { .. }) => {
                    pb.finish_and_clear();
                }
                _ => {}
            }
        }
    });

    let summary = orchestrator.run_with_events(&source, &sender);

    drop(sender);
    event_thread.join().ok();

    match output {
        OutputFormat::Pretty => print_pretty_summary(&term, &summary),
        OutputFormat::Json => print_json(&summary),
    }

    if summary.outcome == RunOutcome::Aborted {
        std::process::exit(1);
    }
    Ok(())
}

fn print_pretty_summary(term: &Term, summary: &RunSummary) {
    let marker = match summary.outcome {
        RunOutcome::Succeeded => style("✓").green().bold(),
        RunOutcome::SucceededWithErrors => style("!").yellow().bold(),
        RunOutcome::Cancelled => style("-").dim(),
        RunOutcome::Aborted => style("✗").red().bold(),
    };
    term.write_line(&format!("{} {}", marker, summary.outcome)).ok();
    term.write_line("").ok();

    term.write_line(&format!(
        "  {} entries retained",
        style(summary.entries_retained).cyan()
    ))
    .ok();
    term.write_line(&format!("  {} tile sets written", style(summary.tile_sets).cyan()))
        .ok();
    term.write_line(&format!(
        "  {} images stitched",
        style(summary.images_stitched).cyan()
    ))
    .ok();
    term.write_line(&format!(
        "  {} entries in the new project",
        style(summary.entries_migrated).cyan()
    ))
    .ok();
    if let Some(workspace) = &summary.workspace {
        term.write_line(&format!("  output: {}", style(workspace.display()).dim()))
            .ok();
    }

    term.write_line("").ok();
    term.write_line(&summary.elapsed_text()).ok();
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("Failed to serialize output: {}", e),
    }
}

fn add_entry(
    project: &Path,
    image: PathBuf,
    image_type: ImageType,
    annotations: Option<&Path>,
) -> Result<()> {
    if !image.is_file() {
        return Err(NormalizerError::Config(format!(
            "image not found: {}",
            image.display()
        )));
    }

    let store = SqliteProject::open(project)?;
    let mut entry = ImageEntry::new(std::path::absolute(&image).unwrap_or(image));
    entry.image_type = image_type;

    if let Some(path) = annotations {
        let text = std::fs::read_to_string(path).map_err(|e| {
            NormalizerError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        entry.objects = serde_json::from_str::<Vec<PathObject>>(&text).map_err(|e| {
            NormalizerError::Config(format!("invalid annotations in {}: {}", path.display(), e))
        })?;
    }

    store.add_entry(&entry)?;
    println!("{} {} ({})", style("+").green(), entry.name, entry.id);
    Ok(())
}

fn list_entries(project: &Path, output: OutputFormat) -> Result<()> {
    let store = SqliteProject::open_existing(project)?;
    let entries = store.entries()?;

    match output {
        OutputFormat::Pretty => {
            for entry in &entries {
                println!(
                    "{}  {}  {} objects",
                    style(&entry.name).bold(),
                    style(entry.image_type.as_str()).yellow(),
                    entry.objects.len()
                );
                for uri in &entry.uris {
                    println!("    {}", style(uri.display()).dim());
                }
            }
        }
        OutputFormat::Json => print_json(&entries),
    }
    Ok(())
}
