//! # Dispatch Module
//!
//! Fans tile directories out to external normalization workers and fans
//! their output back into the shared run state.
//!
//! ## Flow
//! 1. Split the directories into load-balanced partitions, one per worker
//! 2. Launch one process per partition with the encoded directory list
//! 3. Read each process's combined output on its own thread
//! 4. Wait for every process; any nonzero exit fails the dispatch
//!
//! Cancellation is checked per output line and between exit polls. Once
//! observed, every worker's process group gets SIGTERM, and SIGKILL after
//! a grace period. Helpers a worker forked are stopped the same way, so
//! no orphan keeps an output pipe open.

mod group;
mod protocol;
mod worker;

pub use protocol::{
    decode_argument, encode_argument, StatusPanel, WorkerLine, DONE_LINE, FAILURE_MARKER,
    PROGRESS_SENTINEL, PROTOCOL_ENV, PROTOCOL_VERSION,
};
pub use worker::WorkerCommand;

use crate::core::pipeline::RunState;
use crate::error::DispatchError;
use crate::events::WorkerEvent;
use std::io::{BufRead, BufReader, PipeReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use group::Stop;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long terminated workers get before they are killed
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Split `items` into at most `workers` contiguous partitions.
///
/// The first `len % workers` partitions take one extra item, so sizes
/// differ by at most one and concatenating the partitions gives back the
/// input. With more workers than items every partition holds one item.
pub fn partition<T: Clone>(items: &[T], workers: usize) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }
    let workers = workers.clamp(1, items.len());
    let base = items.len() / workers;
    let remainder = items.len() % workers;

    let mut partitions = Vec::with_capacity(workers);
    let mut start = 0;
    for i in 0..workers {
        let size = base + usize::from(i < remainder);
        partitions.push(items[start..start + size].to_vec());
        start += size;
    }
    partitions
}

/// Default number of worker processes.
///
/// Half the logical cores, rounded up. macOS is pinned to one worker: it
/// showed no speedup from running several.
pub fn processors_to_use() -> usize {
    if cfg!(target_os = "macos") {
        return 1;
    }
    num_cpus::get().div_ceil(2).max(1)
}

/// Non-hidden subdirectories of `dir`, sorted by name
pub fn list_directories(dir: &Path) -> Result<Vec<PathBuf>, DispatchError> {
    let list_failed = |e: std::io::Error| DispatchError::ListFailed {
        path: dir.to_path_buf(),
        source: e,
    };

    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(list_failed)? {
        let entry = entry.map_err(list_failed)?;
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if !hidden && entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// What a finished dispatch did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Worker processes launched
    pub workers: usize,
    /// Directories handed out
    pub directories: usize,
    /// Output lines carrying the failure marker
    pub failure_lines: usize,
}

/// Launches and supervises external normalization workers
#[derive(Debug, Clone)]
pub struct WorkerDispatcher {
    command: WorkerCommand,
    workers: usize,
}

impl WorkerDispatcher {
    pub fn new(command: WorkerCommand, workers: usize) -> Self {
        Self {
            command,
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Normalize `directories`, adding `progress_share` to the run's
    /// progress over the whole dispatch.
    ///
    /// Blocks until every worker has exited. A staged executable is
    /// deleted before returning, whatever the outcome.
    pub fn dispatch(
        &self,
        directories: &[PathBuf],
        state: &RunState,
        progress_share: f64,
    ) -> Result<DispatchReport, DispatchError> {
        if directories.is_empty() {
            info!("No tile directories to normalize");
            return Ok(DispatchReport::default());
        }

        let prepared = self.command.prepare()?;
        let result = self.run_workers(&prepared.program, directories, state, progress_share);
        prepared.cleanup();
        result
    }

    fn spawn(
        &self,
        program: &Path,
        worker: usize,
        partition: &[PathBuf],
    ) -> Result<(Child, PipeReader), DispatchError> {
        let argument = encode_argument(partition)?;
        debug!(worker, argument = %argument, "Encoded worker argument");

        let launch_failed = |e: std::io::Error| DispatchError::LaunchFailed { worker, source: e };
        let (reader, writer) = std::io::pipe().map_err(launch_failed)?;
        let stderr = writer.try_clone().map_err(launch_failed)?;

        // The command owns the write ends; dropping it leaves the child as
        // the only writer so the reader sees EOF when the child exits.
        let mut command = Command::new(program);
        command
            .args(&self.command.leading_args)
            .arg(argument)
            .env(PROTOCOL_ENV, PROTOCOL_VERSION)
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(stderr);
        group::isolate(&mut command);
        let child = command.spawn().map_err(launch_failed)?;
        drop(command);

        Ok((child, reader))
    }

    fn run_workers(
        &self,
        program: &Path,
        directories: &[PathBuf],
        state: &RunState,
        progress_share: f64,
    ) -> Result<DispatchReport, DispatchError> {
        let partitions = partition(directories, self.workers);
        let total = partitions.len();
        let per_item = progress_share / directories.len() as f64;

        info!(
            workers = total,
            directories = directories.len(),
            "Launching normalization workers"
        );

        thread::scope(|scope| {
            let mut running: Vec<(usize, Child)> = Vec::with_capacity(total);
            let mut groups: Vec<(usize, u32)> = Vec::with_capacity(total);
            let mut readers = Vec::with_capacity(total);

            for (index, dirs) in partitions.iter().enumerate() {
                let worker = index + 1;
                let (child, output) = match self.spawn(program, worker, dirs) {
                    Ok(spawned) => spawned,
                    Err(e) => {
                        terminate(&mut running, &groups);
                        return Err(e);
                    }
                };
                info!(worker, pid = child.id(), directories = dirs.len(), "Worker started");
                state.events().worker(WorkerEvent::Launched {
                    worker,
                    directories: dirs.len(),
                });
                groups.push((worker, child.id()));
                running.push((worker, child));
                readers.push(scope.spawn(move || read_output(output, worker, total, state, per_item)));
            }

            let mut exits = wait_all(&mut running, &groups, state)?;
            exits.sort_unstable();

            let failure_lines = readers
                .into_iter()
                .map(|handle| handle.join().unwrap_or(0))
                .sum();

            if state.is_cancelled() {
                info!("Normalization cancelled");
                return Err(DispatchError::Cancelled);
            }

            if let Some((worker, code)) = exits.iter().find(|(_, code)| *code != Some(0)) {
                error!(worker, code = ?code, "Worker finished with a nonzero exit code");
                return Err(DispatchError::WorkerFailed {
                    worker: *worker,
                    code: *code,
                });
            }

            Ok(DispatchReport {
                workers: total,
                directories: directories.len(),
                failure_lines,
            })
        })
    }
}

/// Wait for every child, stopping all of them once cancellation is seen.
///
/// Also waits for whatever else is left in the workers' process groups,
/// since those processes hold the output pipes open. Leftovers of a worker
/// that exited are terminated.
///
/// Returns `(worker, exit code)` pairs in exit order.
fn wait_all(
    running: &mut Vec<(usize, Child)>,
    groups: &[(usize, u32)],
    state: &RunState,
) -> Result<Vec<(usize, Option<i32>)>, DispatchError> {
    let mut exits = Vec::with_capacity(running.len());
    let mut terminated_at: Option<Instant> = None;
    let mut killed_at: Option<Instant> = None;

    loop {
        if terminated_at.is_none() && state.is_cancelled() {
            info!("Asking workers to terminate for cancellation");
            stop_all(running, groups, Stop::Terminate);
            terminated_at = Some(Instant::now());
        }
        if let Some(since) = terminated_at {
            if killed_at.is_none() && since.elapsed() >= TERMINATE_GRACE {
                warn!("Workers ignored termination, killing them");
                stop_all(running, groups, Stop::Kill);
                killed_at = Some(Instant::now());
            }
        }

        let mut i = 0;
        while i < running.len() {
            match running[i].1.try_wait() {
                Ok(Some(status)) => {
                    let (worker, _) = running.swap_remove(i);
                    debug!(worker, code = ?status.code(), "Worker exited");
                    state.events().worker(WorkerEvent::Exited {
                        worker,
                        code: status.code(),
                    });
                    exits.push((worker, status.code()));
                }
                Ok(None) => i += 1,
                Err(e) => {
                    let worker = running[i].0;
                    terminate(running, groups);
                    return Err(DispatchError::WaitFailed { worker, source: e });
                }
            }
        }

        if running.is_empty() {
            let lingering = groups.iter().any(|&(_, pid)| group::alive(pid));
            // Unreaped zombies still count as members; stop after one grace period past SIGKILL
            let gave_up = killed_at.is_some_and(|at| at.elapsed() >= TERMINATE_GRACE);
            if !lingering || gave_up {
                break;
            }
            if terminated_at.is_none() {
                warn!("Worker helpers outlived their worker, terminating them");
                stop_all(running, groups, Stop::Terminate);
                terminated_at = Some(Instant::now());
            }
        }

        thread::sleep(EXIT_POLL_INTERVAL);
    }

    Ok(exits)
}

/// Signal every worker's process tree, or each direct child where process
/// groups are unavailable
fn stop_all(running: &mut [(usize, Child)], groups: &[(usize, u32)], stop: Stop) {
    if cfg!(unix) {
        for &(worker, pid) in groups {
            group::signal(worker, pid, stop);
        }
    } else {
        for (worker, child) in running.iter_mut() {
            if let Err(e) = child.kill() {
                warn!(worker = *worker, error = %e, "Failed to kill worker");
            }
        }
    }
}

/// Kill and reap every child so their output readers reach EOF
fn terminate(running: &mut Vec<(usize, Child)>, groups: &[(usize, u32)]) {
    stop_all(running, groups, Stop::Kill);
    for (worker, mut child) in running.drain(..) {
        if let Err(e) = child.wait() {
            warn!(worker, error = %e, "Failed to reap worker");
        }
    }
}

/// Forward one worker's output into the run state.
///
/// Returns the number of failure lines seen.
fn read_output(
    output: PipeReader,
    worker: usize,
    workers: usize,
    state: &RunState,
    per_item: f64,
) -> usize {
    let mut reader = BufReader::new(output);
    let mut buf = Vec::new();
    let mut failures = 0;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(worker, error = %e, "Lost worker output");
                break;
            }
        }
        // Keep draining after cancellation so the worker never blocks on a full pipe
        if state.is_cancelled() {
            continue;
        }

        let text = String::from_utf8_lossy(&buf);
        let line = text.trim_end_matches(['\n', '\r']);
        state.events().worker(WorkerEvent::Output {
            worker,
            line: line.to_string(),
        });

        match WorkerLine::classify(line) {
            WorkerLine::Progress => state.add_progress(per_item),
            WorkerLine::Failure(line) => {
                error!(worker, "{}", line);
                failures += 1;
                state.set_error();
            }
            WorkerLine::Status(line) => {
                info!(worker, "{}", line);
                state.set_worker_line(worker, workers, line);
            }
        }
    }

    state.set_worker_line(worker, workers, DONE_LINE);
    failures
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seven_items_over_three_workers() {
        let items: Vec<u32> = (0..7).collect();

        let parts = partition(&items, 3);

        assert_eq!(parts, vec![vec![0, 1, 2], vec![3, 4], vec![5, 6]]);
    }

    #[test]
    fn partitions_are_balanced_and_preserve_order() {
        for len in 1..40usize {
            for workers in 1..12usize {
                let items: Vec<usize> = (0..len).collect();
                let parts = partition(&items, workers);

                let sizes: Vec<usize> = parts.iter().map(Vec::len).collect();
                let max = *sizes.iter().max().unwrap();
                let min = *sizes.iter().min().unwrap();
                assert!(max - min <= 1, "len {} workers {}", len, workers);
                assert_eq!(parts.len(), workers.min(len));
                assert_eq!(parts.concat(), items);
            }
        }
    }

    #[test]
    fn empty_input_has_no_partitions() {
        assert!(partition::<u8>(&[], 4).is_empty());
    }

    #[test]
    fn zero_workers_means_one() {
        assert_eq!(partition(&[1, 2, 3], 0), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn processors_to_use_is_positive() {
        let n = processors_to_use();
        assert!(n >= 1);
        assert!(n <= num_cpus::get().max(1));
    }

    #[test]
    fn list_directories_skips_files_and_hidden_entries() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("b")).unwrap();
        std::fs::create_dir(temp.path().join("a")).unwrap();
        std::fs::create_dir(temp.path().join(".hidden")).unwrap();
        std::fs::write(temp.path().join("file.txt"), "").unwrap();

        let dirs = list_directories(temp.path()).unwrap();

        assert_eq!(dirs, vec![temp.path().join("a"), temp.path().join("b")]);
    }
}
