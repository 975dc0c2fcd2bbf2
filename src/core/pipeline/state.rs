//! Shared run state and cancellation.

use crate::core::dispatch::StatusPanel;
use crate::events::{EventSender, PipelineEvent};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Cooperative cancellation flag shared by the caller, the orchestrator
/// and the dispatcher
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Work in flight finishes; nothing new starts.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Point-in-time copy of the run state
#[derive(Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    pub progress: f64,
    pub message: String,
    pub error: bool,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    progress: f64,
    message: String,
    panel: Option<StatusPanel>,
    error: bool,
    started_at: Option<DateTime<Utc>>,
}

/// Progress, status text, error flag and start time of one run.
///
/// Written concurrently by the orchestrator and by one output reader per
/// worker process. Every field lives behind a single mutex so composite
/// updates (such as one worker's line in the status panel) are atomic.
/// Each mutation publishes a `Progress` event.
pub struct RunState {
    inner: Mutex<Inner>,
    cancel: CancellationToken,
    events: EventSender,
}

impl RunState {
    pub fn new(cancel: CancellationToken, events: EventSender) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            cancel,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, inner: &Inner) {
        self.events.pipeline(PipelineEvent::Progress {
            ratio: inner.progress,
            message: inner.message.clone(),
        });
    }

    pub fn events(&self) -> &EventSender {
        &self.events
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Reset progress and record the start time
    pub fn start(&self) {
        let mut inner = self.lock();
        *inner = Inner {
            started_at: Some(Utc::now()),
            ..Inner::default()
        };
        self.publish(&inner);
    }

    /// Add `delta` to the progress ratio, clamped to [0, 1]
    pub fn add_progress(&self, delta: f64) {
        let mut inner = self.lock();
        inner.progress = (inner.progress + delta).clamp(0.0, 1.0);
        self.publish(&inner);
    }

    pub fn set_progress(&self, ratio: f64) {
        let mut inner = self.lock();
        inner.progress = ratio.clamp(0.0, 1.0);
        self.publish(&inner);
    }

    /// Replace the status text and drop any worker panel
    pub fn set_message(&self, message: impl Into<String>) {
        let mut inner = self.lock();
        inner.panel = None;
        inner.message = message.into();
        self.publish(&inner);
    }

    /// Update the status line of `worker` (1-based) out of `workers`.
    ///
    /// A single worker's line becomes the whole status text. With several
    /// workers the status text is the rendered panel.
    pub fn set_worker_line(&self, worker: usize, workers: usize, line: &str) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if workers <= 1 {
            inner.message = line.to_string();
        } else {
            let panel = inner
                .panel
                .get_or_insert_with(|| StatusPanel::new(workers));
            panel.set(worker, line);
            inner.message = panel.render();
        }
        self.publish(inner);
    }

    pub fn set_error(&self) {
        self.lock().error = true;
    }

    pub fn has_error(&self) -> bool {
        self.lock().error
    }

    pub fn progress(&self) -> f64 {
        self.lock().progress
    }

    pub fn message(&self) -> String {
        self.lock().message.clone()
    }

    /// Milliseconds since `start`, or 0 if the run never started
    pub fn elapsed_ms(&self) -> u64 {
        self.lock()
            .started_at
            .map(|t| (Utc::now() - t).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> RunSnapshot {
        let inner = self.lock();
        RunSnapshot {
            progress: inner.progress,
            message: inner.message.clone(),
            error: inner.error,
            started_at: inner.started_at,
        }
    }
}
