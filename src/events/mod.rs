//! # Events Module
//!
//! Event-driven progress reporting for the normalization pipeline.
//!
//! ## Design
//! The orchestrator and the worker output readers emit events through
//! channels, so any front end (CLI, GUI) can subscribe to progress,
//! status text and per-item failures without the core knowing about it.
//!
//! ## Example
//! ```rust,ignore
//! let (sender, receiver) = EventChannel::new();
//!
//! std::thread::spawn(move || {
//!     for event in receiver.iter() {
//!         if let Event::Pipeline(PipelineEvent::Progress { ratio, message }) = event {
//!             println!("{:>3.0}% {}", ratio * 100.0, message);
//!         }
//!     }
//! });
//!
//! let summary = orchestrator.run_with_events(&project, &sender);
//! ```

mod channel;
mod types;

pub use channel::{EventChannel, EventReceiver, EventSender, null_sender};
pub use types::*;
