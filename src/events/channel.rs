//! Event channel over crossbeam-channel.
//!
//! Senders are handed to the orchestrator and cloned into each worker
//! output reader; one receiver feeds the front end.

use super::{Event, PipelineEvent, WorkerEvent};
use crossbeam_channel::{unbounded, Receiver, Sender};

/// Cloneable sending half.
///
/// Sending never blocks and never fails: once the receiver is gone,
/// events are dropped, so a run without an observer behaves the same.
#[derive(Clone)]
pub struct EventSender {
    inner: Sender<Event>,
}

impl EventSender {
    pub fn send(&self, event: Event) {
        let _ = self.inner.send(event);
    }

    pub fn pipeline(&self, event: PipelineEvent) {
        self.send(Event::Pipeline(event));
    }

    pub fn worker(&self, event: WorkerEvent) {
        self.send(Event::Worker(event));
    }
}

/// Receiving half, owned by the front end
pub struct EventReceiver {
    inner: Receiver<Event>,
}

impl EventReceiver {
    /// Next event, or `None` once every sender is dropped
    pub fn recv(&self) -> Option<Event> {
        self.inner.recv().ok()
    }

    pub fn try_recv(&self) -> Option<Event> {
        self.inner.try_recv().ok()
    }

    /// Blocking iterator that ends when every sender is dropped
    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.inner.iter()
    }

    /// Everything queued right now, without blocking
    pub fn drain(&self) -> Vec<Event> {
        self.inner.try_iter().collect()
    }
}

/// Constructor for connected sender/receiver pairs
pub struct EventChannel;

impl EventChannel {
    /// Unbounded, so worker readers never stall on a slow front end
    pub fn new() -> (EventSender, EventReceiver) {
        let (sender, receiver) = unbounded();
        (
            EventSender { inner: sender },
            EventReceiver { inner: receiver },
        )
    }
}

/// Sender whose events go nowhere
pub fn null_sender() -> EventSender {
    EventChannel::new().0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn worker_events_cross_threads() {
        let (sender, receiver) = EventChannel::new();

        let readers: Vec<_> = (1..=3)
            .map(|worker| {
                let sender = sender.clone();
                thread::spawn(move || {
                    sender.worker(WorkerEvent::Output {
                        worker,
                        line: "Next".to_string(),
                    })
                })
            })
            .collect();
        drop(sender);
        for reader in readers {
            reader.join().unwrap();
        }

        let mut workers: Vec<usize> = receiver
            .iter()
            .filter_map(|event| match event {
                Event::Worker(WorkerEvent::Output { worker, .. }) => Some(worker),
                _ => None,
            })
            .collect();
        workers.sort_unstable();
        assert_eq!(workers, vec![1, 2, 3]);
    }

    #[test]
    fn null_sender_swallows_events() {
        let sender = null_sender();
        sender.pipeline(PipelineEvent::Started);
        sender.pipeline(PipelineEvent::Cancelled);
    }

    #[test]
    fn drain_returns_only_queued_events() {
        let (sender, receiver) = EventChannel::new();
        sender.pipeline(PipelineEvent::Started);
        sender.pipeline(PipelineEvent::Cancelled);

        assert_eq!(receiver.drain().len(), 2);
        assert!(receiver.drain().is_empty());
        assert!(receiver.try_recv().is_none());
    }
}
