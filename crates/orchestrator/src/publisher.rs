//! Push channels for progress events

use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use kavach_common::{EventPublisher, ProgressEvent};

/// Fans events out to live subscribers. Slow subscribers lag and lose
/// events; the publisher never waits for them.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<(Uuid, ProgressEvent)>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(Uuid, ProgressEvent)> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, job_id: Uuid, event: &ProgressEvent) {
        if self.tx.send((job_id, event.clone())).is_err() {
            trace!(job_id = %job_id, kind = %event.kind, "no subscribers");
        }
    }
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPublisher;

impl EventPublisher for NullPublisher {
    fn publish(&self, _job_id: Uuid, _event: &ProgressEvent) {}
}
