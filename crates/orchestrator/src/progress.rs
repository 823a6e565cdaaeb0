//! Progress tracking
//!
//! Every event is appended to the store's event log and then handed to the
//! publisher. Neither may fail the job: store errors are logged and the
//! publisher is fire-and-forget.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use kavach_common::{
    EventKind, EventPublisher, JobStatus, ProgressEvent, ScanStore, StageRunKey, StageStatus,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitCounters {
    pub dispatched: usize,
    pub retries: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct ProgressTracker {
    job_id: Uuid,
    store: Arc<dyn ScanStore>,
    publisher: Arc<dyn EventPublisher>,
    counters: Mutex<UnitCounters>,
}

impl ProgressTracker {
    pub fn new(job_id: Uuid, store: Arc<dyn ScanStore>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            job_id,
            store,
            publisher,
            counters: Mutex::new(UnitCounters::default()),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub async fn emit(&self, event: ProgressEvent) {
        if let Err(e) = self.store.append_event(&event).await {
            warn!(job_id = %self.job_id, kind = %event.kind, error = %e, "failed to record progress event");
        }
        self.publisher.publish(self.job_id, &event);
    }

    fn event(&self, kind: EventKind) -> ProgressEvent {
        ProgressEvent::new(self.job_id, kind)
    }

    fn unit_event(&self, kind: EventKind, key: &StageRunKey) -> ProgressEvent {
        self.event(kind)
            .with_stage(key.stage)
            .with_sub_target(key.dedup_key.clone())
    }

    pub async fn job_event(&self, kind: EventKind, payload: Value) {
        self.emit(self.event(kind).with_payload(payload)).await;
    }

    pub async fn unit_queued(&self, key: &StageRunKey) {
        self.emit(self.unit_event(EventKind::UnitQueued, key)).await;
    }

    pub async fn unit_dispatched(&self, key: &StageRunKey, attempt: u32) {
        self.counters.lock().await.dispatched += 1;
        kavach_telemetry::record_unit_dispatched(key.stage.as_str());
        self.emit(
            self.unit_event(EventKind::UnitDispatched, key)
                .with_payload(json!({ "attempt": attempt })),
        )
        .await;
    }

    pub async fn unit_retrying(&self, key: &StageRunKey, attempt: u32, error: &str, backoff: Duration) {
        self.counters.lock().await.retries += 1;
        kavach_telemetry::record_unit_retry(key.stage.as_str());
        self.emit(self.unit_event(EventKind::UnitRetrying, key).with_payload(json!({
            "attempt": attempt,
            "error": error,
            "backoff_ms": u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
        })))
        .await;
    }

    pub async fn unit_finished(
        &self,
        key: &StageRunKey,
        status: StageStatus,
        last_error: Option<&str>,
        elapsed: Duration,
    ) {
        let kind = {
            let mut counters = self.counters.lock().await;
            match status {
                StageStatus::Succeeded => {
                    counters.succeeded += 1;
                    EventKind::UnitSucceeded
                }
                StageStatus::Skipped => {
                    counters.skipped += 1;
                    EventKind::UnitSkipped
                }
                _ => {
                    counters.failed += 1;
                    EventKind::UnitFailed
                }
            }
        };
        kavach_telemetry::record_unit_finished(key.stage.as_str(), status.as_str(), elapsed);
        self.emit(self.unit_event(kind, key).with_payload(json!({
            "error": last_error,
            "elapsed_ms": u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        })))
        .await;
    }

    pub async fn job_finished(&self, status: JobStatus) {
        kavach_telemetry::record_job_finished(status.as_str());
        let counters = self.snapshot().await;
        self.job_event(
            EventKind::JobFinished,
            json!({
                "status": status,
                "succeeded": counters.succeeded,
                "failed": counters.failed,
                "skipped": counters.skipped,
            }),
        )
        .await;
    }

    pub async fn snapshot(&self) -> UnitCounters {
        *self.counters.lock().await
    }

    pub async fn print_summary(&self) {
        let c = self.snapshot().await;
        let finished = c.succeeded + c.failed + c.skipped;

        info!(job_id = %self.job_id, "Scan Summary:");
        info!("  Units dispatched: {}", c.dispatched);
        info!("  Succeeded: {}", c.succeeded);
        info!("  Failed: {}", c.failed);
        info!("  Skipped: {}", c.skipped);
        info!("  Retries: {}", c.retries);
        if finished > 0 {
            info!("  Success rate: {:.1}%", (c.succeeded as f64 / finished as f64) * 100.0);
        }
    }
}
