//! Callback handler for cve-scan runs. Every event, whatever its outcome,
//! marks the host as done scanning; the raw output is only kept in memory
//! for the result document.

use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::warn;

use super::{Accumulator, CallbackRecords, UnitRecord};
use crate::cache::TaskMembership;
use crate::constants::{RunnerOutcome, ScanStatus};
use crate::database::ProgressStore;
use crate::logging::log_unit_operation;
use crate::metrics;
use crate::models::TaskType;
use crate::orchestration::runner::{RunnerCallback, RunnerEvent};

pub struct CveScanCallback {
    task_id: String,
    membership: Arc<TaskMembership>,
    store: Arc<dyn ProgressStore>,
    records: Accumulator<RunnerOutcome>,
}

impl std::fmt::Debug for CveScanCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CveScanCallback")
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}

impl CveScanCallback {
    pub fn new(task_id: &str, membership: Arc<TaskMembership>, store: Arc<dyn ProgressStore>) -> Self {
        Self {
            task_id: task_id.to_string(),
            membership,
            store,
            records: Accumulator::default(),
        }
    }

    pub fn records(&self) -> CallbackRecords<RunnerOutcome> {
        self.records.snapshot()
    }

    async fn handle(&self, event: &RunnerEvent) {
        metrics::callback_events_total().add(
            1,
            &[
                KeyValue::new("task_type", TaskType::CveScan.as_str()),
                KeyValue::new("outcome", event.outcome.as_str()),
            ],
        );

        let Some(host) = self.membership.host(&event.host) else {
            warn!(task_id = %self.task_id, host = %event.host, "Callback for host outside task membership");
            return;
        };

        self.records.record_unit(
            &event.host,
            &event.step,
            UnitRecord {
                info: event.output().to_string(),
                status: event.outcome,
            },
        );

        match self.store.update_scan_status(&[host.host_id]).await {
            Ok(()) => log_unit_operation(
                &self.task_id,
                &event.host,
                &event.step,
                ScanStatus::Done.as_str(),
            ),
            Err(e) => {
                warn!(task_id = %self.task_id, host_id = host.host_id, error = %e, "Failed to record scan status")
            }
        }
    }
}

#[async_trait]
impl RunnerCallback for CveScanCallback {
    async fn on_unreachable(&self, event: &RunnerEvent) {
        self.handle(event).await;
    }

    async fn on_ok(&self, event: &RunnerEvent) {
        self.handle(event).await;
    }

    async fn on_failed(&self, event: &RunnerEvent) {
        self.handle(event).await;
    }
}
