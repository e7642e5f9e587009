//! Callback handler for cve-fix and cve-rollback runs.
//!
//! A step named after one of the task's CVEs is a tracked unit; anything
//! else the playbook emits (checks, reboot) is kept as a check result.

use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::{error, warn};

use super::{Accumulator, CallbackRecords, StepRecord, UnitRecord};
use crate::cache::TaskMembership;
use crate::constants::{CveHostStatus, RunnerOutcome};
use crate::database::{ProgressMode, ProgressStore, StoreError};
use crate::logging::log_unit_operation;
use crate::metrics;
use crate::models::TaskType;
use crate::orchestration::runner::{RunnerCallback, RunnerEvent};

/// Runner outcome to unit status. A successful rollback command reverts the
/// fix, so the CVE becomes `unfixed` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CveStatusMapping {
    Fix,
    Rollback,
}

impl CveStatusMapping {
    pub fn classify(&self, outcome: RunnerOutcome) -> CveHostStatus {
        match (self, outcome) {
            (Self::Fix, RunnerOutcome::Ok) => CveHostStatus::Fixed,
            (Self::Fix, RunnerOutcome::Unreachable | RunnerOutcome::Failed) => {
                CveHostStatus::Unfixed
            }
            (Self::Rollback, RunnerOutcome::Ok) => CveHostStatus::Unfixed,
            (Self::Rollback, RunnerOutcome::Unreachable | RunnerOutcome::Failed) => {
                CveHostStatus::Fixed
            }
        }
    }

    /// Unit status that marks the CVE as not remediated for this run
    pub fn failed_status(&self) -> CveHostStatus {
        match self {
            Self::Fix => CveHostStatus::Unfixed,
            Self::Rollback => CveHostStatus::Fixed,
        }
    }

    pub fn for_task_type(task_type: TaskType) -> Option<Self> {
        match task_type {
            TaskType::CveFix => Some(Self::Fix),
            TaskType::CveRollback => Some(Self::Rollback),
            TaskType::RepoSet | TaskType::CveScan => None,
        }
    }

    pub fn task_type(&self) -> TaskType {
        match self {
            Self::Fix => TaskType::CveFix,
            Self::Rollback => TaskType::CveRollback,
        }
    }
}

pub struct CveCallback {
    task_id: String,
    mapping: CveStatusMapping,
    membership: Arc<TaskMembership>,
    store: Arc<dyn ProgressStore>,
    records: Accumulator<CveHostStatus>,
}

impl std::fmt::Debug for CveCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CveCallback")
            .field("task_id", &self.task_id)
            .field("mapping", &self.mapping)
            .finish_non_exhaustive()
    }
}

impl CveCallback {
    pub fn new(
        task_id: &str,
        mapping: CveStatusMapping,
        membership: Arc<TaskMembership>,
        store: Arc<dyn ProgressStore>,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            mapping,
            membership,
            store,
            records: Accumulator::default(),
        }
    }

    pub fn fix(task_id: &str, membership: Arc<TaskMembership>, store: Arc<dyn ProgressStore>) -> Self {
        Self::new(task_id, CveStatusMapping::Fix, membership, store)
    }

    pub fn rollback(
        task_id: &str,
        membership: Arc<TaskMembership>,
        store: Arc<dyn ProgressStore>,
    ) -> Self {
        Self::new(task_id, CveStatusMapping::Rollback, membership, store)
    }

    pub fn records(&self) -> CallbackRecords<CveHostStatus> {
        self.records.snapshot()
    }

    async fn handle(&self, event: &RunnerEvent) {
        metrics::callback_events_total().add(
            1,
            &[
                KeyValue::new("task_type", self.mapping.task_type().as_str()),
                KeyValue::new("outcome", event.outcome.as_str()),
            ],
        );

        let Some(host) = self.membership.host(&event.host) else {
            warn!(
                task_id = %self.task_id,
                host = %event.host,
                step = %event.step,
                "Callback for host outside task membership"
            );
            return;
        };
        let info = event.output().to_string();

        if !self.membership.has_cve(&event.step) {
            self.records.record_check(
                &event.host,
                &event.step,
                StepRecord {
                    info,
                    outcome: event.outcome,
                },
            );
            return;
        }

        let status = self.mapping.classify(event.outcome);
        self.records
            .record_unit(&event.host, &event.step, UnitRecord { info, status });
        self.save_to_db(&event.step, host.host_id, &event.host, status)
            .await;
    }

    async fn save_to_db(&self, cve_id: &str, host_id: i64, host_name: &str, status: CveHostStatus) {
        match self
            .store
            .update_cve_status(&self.task_id, cve_id, host_id, status)
            .await
        {
            Ok(()) => log_unit_operation(&self.task_id, host_name, cve_id, status.as_str()),
            Err(StoreError::NotFound(what)) => {
                warn!(task_id = %self.task_id, cve_id = cve_id, host_id = host_id, missing = %what, "Unit not found while recording callback");
            }
            Err(e) => {
                error!(task_id = %self.task_id, cve_id = cve_id, host_id = host_id, error = %e, "Failed to record unit status");
            }
        }

        // progress counts reports, whether or not the status write landed
        if let Err(e) = self
            .store
            .set_cve_progress(&self.task_id, &[cve_id.to_string()], ProgressMode::Add)
            .await
        {
            error!(task_id = %self.task_id, cve_id = cve_id, error = %e, "Failed to advance cve progress");
        }
    }
}

#[async_trait]
impl RunnerCallback for CveCallback {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_inverts_fix_mapping() {
        for outcome in [
            RunnerOutcome::Ok,
            RunnerOutcome::Failed,
            RunnerOutcome::Unreachable,
        ] {
            let fix = CveStatusMapping::Fix.classify(outcome);
            let rollback = CveStatusMapping::Rollback.classify(outcome);
            assert_ne!(fix, rollback);
        }
        assert_eq!(
            CveStatusMapping::Fix.classify(RunnerOutcome::Unreachable),
            CveHostStatus::Unfixed
        );
        assert_eq!(
            CveStatusMapping::Rollback.classify(RunnerOutcome::Unreachable),
            CveHostStatus::Fixed
        );
    }
}
