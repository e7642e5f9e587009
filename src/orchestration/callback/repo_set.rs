//! Callback handler for repo-set runs.
//!
//! Only the `set repo` step is a tracked unit. On success the host record
//! also gets the repository name, and only after the unit status write
//! went through.

use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::{error, warn};

use super::{Accumulator, CallbackRecords, StepRecord, UnitRecord};
use crate::cache::TaskMembership;
use crate::constants::{steps, RepoStatus, RunnerOutcome};
use crate::database::ProgressStore;
use crate::logging::log_unit_operation;
use crate::metrics;
use crate::models::TaskType;
use crate::orchestration::runner::{RunnerCallback, RunnerEvent};

pub struct RepoSetCallback {
    task_id: String,
    membership: Arc<TaskMembership>,
    store: Arc<dyn ProgressStore>,
    records: Accumulator<RepoStatus>,
}

impl std::fmt::Debug for RepoSetCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoSetCallback")
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}

impl RepoSetCallback {
    pub fn new(task_id: &str, membership: Arc<TaskMembership>, store: Arc<dyn ProgressStore>) -> Self {
        Self {
            task_id: task_id.to_string(),
            membership,
            store,
            records: Accumulator::default(),
        }
    }

    pub fn records(&self) -> CallbackRecords<RepoStatus> {
        self.records.snapshot()
    }

    fn classify(outcome: RunnerOutcome) -> RepoStatus {
        if outcome.is_success() {
            RepoStatus::Set
        } else {
            RepoStatus::Unset
        }
    }

    async fn handle(&self, event: &RunnerEvent) {
        metrics::callback_events_total().add(
            1,
            &[
                KeyValue::new("task_type", TaskType::RepoSet.as_str()),
                KeyValue::new("outcome", event.outcome.as_str()),
            ],
        );

        let Some(host) = self.membership.host(&event.host) else {
            warn!(task_id = %self.task_id, host = %event.host, "Callback for host outside task membership");
            return;
        };
        let record = StepRecord {
            info: event.output().to_string(),
            outcome: event.outcome,
        };

        if event.step == steps::SET_REPO {
            let status = Self::classify(event.outcome);
            self.records.record_unit(
                &event.host,
                &event.step,
                UnitRecord {
                    info: record.info,
                    status,
                },
            );
            self.save_to_db(host.host_id, &event.host, host.repo_name.as_deref(), status)
                .await;
        } else if steps::check_item(&event.step).is_some() {
            self.records.record_check(&event.host, &event.step, record);
        } else {
            self.records.record_step(&event.host, &event.step, record);
        }
    }

    async fn save_to_db(
        &self,
        host_id: i64,
        host_name: &str,
        repo_name: Option<&str>,
        status: RepoStatus,
    ) {
        if let Err(e) = self
            .store
            .set_repo_status(&self.task_id, &[host_id], status)
            .await
        {
            warn!(task_id = %self.task_id, host_id = host_id, error = %e, "Failed to record repo status");
            return;
        }
        log_unit_operation(&self.task_id, host_name, steps::SET_REPO, status.as_str());

        if status != RepoStatus::Set {
            return;
        }
        let Some(repo_name) = repo_name else {
            return;
        };
        if let Err(e) = self.store.set_host_repo(repo_name, &[host_id]).await {
            error!(task_id = %self.task_id, host_id = host_id, repo_name = repo_name, error = %e, "Failed to record host repo");
        }
    }
}

#[async_trait]
impl RunnerCallback for RepoSetCallback {
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
