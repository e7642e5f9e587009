//! # Task Managers
//!
//! One [`TaskManager`](crate::orchestration::task_manager::TaskManager)
//! implementation per task type. Managers own the per-run state (prepared
//! playbook, membership, callback accumulators) and share the collaborators
//! held by [`ManagerContext`].

pub mod cve;
pub mod repo_set;
pub mod scan;

use std::sync::Arc;
use tracing::warn;

use crate::cache::TaskCache;
use crate::constants::steps;
use crate::database::{ProgressStore, ResultStore};
use crate::error::{RemediationError, RemediationResult};
use crate::models::{ArtifactsUpdate, CheckItemResult, Task, TaskResultDocument, TaskType};
use crate::orchestration::callback::{CallbackRecords, CallbackRegistry};
use crate::orchestration::playbook::{PlaybookBuilder, PreparedRun};
use crate::orchestration::runner::{PlaybookRunner, RunnerCallback};
use crate::orchestration::task_manager::TaskManager;

pub use cve::CveTaskManager;
pub use repo_set::RepoSetManager;
pub use scan::{parse_scan_output, CveScanManager};

/// Collaborators shared by every manager of one service
#[derive(Clone)]
pub struct ManagerContext {
    pub store: Arc<dyn ProgressStore>,
    pub results: Arc<dyn ResultStore>,
    pub cache: Arc<TaskCache>,
    pub runner: Arc<dyn PlaybookRunner>,
    pub registry: Arc<CallbackRegistry>,
    pub playbooks: PlaybookBuilder,
}

impl std::fmt::Debug for ManagerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerContext")
            .field("cache", &self.cache)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl ManagerContext {
    /// Store the generated playbook and inventory. The run goes ahead
    /// without them.
    pub async fn save_prepared(&self, task_id: &str, prepared: &PreparedRun) {
        let update = match (prepared.playbook_json(), prepared.inventory_json()) {
            (Ok(playbook), Ok(inventory)) => ArtifactsUpdate {
                playbook: Some(playbook),
                inventory: Some(inventory),
                log: None,
            },
            (Err(e), _) | (_, Err(e)) => {
                warn!(task_id = task_id, error = %e, "Could not serialize playbook artifacts");
                return;
            }
        };
        if let Err(e) = self.results.save_task_artifacts(task_id, update).await {
            warn!(task_id = task_id, error = %e, "Could not save playbook artifacts");
        }
    }

    /// Overwrite the stored result document
    pub async fn save_result(&self, document: &TaskResultDocument) -> RemediationResult<()> {
        let log = serde_json::to_string(document)?;
        self.results
            .save_task_artifacts(
                &document.task_id,
                ArtifactsUpdate {
                    log: Some(log),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Run `prepared` with `callback` registered for push delivery for the
    /// duration of the run
    pub async fn run(
        &self,
        task_id: &str,
        prepared: &PreparedRun,
        callback: Arc<dyn RunnerCallback>,
    ) -> RemediationResult<()> {
        let _registration = self.registry.register(task_id, Arc::clone(&callback));
        self.runner.run(task_id, prepared, callback).await?;
        Ok(())
    }
}

/// Check results of one host and whether they all passed
pub(crate) fn check_items<S>(records: &CallbackRecords<S>, host: &str) -> (Vec<CheckItemResult>, bool) {
    let items: Vec<CheckItemResult> = records
        .check_results(host)
        .into_iter()
        .map(|(step, result)| CheckItemResult {
            item: steps::check_item(&step).unwrap_or(&step).to_string(),
            result,
        })
        .collect();
    let passed = items.iter().all(|item| item.result);
    (items, passed)
}

pub(crate) fn not_prepared(task_id: &str) -> RemediationError {
    RemediationError::InvalidState(format!("task {task_id} was not initialized before running"))
}

/// Manager for `task`, restricted to `cve_list` for CVE tasks (empty means
/// every CVE of the task)
pub fn build_manager(
    ctx: ManagerContext,
    task: Task,
    cve_list: Vec<String>,
) -> Box<dyn TaskManager> {
    match task.task_type {
        TaskType::CveFix | TaskType::CveRollback => {
            Box::new(CveTaskManager::new(ctx, task, cve_list))
        }
        TaskType::RepoSet => Box::new(RepoSetManager::new(ctx, task)),
        TaskType::CveScan => Box::new(CveScanManager::new(ctx, task)),
    }
}
