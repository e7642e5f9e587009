//! # Task Query Service
//!
//! Read side of the task surface: list, progress, per-CVE and per-host
//! views, and the stored result document.
//!
//! ## Design
//!
//! Every query is scoped to the caller: a task owned by someone else is
//! reported exactly like a task that does not exist. Summary statuses are
//! always computed through
//! [`status_aggregator`](crate::orchestration::status_aggregator) so every
//! view collapses raw unit statuses the same way.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::constants::{CveHostStatus, RepoStatus, TaskStatus};
use crate::database::{ProgressStore, ResultStore};
use crate::error::{Partial, RemediationError, RemediationResult};
use crate::models::{
    ArtifactKind, CveHostUnit, RepoHostUnit, Task, TaskResultDocument, TaskType,
};
use crate::orchestration::status_aggregator::{
    aggregate_cve_statuses, repo_bucket, scan_bucket, CveAggregation, StatusCounts,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// 1-based page selection. Without both fields everything is returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paging {
    pub page: Option<u64>,
    pub per_page: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub total_count: u64,
    pub total_page: u64,
    pub result: Vec<T>,
}

impl<T> Paginated<T> {
    pub fn empty() -> Self {
        Self {
            total_count: 0,
            total_page: 0,
            result: Vec::new(),
        }
    }
}

impl Paging {
    pub fn apply<T>(&self, items: Vec<T>) -> Paginated<T> {
        let total_count = items.len() as u64;
        match (self.page, self.per_page) {
            (Some(page), Some(per_page)) if per_page > 0 => {
                let skip = page.max(1).saturating_sub(1).saturating_mul(per_page);
                let result = items
                    .into_iter()
                    .skip(usize::try_from(skip).unwrap_or(usize::MAX))
                    .take(usize::try_from(per_page).unwrap_or(usize::MAX))
                    .collect();
                Paginated {
                    total_count,
                    total_page: total_count.div_ceil(per_page),
                    result,
                }
            }
            _ => Paginated {
                total_count,
                total_page: u64::from(total_count > 0),
                result: items,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSortKey {
    HostNum,
    CreateTime,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskListQuery {
    /// Substring of the task name
    pub task_name: Option<String>,
    pub task_type: Option<Vec<TaskType>>,
    pub sort: Option<TaskSortKey>,
    pub order: SortOrder,
    #[serde(flatten)]
    pub paging: Paging,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub task_name: String,
    pub task_type: TaskType,
    pub description: String,
    pub host_num: i64,
    pub create_time: i64,
}

impl From<Task> for TaskSummary {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.task_id,
            task_name: task.task_name,
            task_type: task.task_type,
            description: task.description,
            host_num: task.host_num,
            create_time: task.create_time,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CveTaskInfoQuery {
    /// Substring of the CVE id
    pub cve_id: Option<String>,
    pub reboot: Option<bool>,
    /// An empty list matches nothing
    pub status: Option<Vec<TaskStatus>>,
    /// Sort by host count when set
    pub order: Option<SortOrder>,
    #[serde(flatten)]
    pub paging: Paging,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CveTaskRow {
    pub cve_id: String,
    pub package: String,
    pub reboot: bool,
    pub host_num: i64,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CveUnitView {
    pub host_id: i64,
    pub host_name: String,
    pub host_ip: String,
    pub status: CveHostStatus,
}

impl From<CveHostUnit> for CveUnitView {
    fn from(unit: CveHostUnit) -> Self {
        Self {
            host_id: unit.host_id,
            host_name: unit.host_name,
            host_ip: unit.host_ip,
            status: unit.status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CveProgress {
    pub progress: i64,
    pub host_num: i64,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoTaskInfoQuery {
    /// Substring of the host name
    pub host_name: Option<String>,
    pub status: Option<Vec<RepoStatus>>,
    #[serde(flatten)]
    pub paging: Paging,
}

#[derive(Clone)]
pub struct TaskQueryService {
    store: Arc<dyn ProgressStore>,
    results: Arc<dyn ResultStore>,
}

impl std::fmt::Debug for TaskQueryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueryService").finish_non_exhaustive()
    }
}

impl TaskQueryService {
    pub fn new(store: Arc<dyn ProgressStore>, results: Arc<dyn ResultStore>) -> Self {
        Self { store, results }
    }

    /// Task `task_id` if it exists and belongs to `username`
    pub async fn owned_task(&self, username: &str, task_id: &str) -> RemediationResult<Task> {
        self.store
            .get_task(task_id)
            .await?
            .filter(|task| task.is_owned_by(username))
            .ok_or_else(|| RemediationError::NotFound(format!("task {task_id}")))
    }

    async fn owned_task_of(
        &self,
        username: &str,
        task_id: &str,
        accept: impl Fn(TaskType) -> bool,
    ) -> RemediationResult<Task> {
        let task = self.owned_task(username, task_id).await?;
        if !accept(task.task_type) {
            return Err(RemediationError::Validation(format!(
                "task {task_id} is a {} task",
                task.task_type
            )));
        }
        Ok(task)
    }

    pub async fn get_task_list(
        &self,
        username: &str,
        query: &TaskListQuery,
    ) -> RemediationResult<Paginated<TaskSummary>> {
        let mut tasks: Vec<Task> = self
            .store
            .list_tasks(username)
            .await?
            .into_iter()
            .filter(|task| {
                query
                    .task_name
                    .as_deref()
                    .map_or(true, |name| task.task_name.contains(name))
            })
            .filter(|task| {
                query
                    .task_type
                    .as_ref()
                    .map_or(true, |types| types.contains(&task.task_type))
            })
            .collect();

        if let Some(key) = query.sort {
            tasks.sort_by(|a, b| {
                let ordering = match key {
                    TaskSortKey::HostNum => a.host_num.cmp(&b.host_num),
                    TaskSortKey::CreateTime => a.create_time.cmp(&b.create_time),
                };
                match query.order {
                    SortOrder::Asc => ordering,
                    SortOrder::Desc => ordering.reverse(),
                }
            });
        }

        Ok(query
            .paging
            .apply(tasks.into_iter().map(TaskSummary::from).collect()))
    }

    /// Host counts per summary bucket for each requested task
    pub async fn get_task_progress(
        &self,
        username: &str,
        task_ids: &[String],
    ) -> RemediationResult<Partial<BTreeMap<String, StatusCounts>>> {
        let mut progress = BTreeMap::new();
        let mut missing = Vec::new();

        for task_id in task_ids {
            match self.owned_task(username, task_id).await {
                Ok(task) => {
                    progress.insert(task_id.clone(), self.host_counts(&task).await?);
                }
                Err(RemediationError::NotFound(_)) => missing.push(task_id.clone()),
                Err(e) => return Err(e),
            }
        }

        if progress.is_empty() {
            return Err(RemediationError::NotFound(format!(
                "none of the tasks {task_ids:?}"
            )));
        }
        debug!(found = progress.len(), missing = missing.len(), "Task progress query");
        Ok(Partial::new(progress, missing))
    }

    async fn host_counts(&self, task: &Task) -> RemediationResult<StatusCounts> {
        let counts = match task.task_type {
            TaskType::CveFix | TaskType::CveRollback => {
                let mode = CveAggregation::for_task_type(task.task_type);
                let mut by_host: BTreeMap<i64, Vec<CveHostStatus>> = BTreeMap::new();
                for unit in self.store.get_cve_units(&task.task_id).await? {
                    by_host.entry(unit.host_id).or_default().push(unit.status);
                }
                by_host
                    .into_values()
                    .map(|statuses| aggregate_cve_statuses(mode, statuses))
                    .collect()
            }
            TaskType::RepoSet => self
                .store
                .get_repo_units(&task.task_id)
                .await?
                .into_iter()
                .map(|unit| repo_bucket(unit.status))
                .collect(),
            TaskType::CveScan => self
                .store
                .get_scan_units(&task.task_id)
                .await?
                .into_iter()
                .map(|unit| scan_bucket(unit.status))
                .collect(),
        };
        Ok(counts)
    }

    pub async fn get_task_info(&self, username: &str, task_id: &str) -> RemediationResult<Task> {
        self.owned_task(username, task_id).await
    }

    /// Summary status of every CVE of a CVE task
    pub async fn cve_statuses(&self, task: &Task) -> RemediationResult<BTreeMap<String, TaskStatus>> {
        let mode = CveAggregation::for_task_type(task.task_type);
        let mut by_cve: BTreeMap<String, Vec<CveHostStatus>> = self
            .store
            .get_task_cves(&task.task_id)
            .await?
            .into_iter()
            .map(|cve| (cve.cve_id, Vec::new()))
            .collect();
        for unit in self.store.get_cve_units(&task.task_id).await? {
            by_cve.entry(unit.cve_id).or_default().push(unit.status);
        }
        Ok(by_cve
            .into_iter()
            .map(|(cve_id, statuses)| (cve_id, aggregate_cve_statuses(mode, statuses)))
            .collect())
    }

    pub async fn get_cve_task_info(
        &self,
        username: &str,
        task_id: &str,
        query: &CveTaskInfoQuery,
    ) -> RemediationResult<Paginated<CveTaskRow>> {
        let task = self
            .owned_task_of(username, task_id, |t| t.is_cve_task())
            .await?;
        if query.status.as_ref().is_some_and(Vec::is_empty) {
            return Ok(Paginated::empty());
        }

        let statuses = self.cve_statuses(&task).await?;
        let mut rows: Vec<CveTaskRow> = self
            .store
            .get_task_cves(task_id)
            .await?
            .into_iter()
            .map(|cve| CveTaskRow {
                status: statuses
                    .get(&cve.cve_id)
                    .copied()
                    .unwrap_or(TaskStatus::Succeed),
                package: cve.packages.join(","),
                reboot: cve.reboot,
                host_num: cve.host_num,
                cve_id: cve.cve_id,
            })
            .filter(|row| {
                query
                    .cve_id
                    .as_deref()
                    .map_or(true, |needle| row.cve_id.contains(needle))
            })
            .filter(|row| query.reboot.map_or(true, |reboot| row.reboot == reboot))
            .filter(|row| {
                query
                    .status
                    .as_ref()
                    .map_or(true, |wanted| wanted.contains(&row.status))
            })
            .collect();

        rows.sort_by(|a, b| a.cve_id.cmp(&b.cve_id));
        if let Some(order) = query.order {
            rows.sort_by(|a, b| match order {
                SortOrder::Asc => a.host_num.cmp(&b.host_num),
                SortOrder::Desc => b.host_num.cmp(&a.host_num),
            });
        }
        Ok(query.paging.apply(rows))
    }

    /// Per-host unit statuses of the listed CVEs (all when empty)
    pub async fn get_task_cve_status(
        &self,
        username: &str,
        task_id: &str,
        cve_list: &[String],
    ) -> RemediationResult<BTreeMap<String, Vec<CveUnitView>>> {
        self.owned_task_of(username, task_id, |t| t.is_cve_task())
            .await?;
        let mut result: BTreeMap<String, Vec<CveUnitView>> = BTreeMap::new();
        for unit in self.store.get_cve_units(task_id).await? {
            if cve_list.is_empty() || cve_list.contains(&unit.cve_id) {
                result
                    .entry(unit.cve_id.clone())
                    .or_default()
                    .push(CveUnitView::from(unit));
            }
        }
        if result.is_empty() {
            return Err(RemediationError::NotFound(format!(
                "cves {cve_list:?} in task {task_id}"
            )));
        }
        for units in result.values_mut() {
            units.sort_by_key(|u| u.host_id);
        }
        Ok(result)
    }

    pub async fn get_task_cve_progress(
        &self,
        username: &str,
        task_id: &str,
        cve_list: &[String],
    ) -> RemediationResult<BTreeMap<String, CveProgress>> {
        let task = self
            .owned_task_of(username, task_id, |t| t.is_cve_task())
            .await?;
        let statuses = self.cve_statuses(&task).await?;
        let result: BTreeMap<String, CveProgress> = self
            .store
            .get_task_cves(task_id)
            .await?
            .into_iter()
            .filter(|cve| cve_list.is_empty() || cve_list.contains(&cve.cve_id))
            .map(|cve| {
                let status = statuses
                    .get(&cve.cve_id)
                    .copied()
                    .unwrap_or(TaskStatus::Succeed);
                (
                    cve.cve_id,
                    CveProgress {
                        progress: cve.progress,
                        host_num: cve.host_num,
                        status,
                    },
                )
            })
            .collect();
        if result.is_empty() {
            return Err(RemediationError::NotFound(format!(
                "cves {cve_list:?} in task {task_id}"
            )));
        }
        Ok(result)
    }

    /// CVEs of a fix task that reached a terminal summary status and can
    /// therefore be rolled back
    pub async fn get_rollback_cve_list(
        &self,
        username: &str,
        task_id: &str,
    ) -> RemediationResult<Vec<String>> {
        let task = self
            .owned_task_of(username, task_id, |t| t == TaskType::CveFix)
            .await?;
        Ok(self
            .cve_statuses(&task)
            .await?
            .into_iter()
            .filter(|(_, status)| status.is_terminal())
            .map(|(cve_id, _)| cve_id)
            .collect())
    }

    pub async fn get_repo_task_info(
        &self,
        username: &str,
        task_id: &str,
        query: &RepoTaskInfoQuery,
    ) -> RemediationResult<Paginated<RepoHostUnit>> {
        self.owned_task_of(username, task_id, |t| t == TaskType::RepoSet)
            .await?;
        if query.status.as_ref().is_some_and(Vec::is_empty) {
            return Ok(Paginated::empty());
        }
        let mut units: Vec<RepoHostUnit> = self
            .store
            .get_repo_units(task_id)
            .await?
            .into_iter()
            .filter(|unit| {
                query
                    .host_name
                    .as_deref()
                    .map_or(true, |needle| unit.host_name.contains(needle))
            })
            .filter(|unit| {
                query
                    .status
                    .as_ref()
                    .map_or(true, |wanted| wanted.contains(&unit.status))
            })
            .collect();
        units.sort_by_key(|u| u.host_id);
        Ok(query.paging.apply(units))
    }

    async fn result_document(&self, task: &Task) -> RemediationResult<TaskResultDocument> {
        let artifacts = self
            .results
            .get_task_artifacts(&task.task_id)
            .await?
            .ok_or_else(|| RemediationError::NotFound(format!("result of task {}", task.task_id)))?;
        if artifacts.log.is_empty() {
            return Err(RemediationError::NotFound(format!(
                "task {} has not been executed",
                task.task_id
            )));
        }
        Ok(serde_json::from_str(&artifacts.log)?)
    }

    /// Result document restricted to the listed CVEs; hosts left without
    /// a matching CVE are dropped
    pub async fn get_task_cve_result(
        &self,
        username: &str,
        task_id: &str,
        cve_list: &[String],
    ) -> RemediationResult<TaskResultDocument> {
        let task = self
            .owned_task_of(username, task_id, |t| t.is_cve_task())
            .await?;
        let mut document = self.result_document(&task).await?;
        document.retain_cves(cve_list);
        Ok(document)
    }

    pub async fn get_task_repo_result(
        &self,
        username: &str,
        task_id: &str,
        host_list: &[i64],
    ) -> RemediationResult<TaskResultDocument> {
        let task = self
            .owned_task_of(username, task_id, |t| t == TaskType::RepoSet)
            .await?;
        let mut document = self.result_document(&task).await?;
        document.retain_hosts(host_list);
        Ok(document)
    }

    /// Result document of a scan task
    pub async fn get_task_scan_result(
        &self,
        username: &str,
        task_id: &str,
    ) -> RemediationResult<TaskResultDocument> {
        let task = self
            .owned_task_of(username, task_id, |t| t == TaskType::CveScan)
            .await?;
        self.result_document(&task).await
    }

    /// Raw playbook, inventory or log text
    pub async fn get_task_ansible_info(
        &self,
        username: &str,
        task_id: &str,
        kind: ArtifactKind,
    ) -> RemediationResult<String> {
        self.owned_task(username, task_id).await?;
        let artifacts = self
            .results
            .get_task_artifacts(task_id)
            .await?
            .ok_or_else(|| RemediationError::NotFound(format!("artifacts of task {task_id}")))?;
        Ok(match kind {
            ArtifactKind::Playbook => artifacts.playbook,
            ArtifactKind::Inventory => artifacts.inventory,
            ArtifactKind::Log => artifacts.log,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paging_rounds_total_page_up() {
        let paging = Paging {
            page: Some(2),
            per_page: Some(2),
        };
        let page = paging.apply(vec![1, 2, 3, 4, 5]);
        assert_eq!(page.total_count, 5);
        assert_eq!(page.total_page, 3);
        assert_eq!(page.result, vec![3, 4]);
    }

    #[test]
    fn missing_paging_returns_everything() {
        let page = Paging::default().apply(vec!["a", "b"]);
        assert_eq!(page.total_page, 1);
        assert_eq!(page.result.len(), 2);

        let empty: Paginated<u8> = Paging::default().apply(Vec::new());
        assert_eq!(empty.total_page, 0);
    }

    #[test]
    fn page_past_the_end_is_empty() {
        let paging = Paging {
            page: Some(9),
            per_page: Some(10),
        };
        let page = paging.apply(vec![1, 2, 3]);
        assert!(page.result.is_empty());
        assert_eq!(page.total_page, 1);
    }
}
