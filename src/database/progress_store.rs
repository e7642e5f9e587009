//! # Progress Store Interface
//!
//! The durable mapping from (task, unit) to status and progress, plus the
//! task rows and host records those units reference. Both backends apply
//! each call atomically: a multi-row mutation either lands completely or
//! not at all.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::error;

use crate::constants::{CveHostStatus, RepoStatus};
use crate::error::RemediationError;
use crate::models::{
    ArtifactsUpdate, CveHostUnit, Host, HostInfo, RepoHostUnit, ScanHostUnit, Task,
    TaskArtifacts, TaskCve, UnitKind,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            other => Self::Database(other.to_string()),
        }
    }
}

/// The only legal progress mutations.
///
/// `Add` increments by one capped at the CVE's host count, `Fill` sets
/// progress to the host count, `Zero` resets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressMode {
    Add,
    Fill,
    Zero,
}

impl ProgressMode {
    pub fn apply(&self, progress: i64, host_num: i64) -> i64 {
        match self {
            Self::Add => (progress + 1).min(host_num),
            Self::Fill => host_num,
            Self::Zero => 0,
        }
    }
}

impl fmt::Display for ProgressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Fill => write!(f, "fill"),
            Self::Zero => write!(f, "zero"),
        }
    }
}

impl FromStr for ProgressMode {
    type Err = RemediationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(Self::Add),
            "fill" => Ok(Self::Fill),
            "zero" => Ok(Self::Zero),
            other => {
                error!(mode = other, "Rejected unknown progress mode");
                Err(RemediationError::Usage(format!(
                    "unknown progress mode '{other}'"
                )))
            }
        }
    }
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Insert or replace a host record
    async fn upsert_host(&self, host: Host) -> StoreResult<()>;

    /// Hosts owned by `username` among `host_ids`, ordered by id
    async fn get_hosts(&self, username: &str, host_ids: &[i64]) -> StoreResult<Vec<Host>>;

    async fn insert_cve_task(
        &self,
        task: &Task,
        cves: &[TaskCve],
        units: &[CveHostUnit],
    ) -> StoreResult<()>;

    async fn insert_repo_task(&self, task: &Task, units: &[RepoHostUnit]) -> StoreResult<()>;

    async fn insert_scan_task(&self, task: &Task, hosts: &[HostInfo]) -> StoreResult<()>;

    async fn get_task(&self, task_id: &str) -> StoreResult<Option<Task>>;

    async fn list_tasks(&self, username: &str) -> StoreResult<Vec<Task>>;

    /// Delete owned tasks and every unit row they own; returns the ids deleted
    async fn delete_tasks(&self, username: &str, task_ids: &[String]) -> StoreResult<Vec<String>>;

    async fn update_task_execute_time(&self, task_id: &str, executed_at: i64) -> StoreResult<()>;

    /// Tasks with at least one unit still running
    async fn running_tasks(&self) -> StoreResult<Vec<Task>>;

    async fn get_task_cves(&self, task_id: &str) -> StoreResult<Vec<TaskCve>>;

    async fn get_cve_units(&self, task_id: &str) -> StoreResult<Vec<CveHostUnit>>;

    async fn get_repo_units(&self, task_id: &str) -> StoreResult<Vec<RepoHostUnit>>;

    async fn get_scan_units(&self, task_id: &str) -> StoreResult<Vec<ScanHostUnit>>;

    /// Set the listed CVEs' units to running and their progress to zero.
    /// An empty list means every CVE of the task.
    async fn init_cve_task(&self, task_id: &str, cve_list: &[String]) -> StoreResult<()>;

    /// `NotFound` if the (task, CVE, host) unit does not exist
    async fn update_cve_status(
        &self,
        task_id: &str,
        cve_id: &str,
        host_id: i64,
        status: CveHostStatus,
    ) -> StoreResult<()>;

    /// Apply `mode` to the listed CVEs' progress; empty means all CVEs
    async fn set_cve_progress(
        &self,
        task_id: &str,
        cve_list: &[String],
        mode: ProgressMode,
    ) -> StoreResult<()>;

    /// Set repo unit status for the listed hosts; empty means all hosts
    async fn set_repo_status(
        &self,
        task_id: &str,
        host_ids: &[i64],
        status: RepoStatus,
    ) -> StoreResult<()>;

    async fn set_host_repo(&self, repo_name: &str, host_ids: &[i64]) -> StoreResult<()>;

    /// Mark hosts as scanning; `NotFound` (and no change) if any host is missing
    async fn init_host_scan(&self, host_ids: &[i64], scanned_at: i64) -> StoreResult<()>;

    /// Mark hosts as done scanning
    async fn update_scan_status(&self, host_ids: &[i64]) -> StoreResult<()>;

    /// Replace the CVE list detected on a host
    async fn save_scan_result(&self, host_id: i64, cves: &[String]) -> StoreResult<()>;

    async fn get_host_cves(&self, host_id: i64) -> StoreResult<Vec<String>>;

    /// Move every still-running unit of the task to its terminal correction
    /// status (`unknown`, or `done` for scans). Returns rows changed.
    async fn fix_task_status(&self, task_id: &str, kind: UnitKind) -> StoreResult<u64>;

    async fn count_running_units(&self, task_id: &str, kind: UnitKind) -> StoreResult<u64>;
}

/// Storage for the per-task result document
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn init_task_artifacts(&self, task_id: &str, username: &str) -> StoreResult<()>;

    /// Partial update; `NotFound` if the document was never initialised
    async fn save_task_artifacts(&self, task_id: &str, update: ArtifactsUpdate) -> StoreResult<()>;

    async fn get_task_artifacts(&self, task_id: &str) -> StoreResult<Option<TaskArtifacts>>;

    async fn delete_task_artifacts(&self, task_ids: &[String]) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_capped_at_host_num() {
        assert_eq!(ProgressMode::Add.apply(0, 2), 1);
        assert_eq!(ProgressMode::Add.apply(2, 2), 2);
        assert_eq!(ProgressMode::Fill.apply(0, 3), 3);
        assert_eq!(ProgressMode::Zero.apply(3, 3), 0);
    }

    #[test]
    fn unknown_mode_is_a_usage_error() {
        let err = "double".parse::<ProgressMode>().unwrap_err();
        assert!(matches!(err, RemediationError::Usage(_)));
        assert_eq!("fill".parse::<ProgressMode>().unwrap(), ProgressMode::Fill);
    }
}
