//! # Task Model
//!
//! A task is one remediation or scanning operation submitted against a set
//! of hosts. Its type is fixed at generation time; execution only mutates
//! `latest_execute_time` and the per-unit rows owned by the task.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::models::unit::UnitKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    CveFix,
    CveRollback,
    RepoSet,
    CveScan,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CveFix => "cve-fix",
            Self::CveRollback => "cve-rollback",
            Self::RepoSet => "repo-set",
            Self::CveScan => "cve-scan",
        }
    }

    /// Which unit table tracks progress for this task type
    pub fn unit_kind(&self) -> UnitKind {
        match self {
            Self::CveFix | Self::CveRollback => UnitKind::Cve,
            Self::RepoSet => UnitKind::Repo,
            Self::CveScan => UnitKind::Scan,
        }
    }

    pub fn is_cve_task(&self) -> bool {
        matches!(self, Self::CveFix | Self::CveRollback)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cve-fix" => Ok(Self::CveFix),
            "cve-rollback" => Ok(Self::CveRollback),
            "repo-set" => Ok(Self::RepoSet),
            "cve-scan" => Ok(Self::CveScan),
            _ => Err(format!("Invalid task type: {s}")),
        }
    }
}

/// Persisted task row.
///
/// Times are unix seconds. `repo_name` is set only for repo-set tasks and
/// `source_task_id` only for rollback tasks (the fix task being reverted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub task_type: TaskType,
    pub task_name: String,
    pub description: String,
    pub username: String,
    pub create_time: i64,
    pub latest_execute_time: Option<i64>,
    pub auto_reboot: bool,
    pub need_reboot: i64,
    pub host_num: i64,
    pub repo_name: Option<String>,
    pub source_task_id: Option<String>,
}

impl Task {
    pub fn new(task_type: TaskType, username: &str, task_name: &str, description: &str) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().simple().to_string(),
            task_type,
            task_name: task_name.to_string(),
            description: description.to_string(),
            username: username.to_string(),
            create_time: chrono::Utc::now().timestamp(),
            latest_execute_time: None,
            auto_reboot: false,
            need_reboot: 0,
            host_num: 0,
            repo_name: None,
            source_task_id: None,
        }
    }

    pub fn is_owned_by(&self, username: &str) -> bool {
        self.username == username
    }
}
