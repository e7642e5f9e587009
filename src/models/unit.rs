//! Unit-of-work rows: the granular progress records owned by a task.

use serde::{Deserialize, Serialize};

use crate::constants::{CveHostStatus, RepoStatus, ScanStatus};

/// Which table holds a task's units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// one row per (task, host, CVE)
    Cve,
    /// one row per (task, host)
    Repo,
    /// host scan status, referenced by (task, host)
    Scan,
}

/// Per-CVE row of a CVE task, carrying the progress counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCve {
    pub task_id: String,
    pub cve_id: String,
    pub reboot: bool,
    pub progress: i64,
    pub host_num: i64,
    pub packages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CveHostUnit {
    pub task_id: String,
    pub cve_id: String,
    pub host_id: i64,
    pub host_name: String,
    pub host_ip: String,
    pub status: CveHostStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoHostUnit {
    pub task_id: String,
    pub repo_name: String,
    pub host_id: i64,
    pub host_name: String,
    pub host_ip: String,
    pub status: RepoStatus,
}

/// Scan membership row joined with the host's current scan status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanHostUnit {
    pub task_id: String,
    pub host_id: i64,
    pub host_name: String,
    pub host_ip: String,
    pub status: Option<ScanStatus>,
}
