//! # Status Aggregator
//!
//! Collapses a set of raw unit statuses into one summary status.
//!
//! Precedence is strict: `running` dominates `unknown`, which dominates a
//! failed unit, which dominates success. An empty set is vacuously
//! `succeed`. Aggregation is defined over the *set* of statuses seen, so it
//! is independent of callback arrival order and safe to recompute after
//! partial writes.

use serde::{Deserialize, Serialize};

use crate::constants::{CveHostStatus, RepoStatus, ScanStatus, TaskStatus};
use crate::models::TaskType;

/// Which raw status counts as a failed unit.
///
/// A fix that leaves a CVE `unfixed` failed; a rollback that leaves it
/// `fixed` failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CveAggregation {
    Fix,
    Rollback,
}

impl CveAggregation {
    pub fn for_task_type(task_type: TaskType) -> Self {
        match task_type {
            TaskType::CveRollback => Self::Rollback,
            _ => Self::Fix,
        }
    }

    fn failed_status(&self) -> CveHostStatus {
        match self {
            Self::Fix => CveHostStatus::Unfixed,
            Self::Rollback => CveHostStatus::Fixed,
        }
    }
}

/// Summary of the raw per-host statuses of one (task, CVE) pair
pub fn aggregate_cve_statuses<I>(mode: CveAggregation, statuses: I) -> TaskStatus
where
    I: IntoIterator<Item = CveHostStatus>,
{
    let mut running = false;
    let mut unknown = false;
    let mut failed = false;
    let failed_status = mode.failed_status();

    for status in statuses {
        match status {
            CveHostStatus::Running => running = true,
            CveHostStatus::Unknown => unknown = true,
            s if s == failed_status => failed = true,
            _ => {}
        }
    }

    if running {
        TaskStatus::Running
    } else if unknown {
        TaskStatus::Unknown
    } else if failed {
        TaskStatus::Fail
    } else {
        TaskStatus::Succeed
    }
}

/// Collapse already-summarised statuses with the same precedence
pub fn aggregate_summaries<I>(statuses: I) -> TaskStatus
where
    I: IntoIterator<Item = TaskStatus>,
{
    let mut seen = [false; 4];
    for status in statuses {
        let idx = match status {
            TaskStatus::Running => 0,
            TaskStatus::Unknown => 1,
            TaskStatus::Fail => 2,
            TaskStatus::Succeed => 3,
        };
        seen[idx] = true;
    }
    if seen[0] {
        TaskStatus::Running
    } else if seen[1] {
        TaskStatus::Unknown
    } else if seen[2] {
        TaskStatus::Fail
    } else {
        TaskStatus::Succeed
    }
}

/// Repo host status in the summary domain
pub fn repo_bucket(status: RepoStatus) -> TaskStatus {
    match status {
        RepoStatus::Set => TaskStatus::Succeed,
        RepoStatus::Unset => TaskStatus::Fail,
        RepoStatus::Running => TaskStatus::Running,
        RepoStatus::Unknown => TaskStatus::Unknown,
    }
}

/// Scan host status in the summary domain; a host never scanned is unknown
pub fn scan_bucket(status: Option<ScanStatus>) -> TaskStatus {
    match status {
        Some(ScanStatus::Scanning) => TaskStatus::Running,
        Some(ScanStatus::Done) => TaskStatus::Succeed,
        None => TaskStatus::Unknown,
    }
}

/// Four-bucket host counts used by the task progress view
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub succeed: u64,
    pub fail: u64,
    pub running: u64,
    pub unknown: u64,
}

impl StatusCounts {
    pub fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Succeed => self.succeed += 1,
            TaskStatus::Fail => self.fail += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Unknown => self.unknown += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.succeed + self.fail + self.running + self.unknown
    }
}

impl FromIterator<TaskStatus> for StatusCounts {
    fn from_iter<I: IntoIterator<Item = TaskStatus>>(iter: I) -> Self {
        let mut counts = Self::default();
        for status in iter {
            counts.record(status);
        }
        counts
    }
}
