//! # Status Vocabulary and Step Names
//!
//! Persisted status strings shared by the progress store, the callback
//! handlers and every query surface. The string forms are part of the
//! storage format and must not change.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Step and group names that appear in generated playbooks and inventories
pub mod steps {
    /// Primary step of a repo-set task; its outcome decides the host status
    pub const SET_REPO: &str = "set repo";
    pub const COPY_REPO: &str = "copy repo";
    pub const SCAN: &str = "scan";
    pub const REBOOT: &str = "reboot";
    /// Pre-flight check steps are named `check <item>`
    pub const CHECK_PREFIX: &str = "check";

    pub const TOTAL_HOSTS_GROUP: &str = "total_hosts";
    pub const REBOOT_HOSTS_GROUP: &str = "reboot_hosts";

    /// Name of the check step generated for a configured check item
    pub fn check_step(item: &str) -> String {
        format!("{CHECK_PREFIX} {item}")
    }

    /// Recover the check item from a step name, if it is a check step
    pub fn check_item(step: &str) -> Option<&str> {
        step.strip_prefix(CHECK_PREFIX).map(str::trim_start)
    }
}

/// Raw status of one (task, host, CVE) unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CveHostStatus {
    Unfixed,
    Fixed,
    Running,
    Unknown,
}

impl CveHostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unfixed => "unfixed",
            Self::Fixed => "fixed",
            Self::Running => "running",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CveHostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CveHostStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unfixed" => Ok(Self::Unfixed),
            "fixed" => Ok(Self::Fixed),
            "running" => Ok(Self::Running),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("Invalid cve host status: {s}")),
        }
    }
}

/// Status of one (task, host) unit of a repo-set task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoStatus {
    Unset,
    Set,
    Running,
    Unknown,
}

impl RepoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Set => "set",
            Self::Running => "running",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RepoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepoStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unset" => Ok(Self::Unset),
            "set" => Ok(Self::Set),
            "running" => Ok(Self::Running),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("Invalid repo status: {s}")),
        }
    }
}

/// Host scan status, flipped by cve-scan tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Scanning,
    Done,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scanning => "scanning",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scanning" => Ok(Self::Scanning),
            "done" => Ok(Self::Done),
            _ => Err(format!("Invalid scan status: {s}")),
        }
    }
}

/// Aggregated status of a CVE, a host or a whole task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeed,
    Fail,
    Running,
    Unknown,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeed => "succeed",
            Self::Fail => "fail",
            Self::Running => "running",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeed | Self::Fail)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeed" => Ok(Self::Succeed),
            "fail" => Ok(Self::Fail),
            "running" => Ok(Self::Running),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

/// Outcome of one (host, step) pair as reported by the automation runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerOutcome {
    Unreachable,
    Ok,
    Failed,
}

impl RunnerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unreachable => "unreachable",
            Self::Ok => "ok",
            Self::Failed => "failed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for RunnerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunnerOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unreachable" => Ok(Self::Unreachable),
            "ok" => Ok(Self::Ok),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid runner outcome: {s}")),
        }
    }
}
