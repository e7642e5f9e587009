//! # Task Result Document
//!
//! The execution artifact of a task: playbook text, inventory text and the
//! structured log written by `post_handle`. Stored as a whole document,
//! replaced on every execution.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::constants::TaskStatus;
use crate::models::task::TaskType;

/// Stored artifacts of one task. `log` holds a serialized [`TaskResultDocument`]
/// or an empty string before the first execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskArtifacts {
    pub task_id: String,
    pub username: String,
    pub playbook: String,
    pub inventory: String,
    pub log: String,
}

/// Partial update of [`TaskArtifacts`]; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactsUpdate {
    pub playbook: Option<String>,
    pub inventory: Option<String>,
    pub log: Option<String>,
}

impl ArtifactsUpdate {
    pub fn is_empty(&self) -> bool {
        self.playbook.is_none() && self.inventory.is_none() && self.log.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Playbook,
    Inventory,
    Log,
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "playbook" => Ok(Self::Playbook),
            "inventory" => Ok(Self::Inventory),
            "log" => Ok(Self::Log),
            _ => Err(format!("Invalid artifact kind: {s}")),
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Playbook => write!(f, "playbook"),
            Self::Inventory => write!(f, "inventory"),
            Self::Log => write!(f, "log"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckItemResult {
    pub item: String,
    pub result: bool,
}

/// Outcome of one CVE on one host. `result` is the unit status string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CveResult {
    pub cve_id: String,
    pub log: String,
    pub result: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostResult {
    pub host_id: i64,
    pub host_name: String,
    pub host_ip: String,
    /// `succeed` or `fail`
    pub status: TaskStatus,
    pub check_items: Vec<CheckItemResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cves: Option<Vec<CveResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResultDocument {
    pub task_id: String,
    pub task_type: TaskType,
    pub latest_execute_time: Option<i64>,
    pub task_result: Vec<HostResult>,
}

impl TaskResultDocument {
    /// Keep only the listed CVEs; hosts left with no CVE are dropped.
    /// An empty list keeps everything.
    pub fn retain_cves(&mut self, cve_list: &[String]) {
        if cve_list.is_empty() {
            return;
        }
        self.task_result.retain_mut(|host| match host.cves.as_mut() {
            Some(cves) => {
                cves.retain(|c| cve_list.contains(&c.cve_id));
                !cves.is_empty()
            }
            None => false,
        });
    }

    /// Keep only the listed hosts. An empty list keeps everything.
    pub fn retain_hosts(&mut self, host_list: &[i64]) {
        if host_list.is_empty() {
            return;
        }
        self.task_result
            .retain(|host| host_list.contains(&host.host_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(id: i64, cves: &[&str]) -> HostResult {
        HostResult {
            host_id: id,
            host_name: format!("h{id}"),
            host_ip: format!("10.0.0.{id}"),
            status: TaskStatus::Succeed,
            check_items: vec![],
            cves: Some(
                cves.iter()
                    .map(|c| CveResult {
                        cve_id: c.to_string(),
                        log: String::new(),
                        result: "fixed".into(),
                    })
                    .collect(),
            ),
            log: None,
        }
    }

    #[test]
    fn cve_filter_drops_hosts_without_matches() {
        let mut doc = TaskResultDocument {
            task_id: "t".into(),
            task_type: TaskType::CveFix,
            latest_execute_time: None,
            task_result: vec![host(1, &["cve-1", "cve-2"]), host(2, &["cve-2"])],
        };
        doc.retain_cves(&["cve-1".to_string()]);
        assert_eq!(doc.task_result.len(), 1);
        assert_eq!(doc.task_result[0].host_id, 1);
        assert_eq!(doc.task_result[0].cves.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn repo_results_serialize_log_instead_of_cves() {
        let result = HostResult {
            host_id: 1,
            host_name: "h1".into(),
            host_ip: "10.0.0.1".into(),
            status: TaskStatus::Fail,
            check_items: vec![CheckItemResult {
                item: "network".into(),
                result: false,
            }],
            cves: None,
            log: Some("timeout".into()),
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "fail");
        assert_eq!(value["log"], "timeout");
        assert!(value.get("cves").is_none());
    }
}
