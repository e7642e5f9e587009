//! Host records and the membership structures handed to task generation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::constants::ScanStatus;

/// Connection facts about one host, as referenced by unit rows
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostInfo {
    pub host_id: i64,
    pub host_name: String,
    pub host_ip: String,
}

impl HostInfo {
    pub fn new(host_id: i64, host_name: &str, host_ip: &str) -> Self {
        Self {
            host_id,
            host_name: host_name.to_string(),
            host_ip: host_ip.to_string(),
        }
    }
}

/// Registered host, the record a scan or repo-set mutates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub host_id: i64,
    pub host_name: String,
    pub host_ip: String,
    pub username: String,
    pub repo_name: Option<String>,
    pub scan_status: Option<ScanStatus>,
    pub last_scan: Option<i64>,
}

impl Host {
    pub fn info(&self) -> HostInfo {
        HostInfo::new(self.host_id, &self.host_name, &self.host_ip)
    }
}

/// One CVE of a fix request with the hosts it should be fixed on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CveMembership {
    pub cve_id: String,
    #[serde(default)]
    pub reboot: bool,
    #[serde(default)]
    pub packages: Vec<String>,
    pub host_info: Vec<HostInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CveFixRequest {
    pub task_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub auto_reboot: bool,
    pub info: Vec<CveMembership>,
}

impl CveFixRequest {
    /// Distinct hosts across all CVEs
    pub fn distinct_hosts(&self) -> BTreeSet<&HostInfo> {
        self.info.iter().flat_map(|c| c.host_info.iter()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CveRollbackRequest {
    pub fix_task_id: String,
    pub task_name: String,
    #[serde(default)]
    pub description: String,
    /// Empty means every eligible CVE of the fix task
    #[serde(default)]
    pub cve_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoSetRequest {
    pub task_name: String,
    #[serde(default)]
    pub description: String,
    pub repo_name: String,
    pub info: Vec<HostInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CveScanRequest {
    pub task_name: String,
    #[serde(default)]
    pub description: String,
    pub host_list: Vec<i64>,
}
