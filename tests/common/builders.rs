//! Fixture builders for task generation and service wiring.

#![allow(dead_code)]

use std::sync::Arc;

use remediation_core::config::TaskConfig;
use remediation_core::constants::RunnerOutcome;
use remediation_core::models::{
    CveFixRequest, CveMembership, CveRollbackRequest, CveScanRequest, Host, HostInfo,
    RepoSetRequest,
};
use remediation_core::orchestration::{PlaybookRunner, RunnerEvent};
use remediation_core::{InMemoryStore, ProgressStore, TaskService};

use super::runners::ScriptedRunner;
use super::unique_name;

pub const USER: &str = "admin";

/// Host `id` named `h{id}`
pub fn host(id: i64) -> HostInfo {
    HostInfo::new(id, &format!("h{id}"), &format!("10.0.0.{id}"))
}

pub async fn register_hosts(store: &InMemoryStore, username: &str, ids: &[i64]) {
    for &id in ids {
        let info = host(id);
        store
            .upsert_host(Host {
                host_id: info.host_id,
                host_name: info.host_name,
                host_ip: info.host_ip,
                username: username.to_string(),
                repo_name: None,
                scan_status: None,
                last_scan: None,
            })
            .await
            .expect("Failed to register test host");
    }
}

pub fn ok(host: &str, step: &str) -> RunnerEvent {
    RunnerEvent::new(host, step, RunnerOutcome::Ok).with_stdout("done")
}

pub fn failed(host: &str, step: &str) -> RunnerEvent {
    RunnerEvent::new(host, step, RunnerOutcome::Failed).with_stderr("command failed")
}

pub fn unreachable(host: &str, step: &str) -> RunnerEvent {
    RunnerEvent::new(host, step, RunnerOutcome::Unreachable).with_msg("ssh: connect timed out")
}

/// Builder for cve-fix requests
pub struct CveFixRequestBuilder {
    task_name: Option<String>,
    auto_reboot: bool,
    info: Vec<CveMembership>,
}

impl CveFixRequestBuilder {
    pub fn new() -> Self {
        Self {
            task_name: None,
            auto_reboot: false,
            info: Vec::new(),
        }
    }

    pub fn with_cve(mut self, cve_id: &str, host_ids: &[i64]) -> Self {
        self.info.push(CveMembership {
            cve_id: cve_id.to_string(),
            reboot: false,
            packages: vec![format!("{}-pkg", cve_id.to_lowercase())],
            host_info: host_ids.iter().map(|&id| host(id)).collect(),
        });
        self
    }

    pub fn with_reboot_cve(mut self, cve_id: &str, host_ids: &[i64]) -> Self {
        self = self.with_cve(cve_id, host_ids);
        if let Some(last) = self.info.last_mut() {
            last.reboot = true;
        }
        self
    }

    pub fn auto_reboot(mut self, auto_reboot: bool) -> Self {
        self.auto_reboot = auto_reboot;
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.task_name = Some(name.to_string());
        self
    }

    pub fn build(self) -> CveFixRequest {
        CveFixRequest {
            task_name: self.task_name.unwrap_or_else(|| unique_name("fix")),
            description: "fix cves".to_string(),
            auto_reboot: self.auto_reboot,
            info: self.info,
        }
    }
}

impl Default for CveFixRequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub fn rollback_request(fix_task_id: &str, cve_list: &[&str]) -> CveRollbackRequest {
    CveRollbackRequest {
        fix_task_id: fix_task_id.to_string(),
        task_name: unique_name("rollback"),
        description: "rollback cves".to_string(),
        cve_list: cve_list.iter().map(|c| c.to_string()).collect(),
    }
}

pub fn repo_request(repo_name: &str, host_ids: &[i64]) -> RepoSetRequest {
    RepoSetRequest {
        task_name: unique_name("repo"),
        description: "set repo".to_string(),
        repo_name: repo_name.to_string(),
        info: host_ids.iter().map(|&id| host(id)).collect(),
    }
}

pub fn scan_request(host_ids: &[i64]) -> CveScanRequest {
    CveScanRequest {
        task_name: unique_name("scan"),
        description: "scan hosts".to_string(),
        host_list: host_ids.to_vec(),
    }
}

/// Service over an in-memory store and a scripted runner
pub struct Harness {
    pub service: TaskService,
    pub store: Arc<InMemoryStore>,
    pub runner: Arc<ScriptedRunner>,
}

impl Harness {
    pub fn new(events: Vec<RunnerEvent>) -> Self {
        Self::with_runner(Arc::new(ScriptedRunner::new(events)))
    }

    pub fn with_runner(runner: Arc<ScriptedRunner>) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let service = service_over(&store, runner.clone());
        Self {
            service,
            store,
            runner,
        }
    }
}

/// Service over `store` with any runner
pub fn service_over(store: &Arc<InMemoryStore>, runner: Arc<dyn PlaybookRunner>) -> TaskService {
    TaskService::new(store.clone(), store.clone(), runner, TaskConfig::default())
}
