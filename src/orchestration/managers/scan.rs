//! Manager for cve-scan tasks.
//!
//! The scan step prints the CVEs that still affect installed packages;
//! `post_handle` parses them out of the step output and stores the
//! host to CVE association.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{check_items, not_prepared, ManagerContext};
use crate::cache::TaskMembership;
use crate::constants::{steps, TaskStatus};
use crate::error::{RemediationError, RemediationResult};
use crate::models::{HostInfo, HostResult, Task, TaskResultDocument, TaskType};
use crate::orchestration::callback::CveScanCallback;
use crate::orchestration::playbook::PreparedRun;
use crate::orchestration::task_manager::{reconcile_task, TaskManager};

/// CVE ids found in `yum updateinfo list cves` output, sorted and unique
pub fn parse_scan_output(output: &str) -> Vec<String> {
    output
        .lines()
        .flat_map(str::split_whitespace)
        .filter(|token| token.len() > 4 && token.starts_with("CVE-"))
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub struct CveScanManager {
    ctx: ManagerContext,
    task: Task,
    executed_at: Option<i64>,
    prepared: Option<PreparedRun>,
    membership: Option<Arc<TaskMembership>>,
    callback: Option<Arc<CveScanCallback>>,
}

impl std::fmt::Debug for CveScanManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CveScanManager")
            .field("task_id", &self.task.task_id)
            .finish_non_exhaustive()
    }
}

impl CveScanManager {
    pub fn new(ctx: ManagerContext, task: Task) -> Self {
        Self {
            ctx,
            task,
            executed_at: None,
            prepared: None,
            membership: None,
            callback: None,
        }
    }

    async fn save_scan_result(&self, host_id: i64, output: &str) {
        let cves = parse_scan_output(output);
        debug!(task_id = %self.task.task_id, host_id = host_id, found = cves.len(), "Parsed scan output");
        if let Err(e) = self.ctx.store.save_scan_result(host_id, &cves).await {
            warn!(task_id = %self.task.task_id, host_id = host_id, error = %e, "Could not save scan result");
        }
    }
}

#[async_trait]
impl TaskManager for CveScanManager {
    fn task_id(&self) -> &str {
        &self.task.task_id
    }

    fn task_type(&self) -> TaskType {
        TaskType::CveScan
    }

    async fn pre_handle(&mut self) -> RemediationResult<()> {
        let task_id = self.task.task_id.clone();
        let hosts: Vec<HostInfo> = self
            .ctx
            .store
            .get_scan_units(&task_id)
            .await?
            .into_iter()
            .map(|unit| HostInfo::new(unit.host_id, &unit.host_name, &unit.host_ip))
            .collect();
        if hosts.is_empty() {
            return Err(RemediationError::NotFound(format!(
                "scan task {task_id} has no host"
            )));
        }
        let membership = match self.ctx.cache.get(&task_id) {
            Some(hit) => hit,
            None => self.ctx.cache.put(&task_id, TaskMembership::from_hosts(&hosts)),
        };

        let now = Utc::now().timestamp();
        let host_ids: Vec<i64> = hosts.iter().map(|h| h.host_id).collect();
        self.ctx
            .store
            .init_host_scan(&host_ids, now)
            .await
            .map_err(RemediationError::on_update)?;

        if let Err(e) = self.ctx.store.update_task_execute_time(&task_id, now).await {
            warn!(task_id = %task_id, error = %e, "Could not record execution time");
        }

        let prepared = self.ctx.playbooks.cve_scan(&hosts);
        self.ctx.save_prepared(&task_id, &prepared).await;

        self.executed_at = Some(now);
        self.membership = Some(membership);
        self.prepared = Some(prepared);
        Ok(())
    }

    async fn handle(&mut self) -> RemediationResult<()> {
        let membership = self
            .membership
            .clone()
            .ok_or_else(|| not_prepared(&self.task.task_id))?;
        let callback = Arc::new(CveScanCallback::new(
            &self.task.task_id,
            membership,
            Arc::clone(&self.ctx.store),
        ));
        self.callback = Some(Arc::clone(&callback));

        let prepared = self
            .prepared
            .as_ref()
            .ok_or_else(|| not_prepared(&self.task.task_id))?;
        self.ctx.run(&self.task.task_id, prepared, callback).await
    }

    async fn post_handle(&mut self) -> RemediationResult<()> {
        let (Some(membership), Some(callback)) = (self.membership.clone(), self.callback.clone())
        else {
            return Err(not_prepared(&self.task.task_id));
        };
        let records = callback.records();

        let mut task_result = Vec::new();
        for host in membership.sorted_hosts() {
            let (check_items, _) = check_items(&records, &host.host_name);
            let scan = records.unit(&host.host_name, steps::SCAN);
            let status = match scan {
                Some(record) if record.status.is_success() => {
                    self.save_scan_result(host.host_id, &record.info).await;
                    TaskStatus::Succeed
                }
                _ => TaskStatus::Fail,
            };
            task_result.push(HostResult {
                host_id: host.host_id,
                host_name: host.host_name.clone(),
                host_ip: host.host_ip.clone(),
                status,
                check_items,
                cves: None,
                log: scan.map(|r| r.info.clone()),
            });
        }

        let document = TaskResultDocument {
            task_id: self.task.task_id.clone(),
            task_type: TaskType::CveScan,
            latest_execute_time: self.executed_at,
            task_result,
        };
        self.ctx.save_result(&document).await
    }

    async fn fault_handle(&self) -> RemediationResult<u64> {
        reconcile_task(
            self.ctx.store.as_ref(),
            &self.task.task_id,
            TaskType::CveScan,
            &[],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_output_yields_unique_cve_ids() {
        let output = "\
Last metadata expiration check: 0:01:12 ago.
CVE-2021-3711 Important/Sec. openssl-1:1.1.1f-4.oe1.x86_64
CVE-2021-3712 Moderate/Sec.  openssl-1:1.1.1f-4.oe1.x86_64
CVE-2021-3711 Important/Sec. openssl-libs-1:1.1.1f-4.oe1.x86_64
";
        assert_eq!(
            parse_scan_output(output),
            vec!["CVE-2021-3711".to_string(), "CVE-2021-3712".to_string()]
        );
        assert!(parse_scan_output("no security updates").is_empty());
    }
}
