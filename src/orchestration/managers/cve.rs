//! Manager for cve-fix and cve-rollback tasks. Both run the same lifecycle;
//! only the playbook and the outcome mapping differ.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use super::{check_items, not_prepared, ManagerContext};
use crate::cache::TaskMembership;
use crate::constants::{CveHostStatus, TaskStatus};
use crate::error::{RemediationError, RemediationResult};
use crate::models::{CveHostUnit, CveResult, HostResult, Task, TaskCve, TaskResultDocument, TaskType};
use crate::orchestration::callback::{CveCallback, CveStatusMapping};
use crate::orchestration::playbook::PreparedRun;
use crate::orchestration::task_manager::{reconcile_task, TaskManager};

pub struct CveTaskManager {
    ctx: ManagerContext,
    task: Task,
    mapping: CveStatusMapping,
    cve_list: Vec<String>,
    executed_at: Option<i64>,
    prepared: Option<PreparedRun>,
    membership: Option<Arc<TaskMembership>>,
    callback: Option<Arc<CveCallback>>,
}

impl std::fmt::Debug for CveTaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CveTaskManager")
            .field("task_id", &self.task.task_id)
            .field("mapping", &self.mapping)
            .field("cve_list", &self.cve_list)
            .finish_non_exhaustive()
    }
}

impl CveTaskManager {
    pub fn new(ctx: ManagerContext, task: Task, cve_list: Vec<String>) -> Self {
        let mapping =
            CveStatusMapping::for_task_type(task.task_type).unwrap_or(CveStatusMapping::Fix);
        Self {
            ctx,
            task,
            mapping,
            cve_list,
            executed_at: None,
            prepared: None,
            membership: None,
            callback: None,
        }
    }

    fn is_targeted(&self, cve_id: &str) -> bool {
        self.cve_list.is_empty() || self.cve_list.iter().any(|c| c == cve_id)
    }

    fn build_result(&self, membership: &TaskMembership, callback: &CveCallback) -> Vec<HostResult> {
        let records = callback.records();
        let failed_status = self.mapping.failed_status();

        membership
            .sorted_hosts()
            .into_iter()
            .map(|host| {
                let (check_items, checks_passed) = check_items(&records, &host.host_name);
                let mut status = if checks_passed {
                    TaskStatus::Succeed
                } else {
                    TaskStatus::Fail
                };

                let mut cves = Vec::new();
                for cve_id in host.cves.iter().filter(|c| self.is_targeted(c)) {
                    match records.unit(&host.host_name, cve_id) {
                        Some(record) => {
                            if record.status == failed_status {
                                status = TaskStatus::Fail;
                            }
                            cves.push(CveResult {
                                cve_id: cve_id.clone(),
                                log: record.info.clone(),
                                result: record.status.as_str().to_string(),
                            });
                        }
                        None => {
                            // the runner never reached this step on the host
                            status = TaskStatus::Fail;
                            cves.push(CveResult {
                                cve_id: cve_id.clone(),
                                log: String::new(),
                                result: CveHostStatus::Unknown.as_str().to_string(),
                            });
                        }
                    }
                }

                HostResult {
                    host_id: host.host_id,
                    host_name: host.host_name.clone(),
                    host_ip: host.host_ip.clone(),
                    status,
                    check_items,
                    cves: Some(cves),
                    log: None,
                }
            })
            .collect()
    }
}

#[async_trait]
impl TaskManager for CveTaskManager {
    fn task_id(&self) -> &str {
        &self.task.task_id
    }

    fn task_type(&self) -> TaskType {
        self.mapping.task_type()
    }

    async fn pre_handle(&mut self) -> RemediationResult<()> {
        let task_id = self.task.task_id.clone();
        let cves: Vec<TaskCve> = self
            .ctx
            .store
            .get_task_cves(&task_id)
            .await?
            .into_iter()
            .filter(|c| self.is_targeted(&c.cve_id))
            .collect();
        if cves.is_empty() {
            return Err(RemediationError::NotFound(format!(
                "no targeted cve in task {task_id}"
            )));
        }

        let units = self.ctx.store.get_cve_units(&task_id).await?;
        let membership = self.ctx.cache.query_cve_info(&task_id, &units);
        let units: Vec<CveHostUnit> = units
            .into_iter()
            .filter(|u| self.is_targeted(&u.cve_id))
            .collect();

        self.ctx
            .store
            .init_cve_task(&task_id, &self.cve_list)
            .await
            .map_err(RemediationError::on_update)?;

        let now = Utc::now().timestamp();
        if let Err(e) = self.ctx.store.update_task_execute_time(&task_id, now).await {
            warn!(task_id = %task_id, error = %e, "Could not record execution time");
        }

        let prepared = match self.mapping {
            CveStatusMapping::Fix => self.ctx.playbooks.cve_fix(&cves, &units),
            CveStatusMapping::Rollback => self.ctx.playbooks.cve_rollback(&cves, &units),
        };
        if !prepared.skipped_cves.is_empty() {
            info!(task_id = %task_id, skipped = ?prepared.skipped_cves, "Some cves have no remediation step");
        }
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
        let callback = Arc::new(CveCallback::new(
            &self.task.task_id,
            self.mapping,
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
        let (Some(membership), Some(callback)) = (self.membership.as_ref(), self.callback.as_ref())
        else {
            return Err(not_prepared(&self.task.task_id));
        };
        let document = TaskResultDocument {
            task_id: self.task.task_id.clone(),
            task_type: self.task_type(),
            latest_execute_time: self.executed_at,
            task_result: self.build_result(membership, callback),
        };
        self.ctx.save_result(&document).await
    }

    async fn fault_handle(&self) -> RemediationResult<u64> {
        reconcile_task(
            self.ctx.store.as_ref(),
            &self.task.task_id,
            self.task_type(),
            &self.cve_list,
        )
        .await
    }
}
