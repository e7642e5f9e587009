use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;

use super::{check_items, not_prepared, ManagerContext};
use crate::cache::TaskMembership;
use crate::constants::{steps, RepoStatus, TaskStatus};
use crate::error::{RemediationError, RemediationResult};
use crate::models::{HostResult, Task, TaskResultDocument, TaskType};
use crate::orchestration::callback::RepoSetCallback;
use crate::orchestration::playbook::PreparedRun;
use crate::orchestration::task_manager::{reconcile_task, TaskManager};

/// Manager for repo-set tasks
pub struct RepoSetManager {
    ctx: ManagerContext,
    task: Task,
    executed_at: Option<i64>,
    prepared: Option<PreparedRun>,
    membership: Option<Arc<TaskMembership>>,
    callback: Option<Arc<RepoSetCallback>>,
}

impl std::fmt::Debug for RepoSetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoSetManager")
            .field("task_id", &self.task.task_id)
            .field("repo_name", &self.task.repo_name)
            .finish_non_exhaustive()
    }
}

impl RepoSetManager {
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

    fn build_result(membership: &TaskMembership, callback: &RepoSetCallback) -> Vec<HostResult> {
        let records = callback.records();
        membership
            .sorted_hosts()
            .into_iter()
            .map(|host| {
                let (check_items, checks_passed) = check_items(&records, &host.host_name);
                let set_repo = records.unit(&host.host_name, steps::SET_REPO);
                let repo_set = set_repo.is_some_and(|r| r.status == RepoStatus::Set);
                let status = if checks_passed && repo_set {
                    TaskStatus::Succeed
                } else {
                    TaskStatus::Fail
                };
                HostResult {
                    host_id: host.host_id,
                    host_name: host.host_name.clone(),
                    host_ip: host.host_ip.clone(),
                    status,
                    check_items,
                    cves: None,
                    log: Some(set_repo.map(|r| r.info.clone()).unwrap_or_default()),
                }
            })
            .collect()
    }
}

#[async_trait]
impl TaskManager for RepoSetManager {
    fn task_id(&self) -> &str {
        &self.task.task_id
    }

    fn task_type(&self) -> TaskType {
        TaskType::RepoSet
    }

    async fn pre_handle(&mut self) -> RemediationResult<()> {
        let task_id = self.task.task_id.clone();
        let units = self.ctx.store.get_repo_units(&task_id).await?;
        let repo_name = self
            .task
            .repo_name
            .clone()
            .or_else(|| units.first().map(|u| u.repo_name.clone()))
            .ok_or_else(|| {
                RemediationError::Validation(format!("repo-set task {task_id} names no repo"))
            })?;
        let membership = self.ctx.cache.query_repo_info(&task_id, &units);

        self.ctx
            .store
            .set_repo_status(&task_id, &[], RepoStatus::Running)
            .await
            .map_err(RemediationError::on_update)?;

        let now = Utc::now().timestamp();
        if let Err(e) = self.ctx.store.update_task_execute_time(&task_id, now).await {
            warn!(task_id = %task_id, error = %e, "Could not record execution time");
        }

        let prepared = self
            .ctx
            .playbooks
            .repo_set(&self.task.username, &repo_name, &units);
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
        let callback = Arc::new(RepoSetCallback::new(
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
        let (Some(membership), Some(callback)) = (self.membership.as_ref(), self.callback.as_ref())
        else {
            return Err(not_prepared(&self.task.task_id));
        };
        let document = TaskResultDocument {
            task_id: self.task.task_id.clone(),
            task_type: TaskType::RepoSet,
            latest_execute_time: self.executed_at,
            task_result: Self::build_result(membership, callback),
        };
        self.ctx.save_result(&document).await
    }

    async fn fault_handle(&self) -> RemediationResult<u64> {
        reconcile_task(
            self.ctx.store.as_ref(),
            &self.task.task_id,
            TaskType::RepoSet,
            &[],
        )
        .await
    }
}
