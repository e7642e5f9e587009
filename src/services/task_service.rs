//! # Task Service
//!
//! Caller-facing operations on remediation tasks: generation, execution,
//! deletion and push-style callback delivery. Read-only views are delegated
//! to [`TaskQueryService`].
//!
//! ## Design
//!
//! ```text
//! Caller -> TaskService (validation, generation, execution) -> ProgressStore / ResultStore
//!                  \-> TaskQueryService (views)
//! ```
//!
//! Executions go through [`ExecutionDriver`]. `spawn_execution` additionally
//! supervises the spawned run so that a panic inside a manager still gets
//! its units reconciled.
//!
//! A task is claimed in-process for the whole run before its running units
//! are counted, so two concurrent executions of one task cannot both start
//! even when the store suspends between the check and `pre_handle`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cache::TaskCache;
use crate::config::TaskConfig;
use crate::constants::{CveHostStatus, RepoStatus};
use crate::database::{ProgressStore, ResultStore};
use crate::error::{Partial, RemediationError, RemediationResult};
use crate::logging::log_task_operation;
use crate::models::{
    CveFixRequest, CveHostUnit, CveRollbackRequest, CveScanRequest, HostInfo, RepoHostUnit,
    RepoSetRequest, Task, TaskCve, TaskType,
};
use crate::orchestration::callback::CallbackRegistry;
use crate::orchestration::managers::{build_manager, ManagerContext};
use crate::orchestration::playbook::PlaybookBuilder;
use crate::orchestration::runner::{PlaybookRunner, RunnerEvent};
use crate::orchestration::task_manager::{reconcile_task, ExecutionDriver, ExecutionReport};
use crate::services::task_query_service::TaskQueryService;

#[derive(Clone)]
pub struct TaskService {
    store: Arc<dyn ProgressStore>,
    results: Arc<dyn ResultStore>,
    cache: Arc<TaskCache>,
    registry: Arc<CallbackRegistry>,
    claims: Arc<DashMap<String, ()>>,
    context: ManagerContext,
    driver: ExecutionDriver,
    queries: TaskQueryService,
}

/// Exclusive right to execute one task; released on drop
#[derive(Debug)]
struct ExecutionClaim {
    claims: Arc<DashMap<String, ()>>,
    task_id: String,
}

impl Drop for ExecutionClaim {
    fn drop(&mut self) {
        self.claims.remove(&self.task_id);
    }
}

impl std::fmt::Debug for TaskService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskService")
            .field("cache", &self.cache)
            .field("registry", &self.registry)
            .field("executing", &self.claims.len())
            .finish_non_exhaustive()
    }
}

impl TaskService {
    pub fn new(
        store: Arc<dyn ProgressStore>,
        results: Arc<dyn ResultStore>,
        runner: Arc<dyn PlaybookRunner>,
        config: TaskConfig,
    ) -> Self {
        let cache = Arc::new(TaskCache::new(config.cache_capacity));
        let registry = Arc::new(CallbackRegistry::new());
        let context = ManagerContext {
            store: Arc::clone(&store),
            results: Arc::clone(&results),
            cache: Arc::clone(&cache),
            runner,
            registry: Arc::clone(&registry),
            playbooks: PlaybookBuilder::new(config),
        };
        Self {
            driver: ExecutionDriver::new(Arc::clone(&store)),
            queries: TaskQueryService::new(Arc::clone(&store), Arc::clone(&results)),
            store,
            results,
            cache,
            registry,
            claims: Arc::new(DashMap::new()),
            context,
        }
    }

    /// Read-only task views
    pub fn queries(&self) -> &TaskQueryService {
        &self.queries
    }

    pub fn cache(&self) -> &Arc<TaskCache> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }

    /// Store the result document skeleton; on failure the task row is
    /// removed again so no task exists without its document
    async fn init_artifacts(&self, task: &Task) -> RemediationResult<()> {
        if let Err(e) = self
            .results
            .init_task_artifacts(&task.task_id, &task.username)
            .await
        {
            error!(task_id = %task.task_id, error = %e, "Could not initialize task artifacts, removing task");
            if let Err(cleanup) = self
                .store
                .delete_tasks(&task.username, &[task.task_id.clone()])
                .await
            {
                error!(task_id = %task.task_id, error = %cleanup, "Could not remove half-created task");
            }
            return Err(RemediationError::on_insert(e));
        }
        log_task_operation("generate", &task.task_id, task.task_type.as_str(), "created", None);
        Ok(())
    }

    pub async fn generate_cve_task(
        &self,
        username: &str,
        request: CveFixRequest,
    ) -> RemediationResult<Task> {
        if request.info.is_empty() {
            return Err(RemediationError::Validation("no cve to fix".to_string()));
        }
        if let Some(empty) = request.info.iter().find(|c| c.host_info.is_empty()) {
            return Err(RemediationError::Validation(format!(
                "cve {} has no host",
                empty.cve_id
            )));
        }

        let mut task = Task::new(
            TaskType::CveFix,
            username,
            &request.task_name,
            &request.description,
        );
        task.auto_reboot = request.auto_reboot;
        task.host_num = request.distinct_hosts().len() as i64;
        let reboot_hosts: BTreeSet<i64> = request
            .info
            .iter()
            .filter(|c| c.reboot && request.auto_reboot)
            .flat_map(|c| c.host_info.iter().map(|h| h.host_id))
            .collect();
        task.need_reboot = reboot_hosts.len() as i64;

        let mut cves = Vec::with_capacity(request.info.len());
        let mut units = Vec::new();
        for cve in &request.info {
            cves.push(TaskCve {
                task_id: task.task_id.clone(),
                cve_id: cve.cve_id.clone(),
                reboot: cve.reboot && request.auto_reboot,
                progress: 0,
                host_num: cve.host_info.len() as i64,
                packages: cve.packages.clone(),
            });
            units.extend(cve.host_info.iter().map(|host| CveHostUnit {
                task_id: task.task_id.clone(),
                cve_id: cve.cve_id.clone(),
                host_id: host.host_id,
                host_name: host.host_name.clone(),
                host_ip: host.host_ip.clone(),
                status: CveHostStatus::Unfixed,
            }));
        }

        self
            .store
            .insert_cve_task(&task, &cves, &units)
            .await
            .map_err(RemediationError::on_insert)?;
        self.init_artifacts(&task).await?;
        Ok(task)
    }

    /// Rollback task for the eligible CVEs of a fix task. Requested CVEs
    /// that are not eligible come back as missing.
    pub async fn generate_rollback_task(
        &self,
        username: &str,
        request: CveRollbackRequest,
    ) -> RemediationResult<Partial<Task>> {
        let eligible: BTreeSet<String> = self
            .queries
            .get_rollback_cve_list(username, &request.fix_task_id)
            .await?
            .into_iter()
            .collect();
        let (targets, missing): (Vec<String>, Vec<String>) = if request.cve_list.is_empty() {
            (eligible.iter().cloned().collect(), Vec::new())
        } else {
            request
                .cve_list
                .iter()
                .cloned()
                .partition(|cve_id| eligible.contains(cve_id))
        };
        if targets.is_empty() {
            return Err(RemediationError::NotFound(format!(
                "no cve of task {} can be rolled back",
                request.fix_task_id
            )));
        }

        let fix_cves: BTreeMap<String, TaskCve> = self
            .store
            .get_task_cves(&request.fix_task_id)
            .await?
            .into_iter()
            .map(|cve| (cve.cve_id.clone(), cve))
            .collect();
        let fix_units = self.store.get_cve_units(&request.fix_task_id).await?;

        let mut task = Task::new(
            TaskType::CveRollback,
            username,
            &request.task_name,
            &request.description,
        );
        task.source_task_id = Some(request.fix_task_id.clone());

        let cves: Vec<TaskCve> = targets
            .iter()
            .filter_map(|cve_id| fix_cves.get(cve_id))
            .map(|cve| TaskCve {
                task_id: task.task_id.clone(),
                cve_id: cve.cve_id.clone(),
                reboot: false,
                progress: 0,
                host_num: cve.host_num,
                packages: cve.packages.clone(),
            })
            .collect();
        let units: Vec<CveHostUnit> = fix_units
            .into_iter()
            .filter(|unit| targets.contains(&unit.cve_id))
            .map(|unit| CveHostUnit {
                task_id: task.task_id.clone(),
                ..unit
            })
            .collect();
        task.host_num = units
            .iter()
            .map(|u| u.host_id)
            .collect::<BTreeSet<_>>()
            .len() as i64;

        self
            .store
            .insert_cve_task(&task, &cves, &units)
            .await
            .map_err(RemediationError::on_insert)?;
        self.init_artifacts(&task).await?;
        if !missing.is_empty() {
            warn!(task_id = %task.task_id, missing = ?missing, "Some cves are not eligible for rollback");
        }
        Ok(Partial::new(task, missing))
    }

    pub async fn generate_repo_task(
        &self,
        username: &str,
        request: RepoSetRequest,
    ) -> RemediationResult<Task> {
        if request.info.is_empty() {
            return Err(RemediationError::Validation("no host to set repo on".to_string()));
        }
        if request.repo_name.trim().is_empty() {
            return Err(RemediationError::Validation("repo name is empty".to_string()));
        }

        let mut task = Task::new(
            TaskType::RepoSet,
            username,
            &request.task_name,
            &request.description,
        );
        task.repo_name = Some(request.repo_name.clone());
        let hosts: BTreeSet<&HostInfo> = request.info.iter().collect();
        task.host_num = hosts.len() as i64;

        let units: Vec<RepoHostUnit> = hosts
            .into_iter()
            .map(|host| RepoHostUnit {
                task_id: task.task_id.clone(),
                repo_name: request.repo_name.clone(),
                host_id: host.host_id,
                host_name: host.host_name.clone(),
                host_ip: host.host_ip.clone(),
                status: RepoStatus::Unset,
            })
            .collect();

        self
            .store
            .insert_repo_task(&task, &units)
            .await
            .map_err(RemediationError::on_insert)?;
        self.init_artifacts(&task).await?;
        Ok(task)
    }

    /// Scan task over the caller's hosts; unknown host ids come back as
    /// missing
    pub async fn generate_scan_task(
        &self,
        username: &str,
        request: CveScanRequest,
    ) -> RemediationResult<Partial<Task>> {
        let hosts: Vec<HostInfo> = self
            .store
            .get_hosts(username, &request.host_list)
            .await?
            .iter()
            .map(|host| host.info())
            .collect();
        if hosts.is_empty() {
            return Err(RemediationError::NotFound(format!(
                "hosts {:?}",
                request.host_list
            )));
        }
        let found: BTreeSet<i64> = hosts.iter().map(|h| h.host_id).collect();
        let missing: Vec<String> = request
            .host_list
            .iter()
            .filter(|id| !found.contains(id))
            .map(i64::to_string)
            .collect();

        let mut task = Task::new(
            TaskType::CveScan,
            username,
            &request.task_name,
            &request.description,
        );
        task.host_num = hosts.len() as i64;

        self
            .store
            .insert_scan_task(&task, &hosts)
            .await
            .map_err(RemediationError::on_insert)?;
        self.init_artifacts(&task).await?;
        Ok(Partial::new(task, missing))
    }

    /// `TaskIsRunning` while any unit of the task is still running
    pub async fn check_task_status(&self, task: &Task) -> RemediationResult<()> {
        let running = self
            .store
            .count_running_units(&task.task_id, task.task_type.unit_kind())
            .await?;
        if running > 0 {
            return Err(RemediationError::TaskIsRunning(task.task_id.clone()));
        }
        Ok(())
    }

    /// Whether this service currently has an execution of `task_id` in flight
    pub fn is_executing(&self, task_id: &str) -> bool {
        self.claims.contains_key(task_id)
    }

    fn claim(&self, task_id: &str) -> RemediationResult<ExecutionClaim> {
        match self.claims.entry(task_id.to_string()) {
            Entry::Occupied(_) => Err(RemediationError::TaskIsRunning(task_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(ExecutionClaim {
                    claims: Arc::clone(&self.claims),
                    task_id: task_id.to_string(),
                })
            }
        }
    }

    /// Claim first, then check the store, so the claim covers the window
    /// between counting running units and `pre_handle` marking them
    async fn executable_task(
        &self,
        username: &str,
        task_id: &str,
    ) -> RemediationResult<(Task, ExecutionClaim)> {
        let task = self.queries.owned_task(username, task_id).await?;
        let claim = self.claim(&task.task_id)?;
        self.check_task_status(&task).await?;
        Ok((task, claim))
    }

    /// Execute a task to completion. `cve_list` narrows a CVE task to some
    /// of its CVEs; empty means all.
    pub async fn execute_task(
        &self,
        username: &str,
        task_id: &str,
        cve_list: Vec<String>,
    ) -> RemediationResult<ExecutionReport> {
        let (task, _claim) = self.executable_task(username, task_id).await?;
        let mut manager = build_manager(self.context.clone(), task, cve_list);
        self.driver.execute(manager.as_mut()).await
    }

    /// Execute on a background task. If the run panics or is aborted the
    /// supervisor reconciles the task's units the way fault handling would.
    pub async fn spawn_execution(
        &self,
        username: &str,
        task_id: &str,
        cve_list: Vec<String>,
    ) -> RemediationResult<JoinHandle<RemediationResult<ExecutionReport>>> {
        let (task, claim) = self.executable_task(username, task_id).await?;
        let task_type = task.task_type;
        let task_id = task.task_id.clone();
        let reconcile_list = cve_list.clone();

        let mut manager = build_manager(self.context.clone(), task, cve_list);
        let driver = self.driver.clone();
        let run = tokio::spawn(async move { driver.execute(manager.as_mut()).await });

        let store = Arc::clone(&self.store);
        Ok(tokio::spawn(async move {
            // held until reconciliation is done
            let _claim = claim;
            match run.await {
                Ok(result) => result,
                Err(join_error) => {
                    error!(task_id = %task_id, error = %join_error, "Execution aborted, reconciling units");
                    if let Err(e) =
                        reconcile_task(store.as_ref(), &task_id, task_type, &reconcile_list).await
                    {
                        error!(task_id = %task_id, error = %e, "Reconciliation after abort failed");
                    }
                    Err(RemediationError::Runner(format!(
                        "execution of task {task_id} aborted: {join_error}"
                    )))
                }
            }
        }))
    }

    /// Delete tasks with their units and result documents. Ids that do not
    /// exist or belong to someone else come back as missing.
    pub async fn delete_task(
        &self,
        username: &str,
        task_ids: &[String],
    ) -> RemediationResult<Partial<Vec<String>>> {
        let deleted = self
            .store
            .delete_tasks(username, task_ids)
            .await
            .map_err(RemediationError::on_update)?;
        if deleted.is_empty() {
            return Err(RemediationError::NotFound(format!("tasks {task_ids:?}")));
        }
        if let Err(e) = self.results.delete_task_artifacts(&deleted).await {
            warn!(error = %e, "Could not delete result documents of deleted tasks");
        }
        for task_id in &deleted {
            self.cache.remove(task_id);
        }
        let missing: Vec<String> = task_ids
            .iter()
            .filter(|id| !deleted.contains(id))
            .cloned()
            .collect();
        info!(deleted = deleted.len(), missing = missing.len(), "Deleted tasks");
        Ok(Partial::new(deleted, missing))
    }

    /// Route an event posted back by a remote runner to the live handler
    pub async fn receive_callback(&self, task_id: &str, event: RunnerEvent) -> RemediationResult<()> {
        self.registry.deliver(task_id, &event).await
    }
}
