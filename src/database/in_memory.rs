//! # In-Memory Store
//!
//! `ProgressStore` and `ResultStore` over plain maps behind one
//! `parking_lot::RwLock`. Every mutating call holds the write lock for its
//! whole body, which gives the same all-or-nothing behaviour the PostgreSQL
//! backend gets from a transaction.
//!
//! Used by embedded deployments and by the test suites. Individual
//! operations can be made to fail with [`InMemoryStore::fail_operation`].
//!
//! ```rust
//! use remediation_core::database::{InMemoryStore, ProgressStore};
//! use remediation_core::models::UnitKind;
//!
//! # tokio_test::block_on(async {
//! let store = InMemoryStore::new();
//! store.fail_operation("running_tasks");
//! assert!(store.running_tasks().await.is_err());
//!
//! store.clear_faults();
//! assert!(store.running_tasks().await.unwrap().is_empty());
//! assert_eq!(store.count_running_units("absent", UnitKind::Cve).await.unwrap(), 0);
//! # });
//! ```

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use super::progress_store::{ProgressMode, ProgressStore, ResultStore, StoreError, StoreResult};
use crate::constants::{CveHostStatus, RepoStatus, ScanStatus};
use crate::models::{
    ArtifactsUpdate, CveHostUnit, Host, HostInfo, RepoHostUnit, ScanHostUnit, Task,
    TaskArtifacts, TaskCve, UnitKind,
};

#[derive(Debug, Default)]
struct Tables {
    hosts: BTreeMap<i64, Host>,
    host_cves: HashMap<i64, Vec<String>>,
    tasks: HashMap<String, Task>,
    task_cves: BTreeMap<(String, String), TaskCve>,
    cve_units: BTreeMap<(String, String, i64), CveHostUnit>,
    repo_units: BTreeMap<(String, i64), RepoHostUnit>,
    scan_hosts: BTreeMap<(String, i64), HostInfo>,
    artifacts: HashMap<String, TaskArtifacts>,
}

impl Tables {
    fn task_has_running_units(&self, task: &Task) -> bool {
        match task.task_type.unit_kind() {
            UnitKind::Cve => self
                .cve_units
                .values()
                .any(|u| u.task_id == task.task_id && u.status == CveHostStatus::Running),
            UnitKind::Repo => self
                .repo_units
                .values()
                .any(|u| u.task_id == task.task_id && u.status == RepoStatus::Running),
            UnitKind::Scan => self.scan_hosts.keys().any(|(task_id, host_id)| {
                task_id == &task.task_id
                    && self
                        .hosts
                        .get(host_id)
                        .is_some_and(|h| h.scan_status == Some(ScanStatus::Scanning))
            }),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    faults: Mutex<HashSet<&'static str>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later call of `operation` fail with a database error
    pub fn fail_operation(&self, operation: &'static str) {
        self.faults.lock().insert(operation);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    fn check_fault(&self, operation: &'static str) -> StoreResult<()> {
        if self.faults.lock().contains(operation) {
            debug!(operation = operation, "Injected store fault");
            return Err(StoreError::Database(format!(
                "injected failure in {operation}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for InMemoryStore {
    async fn upsert_host(&self, host: Host) -> StoreResult<()> {
        self.check_fault("upsert_host")?;
        self.tables.write().hosts.insert(host.host_id, host);
        Ok(())
    }

    async fn get_hosts(&self, username: &str, host_ids: &[i64]) -> StoreResult<Vec<Host>> {
        self.check_fault("get_hosts")?;
        let tables = self.tables.read();
        Ok(host_ids
            .iter()
            .filter_map(|id| tables.hosts.get(id))
            .filter(|h| h.username == username)
            .map(|h| (h.host_id, h.clone()))
            .collect::<BTreeMap<i64, Host>>()
            .into_values()
            .collect())
    }

    async fn insert_cve_task(
        &self,
        task: &Task,
        cves: &[TaskCve],
        units: &[CveHostUnit],
    ) -> StoreResult<()> {
        self.check_fault("insert_cve_task")?;
        let mut tables = self.tables.write();
        tables.tasks.insert(task.task_id.clone(), task.clone());
        for cve in cves {
            tables
                .task_cves
                .insert((cve.task_id.clone(), cve.cve_id.clone()), cve.clone());
        }
        for unit in units {
            tables.cve_units.insert(
                (unit.task_id.clone(), unit.cve_id.clone(), unit.host_id),
                unit.clone(),
            );
        }
        Ok(())
    }

    async fn insert_repo_task(&self, task: &Task, units: &[RepoHostUnit]) -> StoreResult<()> {
        self.check_fault("insert_repo_task")?;
        let mut tables = self.tables.write();
        tables.tasks.insert(task.task_id.clone(), task.clone());
        for unit in units {
            tables
                .repo_units
                .insert((unit.task_id.clone(), unit.host_id), unit.clone());
        }
        Ok(())
    }

    async fn insert_scan_task(&self, task: &Task, hosts: &[HostInfo]) -> StoreResult<()> {
        self.check_fault("insert_scan_task")?;
        let mut tables = self.tables.write();
        tables.tasks.insert(task.task_id.clone(), task.clone());
        for host in hosts {
            tables
                .scan_hosts
                .insert((task.task_id.clone(), host.host_id), host.clone());
        }
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> StoreResult<Option<Task>> {
        self.check_fault("get_task")?;
        Ok(self.tables.read().tasks.get(task_id).cloned())
    }

    async fn list_tasks(&self, username: &str) -> StoreResult<Vec<Task>> {
        self.check_fault("list_tasks")?;
        let mut tasks: Vec<Task> = self
            .tables
            .read()
            .tasks
            .values()
            .filter(|t| t.username == username)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.create_time.cmp(&b.create_time).then(a.task_id.cmp(&b.task_id)));
        Ok(tasks)
    }

    async fn delete_tasks(&self, username: &str, task_ids: &[String]) -> StoreResult<Vec<String>> {
        self.check_fault("delete_tasks")?;
        let mut tables = self.tables.write();
        let deleted: Vec<String> = task_ids
            .iter()
            .filter(|id| tables.tasks.get(*id).is_some_and(|t| t.username == username))
            .cloned()
            .collect();
        for task_id in &deleted {
            tables.tasks.remove(task_id);
            tables.task_cves.retain(|(t, _), _| t != task_id);
            tables.cve_units.retain(|(t, _, _), _| t != task_id);
            tables.repo_units.retain(|(t, _), _| t != task_id);
            tables.scan_hosts.retain(|(t, _), _| t != task_id);
        }
        Ok(deleted)
    }

    async fn update_task_execute_time(&self, task_id: &str, executed_at: i64) -> StoreResult<()> {
        self.check_fault("update_task_execute_time")?;
        let mut tables = self.tables.write();
        let task = tables
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))?;
        task.latest_execute_time = Some(executed_at);
        Ok(())
    }

    async fn running_tasks(&self) -> StoreResult<Vec<Task>> {
        self.check_fault("running_tasks")?;
        let tables = self.tables.read();
        let mut tasks: Vec<Task> = tables
            .tasks
            .values()
            .filter(|t| tables.task_has_running_units(t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(tasks)
    }

    async fn get_task_cves(&self, task_id: &str) -> StoreResult<Vec<TaskCve>> {
        self.check_fault("get_task_cves")?;
        Ok(self
            .tables
            .read()
            .task_cves
            .values()
            .filter(|c| c.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn get_cve_units(&self, task_id: &str) -> StoreResult<Vec<CveHostUnit>> {
        self.check_fault("get_cve_units")?;
        Ok(self
            .tables
            .read()
            .cve_units
            .values()
            .filter(|u| u.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn get_repo_units(&self, task_id: &str) -> StoreResult<Vec<RepoHostUnit>> {
        self.check_fault("get_repo_units")?;
        Ok(self
            .tables
            .read()
            .repo_units
            .values()
            .filter(|u| u.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn get_scan_units(&self, task_id: &str) -> StoreResult<Vec<ScanHostUnit>> {
        self.check_fault("get_scan_units")?;
        let tables = self.tables.read();
        Ok(tables
            .scan_hosts
            .iter()
            .filter(|((t, _), _)| t == task_id)
            .map(|((t, host_id), info)| ScanHostUnit {
                task_id: t.clone(),
                host_id: *host_id,
                host_name: info.host_name.clone(),
                host_ip: info.host_ip.clone(),
                status: tables.hosts.get(host_id).and_then(|h| h.scan_status),
            })
            .collect())
    }

    async fn init_cve_task(&self, task_id: &str, cve_list: &[String]) -> StoreResult<()> {
        self.check_fault("init_cve_task")?;
        let mut tables = self.tables.write();
        let targeted = |cve_id: &String| cve_list.is_empty() || cve_list.contains(cve_id);
        for unit in tables.cve_units.values_mut() {
            if unit.task_id == task_id && targeted(&unit.cve_id) {
                unit.status = CveHostStatus::Running;
            }
        }
        for cve in tables.task_cves.values_mut() {
            if cve.task_id == task_id && targeted(&cve.cve_id) {
                cve.progress = 0;
            }
        }
        Ok(())
    }

    async fn update_cve_status(
        &self,
        task_id: &str,
        cve_id: &str,
        host_id: i64,
        status: CveHostStatus,
    ) -> StoreResult<()> {
        self.check_fault("update_cve_status")?;
        let mut tables = self.tables.write();
        let unit = tables
            .cve_units
            .get_mut(&(task_id.to_string(), cve_id.to_string(), host_id))
            .ok_or_else(|| {
                StoreError::NotFound(format!("unit ({task_id}, {cve_id}, {host_id})"))
            })?;
        unit.status = status;
        Ok(())
    }

    async fn set_cve_progress(
        &self,
        task_id: &str,
        cve_list: &[String],
        mode: ProgressMode,
    ) -> StoreResult<()> {
        self.check_fault("set_cve_progress")?;
        let mut tables = self.tables.write();
        for cve in tables.task_cves.values_mut() {
            if cve.task_id == task_id && (cve_list.is_empty() || cve_list.contains(&cve.cve_id)) {
                cve.progress = mode.apply(cve.progress, cve.host_num);
            }
        }
        Ok(())
    }

    async fn set_repo_status(
        &self,
        task_id: &str,
        host_ids: &[i64],
        status: RepoStatus,
    ) -> StoreResult<()> {
        self.check_fault("set_repo_status")?;
        let mut tables = self.tables.write();
        let mut touched = 0;
        for unit in tables.repo_units.values_mut() {
            if unit.task_id == task_id && (host_ids.is_empty() || host_ids.contains(&unit.host_id))
            {
                unit.status = status;
                touched += 1;
            }
        }
        if touched == 0 {
            return Err(StoreError::NotFound(format!("repo units of task {task_id}")));
        }
        Ok(())
    }

    async fn set_host_repo(&self, repo_name: &str, host_ids: &[i64]) -> StoreResult<()> {
        self.check_fault("set_host_repo")?;
        let mut tables = self.tables.write();
        for host_id in host_ids {
            if let Some(host) = tables.hosts.get_mut(host_id) {
                host.repo_name = Some(repo_name.to_string());
            }
        }
        Ok(())
    }

    async fn init_host_scan(&self, host_ids: &[i64], scanned_at: i64) -> StoreResult<()> {
        self.check_fault("init_host_scan")?;
        let mut tables = self.tables.write();
        let missing: Vec<String> = host_ids
            .iter()
            .filter(|id| !tables.hosts.contains_key(id))
            .map(|id| id.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(StoreError::NotFound(format!("hosts {}", missing.join(","))));
        }
        for host_id in host_ids {
            if let Some(host) = tables.hosts.get_mut(host_id) {
                host.scan_status = Some(ScanStatus::Scanning);
                host.last_scan = Some(scanned_at);
            }
        }
        Ok(())
    }

    async fn update_scan_status(&self, host_ids: &[i64]) -> StoreResult<()> {
        self.check_fault("update_scan_status")?;
        let mut tables = self.tables.write();
        for host_id in host_ids {
            if let Some(host) = tables.hosts.get_mut(host_id) {
                host.scan_status = Some(ScanStatus::Done);
            }
        }
        Ok(())
    }

    async fn save_scan_result(&self, host_id: i64, cves: &[String]) -> StoreResult<()> {
        self.check_fault("save_scan_result")?;
        self.tables.write().host_cves.insert(host_id, cves.to_vec());
        Ok(())
    }

    async fn get_host_cves(&self, host_id: i64) -> StoreResult<Vec<String>> {
        self.check_fault("get_host_cves")?;
        Ok(self
            .tables
            .read()
            .host_cves
            .get(&host_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fix_task_status(&self, task_id: &str, kind: UnitKind) -> StoreResult<u64> {
        self.check_fault("fix_task_status")?;
        let mut tables = self.tables.write();
        let mut changed = 0u64;
        match kind {
            UnitKind::Cve => {
                for unit in tables.cve_units.values_mut() {
                    if unit.task_id == task_id && unit.status == CveHostStatus::Running {
                        unit.status = CveHostStatus::Unknown;
                        changed += 1;
                    }
                }
            }
            UnitKind::Repo => {
                for unit in tables.repo_units.values_mut() {
                    if unit.task_id == task_id && unit.status == RepoStatus::Running {
                        unit.status = RepoStatus::Unknown;
                        changed += 1;
                    }
                }
            }
            UnitKind::Scan => {
                let host_ids: Vec<i64> = tables
                    .scan_hosts
                    .keys()
                    .filter(|(t, _)| t == task_id)
                    .map(|(_, host_id)| *host_id)
                    .collect();
                for host_id in host_ids {
                    if let Some(host) = tables.hosts.get_mut(&host_id) {
                        if host.scan_status == Some(ScanStatus::Scanning) {
                            host.scan_status = Some(ScanStatus::Done);
                            changed += 1;
                        }
                    }
                }
            }
        }
        Ok(changed)
    }

    async fn count_running_units(&self, task_id: &str, kind: UnitKind) -> StoreResult<u64> {
        self.check_fault("count_running_units")?;
        let tables = self.tables.read();
        let count = match kind {
            UnitKind::Cve => tables
                .cve_units
                .values()
                .filter(|u| u.task_id == task_id && u.status == CveHostStatus::Running)
                .count(),
            UnitKind::Repo => tables
                .repo_units
                .values()
                .filter(|u| u.task_id == task_id && u.status == RepoStatus::Running)
                .count(),
            UnitKind::Scan => tables
                .scan_hosts
                .keys()
                .filter(|(t, host_id)| {
                    t == task_id
                        && tables
                            .hosts
                            .get(host_id)
                            .is_some_and(|h| h.scan_status == Some(ScanStatus::Scanning))
                })
                .count(),
        };
        Ok(count as u64)
    }
}

#[async_trait]
impl ResultStore for InMemoryStore {
    async fn init_task_artifacts(&self, task_id: &str, username: &str) -> StoreResult<()> {
        self.check_fault("init_task_artifacts")?;
        self.tables.write().artifacts.insert(
            task_id.to_string(),
            TaskArtifacts {
                task_id: task_id.to_string(),
                username: username.to_string(),
                ..TaskArtifacts::default()
            },
        );
        Ok(())
    }

    async fn save_task_artifacts(&self, task_id: &str, update: ArtifactsUpdate) -> StoreResult<()> {
        self.check_fault("save_task_artifacts")?;
        let mut tables = self.tables.write();
        let doc = tables
            .artifacts
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(format!("result document of task {task_id}")))?;
        if let Some(playbook) = update.playbook {
            doc.playbook = playbook;
        }
        if let Some(inventory) = update.inventory {
            doc.inventory = inventory;
        }
        if let Some(log) = update.log {
            doc.log = log;
        }
        Ok(())
    }

    async fn get_task_artifacts(&self, task_id: &str) -> StoreResult<Option<TaskArtifacts>> {
        self.check_fault("get_task_artifacts")?;
        Ok(self.tables.read().artifacts.get(task_id).cloned())
    }

    async fn delete_task_artifacts(&self, task_ids: &[String]) -> StoreResult<()> {
        self.check_fault("delete_task_artifacts")?;
        let mut tables = self.tables.write();
        for task_id in task_ids {
            tables.artifacts.remove(task_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskType;

    fn unit(task_id: &str, cve: &str, host_id: i64) -> CveHostUnit {
        CveHostUnit {
            task_id: task_id.into(),
            cve_id: cve.into(),
            host_id,
            host_name: format!("h{host_id}"),
            host_ip: format!("10.0.0.{host_id}"),
            status: CveHostStatus::Unfixed,
        }
    }

    async fn seeded() -> (InMemoryStore, Task) {
        let store = InMemoryStore::new();
        let mut task = Task::new(TaskType::CveFix, "admin", "fix", "");
        task.host_num = 2;
        let cve = TaskCve {
            task_id: task.task_id.clone(),
            cve_id: "cve-1".into(),
            reboot: false,
            progress: 0,
            host_num: 2,
            packages: vec![],
        };
        store
            .insert_cve_task(
                &task,
                &[cve],
                &[unit(&task.task_id, "cve-1", 1), unit(&task.task_id, "cve-1", 2)],
            )
            .await
            .unwrap();
        (store, task)
    }

    #[tokio::test]
    async fn update_of_missing_unit_is_not_found() {
        let (store, task) = seeded().await;
        let err = store
            .update_cve_status(&task.task_id, "cve-9", 1, CveHostStatus::Fixed)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn progress_is_capped_and_resettable() {
        let (store, task) = seeded().await;
        for _ in 0..5 {
            store
                .set_cve_progress(&task.task_id, &[], ProgressMode::Add)
                .await
                .unwrap();
        }
        assert_eq!(store.get_task_cves(&task.task_id).await.unwrap()[0].progress, 2);

        store.init_cve_task(&task.task_id, &[]).await.unwrap();
        let cves = store.get_task_cves(&task.task_id).await.unwrap();
        assert_eq!(cves[0].progress, 0);
        assert_eq!(
            store.count_running_units(&task.task_id, UnitKind::Cve).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn fix_task_status_only_touches_running_units() {
        let (store, task) = seeded().await;
        store.init_cve_task(&task.task_id, &[]).await.unwrap();
        store
            .update_cve_status(&task.task_id, "cve-1", 1, CveHostStatus::Fixed)
            .await
            .unwrap();

        assert_eq!(store.fix_task_status(&task.task_id, UnitKind::Cve).await.unwrap(), 1);
        assert_eq!(store.fix_task_status(&task.task_id, UnitKind::Cve).await.unwrap(), 0);

        let units = store.get_cve_units(&task.task_id).await.unwrap();
        assert_eq!(units[0].status, CveHostStatus::Fixed);
        assert_eq!(units[1].status, CveHostStatus::Unknown);
    }

    #[tokio::test]
    async fn delete_only_removes_owned_tasks() {
        let (store, task) = seeded().await;
        let deleted = store
            .delete_tasks("someone-else", &[task.task_id.clone()])
            .await
            .unwrap();
        assert!(deleted.is_empty());

        let deleted = store.delete_tasks("admin", &[task.task_id.clone()]).await.unwrap();
        assert_eq!(deleted, vec![task.task_id.clone()]);
        assert!(store.get_cve_units(&task.task_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_fault_leaves_state_untouched() {
        let (store, task) = seeded().await;
        store.fail_operation("init_cve_task");
        assert!(store.init_cve_task(&task.task_id, &[]).await.is_err());
        assert_eq!(
            store.count_running_units(&task.task_id, UnitKind::Cve).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn artifacts_update_is_partial() {
        let store = InMemoryStore::new();
        assert!(store
            .save_task_artifacts("t1", ArtifactsUpdate::default())
            .await
            .is_err());

        store.init_task_artifacts("t1", "admin").await.unwrap();
        store
            .save_task_artifacts(
                "t1",
                ArtifactsUpdate {
                    playbook: Some("[]".into()),
                    ..ArtifactsUpdate::default()
                },
            )
            .await
            .unwrap();
        store
            .save_task_artifacts(
                "t1",
                ArtifactsUpdate {
                    log: Some("{}".into()),
                    ..ArtifactsUpdate::default()
                },
            )
            .await
            .unwrap();
        let doc = store.get_task_artifacts("t1").await.unwrap().unwrap();
        assert_eq!(doc.playbook, "[]");
        assert_eq!(doc.log, "{}");
        assert_eq!(doc.inventory, "");
    }
}
