//! # PostgreSQL Store
//!
//! `ProgressStore` and `ResultStore` over a `sqlx::PgPool`. Multi-statement
//! mutations run inside one transaction; a failure rolls the whole call
//! back when the transaction is dropped uncommitted.
//!
//! Schema lives in `migrations/`.

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::{debug, info};

use super::progress_store::{ProgressMode, ProgressStore, ResultStore, StoreError, StoreResult};
use crate::config::DatabaseConfig;
use crate::constants::{CveHostStatus, RepoStatus, ScanStatus};
use crate::models::{
    ArtifactsUpdate, CveHostUnit, Host, HostInfo, RepoHostUnit, ScanHostUnit, Task,
    TaskArtifacts, TaskCve, TaskType, UnitKind,
};

const TASK_COLUMNS: &str = "task_id, task_type, task_name, description, username, create_time, \
     latest_execute_time, auto_reboot, need_reboot, host_num, repo_name, source_task_id";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

// Manual Debug implementation because PgPool carries connection state
impl std::fmt::Debug for PgStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgStore")
            .field("pool_size", &self.pool.size())
            .finish_non_exhaustive()
    }
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.url)
            .await?;
        info!(
            max_connections = config.max_connections,
            "Connected remediation progress store"
        );
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        debug!("Remediation schema migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_column<T>(row: &PgRow, column: &str) -> StoreResult<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|e: String| StoreError::Database(format!("column {column}: {e}")))
}

fn task_from_row(row: &PgRow) -> StoreResult<Task> {
    Ok(Task {
        task_id: row.try_get("task_id")?,
        task_type: parse_column::<TaskType>(row, "task_type")?,
        task_name: row.try_get("task_name")?,
        description: row.try_get("description")?,
        username: row.try_get("username")?,
        create_time: row.try_get("create_time")?,
        latest_execute_time: row.try_get("latest_execute_time")?,
        auto_reboot: row.try_get("auto_reboot")?,
        need_reboot: row.try_get("need_reboot")?,
        host_num: row.try_get("host_num")?,
        repo_name: row.try_get("repo_name")?,
        source_task_id: row.try_get("source_task_id")?,
    })
}

fn host_from_row(row: &PgRow) -> StoreResult<Host> {
    let scan_status: Option<String> = row.try_get("scan_status")?;
    Ok(Host {
        host_id: row.try_get("host_id")?,
        host_name: row.try_get("host_name")?,
        host_ip: row.try_get("host_ip")?,
        username: row.try_get("username")?,
        repo_name: row.try_get("repo_name")?,
        scan_status: scan_status
            .map(|s| s.parse::<ScanStatus>())
            .transpose()
            .map_err(StoreError::Database)?,
        last_scan: row.try_get("last_scan")?,
    })
}

async fn insert_task_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    task: &Task,
) -> StoreResult<()> {
    sqlx::query(&format!(
        "INSERT INTO remediation_tasks ({TASK_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
    ))
    .bind(&task.task_id)
    .bind(task.task_type.as_str())
    .bind(&task.task_name)
    .bind(&task.description)
    .bind(&task.username)
    .bind(task.create_time)
    .bind(task.latest_execute_time)
    .bind(task.auto_reboot)
    .bind(task.need_reboot)
    .bind(task.host_num)
    .bind(&task.repo_name)
    .bind(&task.source_task_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl ProgressStore for PgStore {
    async fn upsert_host(&self, host: Host) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO remediation_hosts \
             (host_id, host_name, host_ip, username, repo_name, scan_status, last_scan) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (host_id) DO UPDATE SET host_name = EXCLUDED.host_name, \
             host_ip = EXCLUDED.host_ip, username = EXCLUDED.username, \
             repo_name = EXCLUDED.repo_name, scan_status = EXCLUDED.scan_status, \
             last_scan = EXCLUDED.last_scan",
        )
        .bind(host.host_id)
        .bind(&host.host_name)
        .bind(&host.host_ip)
        .bind(&host.username)
        .bind(&host.repo_name)
        .bind(host.scan_status.map(|s| s.as_str()))
        .bind(host.last_scan)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_hosts(&self, username: &str, host_ids: &[i64]) -> StoreResult<Vec<Host>> {
        let rows = sqlx::query(
            "SELECT host_id, host_name, host_ip, username, repo_name, scan_status, last_scan \
             FROM remediation_hosts WHERE username = $1 AND host_id = ANY($2) ORDER BY host_id",
        )
        .bind(username)
        .bind(host_ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(host_from_row).collect()
    }

    async fn insert_cve_task(
        &self,
        task: &Task,
        cves: &[TaskCve],
        units: &[CveHostUnit],
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_task_row(&mut tx, task).await?;
        for cve in cves {
            sqlx::query(
                "INSERT INTO remediation_task_cves \
                 (task_id, cve_id, reboot, progress, host_num, packages) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(&cve.task_id)
            .bind(&cve.cve_id)
            .bind(cve.reboot)
            .bind(cve.progress)
            .bind(cve.host_num)
            .bind(&cve.packages)
            .execute(&mut *tx)
            .await?;
        }
        for unit in units {
            sqlx::query(
                "INSERT INTO remediation_task_cve_hosts \
                 (task_id, cve_id, host_id, host_name, host_ip, status) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(&unit.task_id)
            .bind(&unit.cve_id)
            .bind(unit.host_id)
            .bind(&unit.host_name)
            .bind(&unit.host_ip)
            .bind(unit.status.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_repo_task(&self, task: &Task, units: &[RepoHostUnit]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_task_row(&mut tx, task).await?;
        for unit in units {
            sqlx::query(
                "INSERT INTO remediation_task_repo_hosts \
                 (task_id, repo_name, host_id, host_name, host_ip, status) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(&unit.task_id)
            .bind(&unit.repo_name)
            .bind(unit.host_id)
            .bind(&unit.host_name)
            .bind(&unit.host_ip)
            .bind(unit.status.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_scan_task(&self, task: &Task, hosts: &[HostInfo]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_task_row(&mut tx, task).await?;
        for host in hosts {
            sqlx::query(
                "INSERT INTO remediation_task_scan_hosts (task_id, host_id, host_name, host_ip) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(&task.task_id)
            .bind(host.host_id)
            .bind(&host.host_name)
            .bind(&host.host_ip)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> StoreResult<Option<Task>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM remediation_tasks WHERE task_id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn list_tasks(&self, username: &str) -> StoreResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM remediation_tasks WHERE username = $1 \
             ORDER BY create_time, task_id"
        ))
        .bind(username)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn delete_tasks(&self, username: &str, task_ids: &[String]) -> StoreResult<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        // Unit tables cascade from remediation_tasks
        let rows = sqlx::query(
            "DELETE FROM remediation_tasks WHERE username = $1 AND task_id = ANY($2) \
             RETURNING task_id",
        )
        .bind(username)
        .bind(task_ids)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("task_id").map_err(StoreError::from))
            .collect()
    }

    async fn update_task_execute_time(&self, task_id: &str, executed_at: i64) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE remediation_tasks SET latest_execute_time = $2 WHERE task_id = $1",
        )
        .bind(task_id)
        .bind(executed_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("task {task_id}")));
        }
        Ok(())
    }

    async fn running_tasks(&self) -> StoreResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM remediation_tasks t WHERE \
             EXISTS (SELECT 1 FROM remediation_task_cve_hosts u \
                     WHERE u.task_id = t.task_id AND u.status = 'running') \
             OR EXISTS (SELECT 1 FROM remediation_task_repo_hosts u \
                     WHERE u.task_id = t.task_id AND u.status = 'running') \
             OR EXISTS (SELECT 1 FROM remediation_task_scan_hosts s \
                     JOIN remediation_hosts h ON h.host_id = s.host_id \
                     WHERE s.task_id = t.task_id AND h.scan_status = 'scanning') \
             ORDER BY task_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn get_task_cves(&self, task_id: &str) -> StoreResult<Vec<TaskCve>> {
        let rows = sqlx::query(
            "SELECT task_id, cve_id, reboot, progress, host_num, packages \
             FROM remediation_task_cves WHERE task_id = $1 ORDER BY cve_id",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> StoreResult<TaskCve> {
                Ok(TaskCve {
                    task_id: row.try_get("task_id")?,
                    cve_id: row.try_get("cve_id")?,
                    reboot: row.try_get("reboot")?,
                    progress: row.try_get("progress")?,
                    host_num: row.try_get("host_num")?,
                    packages: row.try_get("packages")?,
                })
            })
            .collect()
    }

    async fn get_cve_units(&self, task_id: &str) -> StoreResult<Vec<CveHostUnit>> {
        let rows = sqlx::query(
            "SELECT task_id, cve_id, host_id, host_name, host_ip, status \
             FROM remediation_task_cve_hosts WHERE task_id = $1 ORDER BY cve_id, host_id",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> StoreResult<CveHostUnit> {
                Ok(CveHostUnit {
                    task_id: row.try_get("task_id")?,
                    cve_id: row.try_get("cve_id")?,
                    host_id: row.try_get("host_id")?,
                    host_name: row.try_get("host_name")?,
                    host_ip: row.try_get("host_ip")?,
                    status: parse_column::<CveHostStatus>(row, "status")?,
                })
            })
            .collect()
    }

    async fn get_repo_units(&self, task_id: &str) -> StoreResult<Vec<RepoHostUnit>> {
        let rows = sqlx::query(
            "SELECT task_id, repo_name, host_id, host_name, host_ip, status \
             FROM remediation_task_repo_hosts WHERE task_id = $1 ORDER BY host_id",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> StoreResult<RepoHostUnit> {
                Ok(RepoHostUnit {
                    task_id: row.try_get("task_id")?,
                    repo_name: row.try_get("repo_name")?,
                    host_id: row.try_get("host_id")?,
                    host_name: row.try_get("host_name")?,
                    host_ip: row.try_get("host_ip")?,
                    status: parse_column::<RepoStatus>(row, "status")?,
                })
            })
            .collect()
    }

    async fn get_scan_units(&self, task_id: &str) -> StoreResult<Vec<ScanHostUnit>> {
        let rows = sqlx::query(
            "SELECT s.task_id, s.host_id, s.host_name, s.host_ip, h.scan_status \
             FROM remediation_task_scan_hosts s \
             LEFT JOIN remediation_hosts h ON h.host_id = s.host_id \
             WHERE s.task_id = $1 ORDER BY s.host_id",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> StoreResult<ScanHostUnit> {
                let status: Option<String> = row.try_get("scan_status")?;
                Ok(ScanHostUnit {
                    task_id: row.try_get("task_id")?,
                    host_id: row.try_get("host_id")?,
                    host_name: row.try_get("host_name")?,
                    host_ip: row.try_get("host_ip")?,
                    status: status
                        .map(|s| s.parse::<ScanStatus>())
                        .transpose()
                        .map_err(StoreError::Database)?,
                })
            })
            .collect()
    }

    async fn init_cve_task(&self, task_id: &str, cve_list: &[String]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE remediation_task_cve_hosts SET status = 'running' \
             WHERE task_id = $1 AND (cardinality($2::text[]) = 0 OR cve_id = ANY($2))",
        )
        .bind(task_id)
        .bind(cve_list)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE remediation_task_cves SET progress = 0 \
             WHERE task_id = $1 AND (cardinality($2::text[]) = 0 OR cve_id = ANY($2))",
        )
        .bind(task_id)
        .bind(cve_list)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_cve_status(
        &self,
        task_id: &str,
        cve_id: &str,
        host_id: i64,
        status: CveHostStatus,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE remediation_task_cve_hosts SET status = $4 \
             WHERE task_id = $1 AND cve_id = $2 AND host_id = $3",
        )
        .bind(task_id)
        .bind(cve_id)
        .bind(host_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "unit ({task_id}, {cve_id}, {host_id})"
            )));
        }
        Ok(())
    }

    async fn set_cve_progress(
        &self,
        task_id: &str,
        cve_list: &[String],
        mode: ProgressMode,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE remediation_task_cves SET progress = CASE $3 \
                 WHEN 'add' THEN LEAST(progress + 1, host_num) \
                 WHEN 'fill' THEN host_num \
                 ELSE 0 END \
             WHERE task_id = $1 AND (cardinality($2::text[]) = 0 OR cve_id = ANY($2))",
        )
        .bind(task_id)
        .bind(cve_list)
        .bind(mode.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_repo_status(
        &self,
        task_id: &str,
        host_ids: &[i64],
        status: RepoStatus,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE remediation_task_repo_hosts SET status = $3 \
             WHERE task_id = $1 AND (cardinality($2::bigint[]) = 0 OR host_id = ANY($2))",
        )
        .bind(task_id)
        .bind(host_ids)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("repo units of task {task_id}")));
        }
        Ok(())
    }

    async fn set_host_repo(&self, repo_name: &str, host_ids: &[i64]) -> StoreResult<()> {
        sqlx::query("UPDATE remediation_hosts SET repo_name = $1 WHERE host_id = ANY($2)")
            .bind(repo_name)
            .bind(host_ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn init_host_scan(&self, host_ids: &[i64], scanned_at: i64) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE remediation_hosts SET scan_status = 'scanning', last_scan = $2 \
             WHERE host_id = ANY($1)",
        )
        .bind(host_ids)
        .bind(scanned_at)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() != host_ids.len() as u64 {
            // dropping tx rolls the partial update back
            return Err(StoreError::NotFound(format!(
                "{} of {} hosts",
                host_ids.len() as u64 - result.rows_affected(),
                host_ids.len()
            )));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_scan_status(&self, host_ids: &[i64]) -> StoreResult<()> {
        sqlx::query("UPDATE remediation_hosts SET scan_status = 'done' WHERE host_id = ANY($1)")
            .bind(host_ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_scan_result(&self, host_id: i64, cves: &[String]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM remediation_host_cves WHERE host_id = $1")
            .bind(host_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO remediation_host_cves (host_id, cve_id) \
             SELECT $1, unnest($2::text[]) ON CONFLICT DO NOTHING",
        )
        .bind(host_id)
        .bind(cves)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_host_cves(&self, host_id: i64) -> StoreResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT cve_id FROM remediation_host_cves WHERE host_id = $1 ORDER BY cve_id",
        )
        .bind(host_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("cve_id").map_err(StoreError::from))
            .collect()
    }

    async fn fix_task_status(&self, task_id: &str, kind: UnitKind) -> StoreResult<u64> {
        let sql = match kind {
            UnitKind::Cve => {
                "UPDATE remediation_task_cve_hosts SET status = 'unknown' \
                 WHERE task_id = $1 AND status = 'running'"
            }
            UnitKind::Repo => {
                "UPDATE remediation_task_repo_hosts SET status = 'unknown' \
                 WHERE task_id = $1 AND status = 'running'"
            }
            UnitKind::Scan => {
                "UPDATE remediation_hosts SET scan_status = 'done' \
                 WHERE scan_status = 'scanning' AND host_id IN \
                 (SELECT host_id FROM remediation_task_scan_hosts WHERE task_id = $1)"
            }
        };
        let result = sqlx::query(sql).bind(task_id).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn count_running_units(&self, task_id: &str, kind: UnitKind) -> StoreResult<u64> {
        let sql = match kind {
            UnitKind::Cve => {
                "SELECT COUNT(*) AS running FROM remediation_task_cve_hosts \
                 WHERE task_id = $1 AND status = 'running'"
            }
            UnitKind::Repo => {
                "SELECT COUNT(*) AS running FROM remediation_task_repo_hosts \
                 WHERE task_id = $1 AND status = 'running'"
            }
            UnitKind::Scan => {
                "SELECT COUNT(*) AS running FROM remediation_task_scan_hosts s \
                 JOIN remediation_hosts h ON h.host_id = s.host_id \
                 WHERE s.task_id = $1 AND h.scan_status = 'scanning'"
            }
        };
        let row = sqlx::query(sql).bind(task_id).fetch_one(&self.pool).await?;
        let running: i64 = row.try_get("running")?;
        Ok(running.max(0) as u64)
    }
}

#[async_trait]
impl ResultStore for PgStore {
    async fn init_task_artifacts(&self, task_id: &str, username: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO remediation_task_artifacts (task_id, username) VALUES ($1, $2) \
             ON CONFLICT (task_id) DO UPDATE SET playbook = '', inventory = '', log = ''",
        )
        .bind(task_id)
        .bind(username)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_task_artifacts(&self, task_id: &str, update: ArtifactsUpdate) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE remediation_task_artifacts SET \
             playbook = COALESCE($2, playbook), \
             inventory = COALESCE($3, inventory), \
             log = COALESCE($4, log) \
             WHERE task_id = $1",
        )
        .bind(task_id)
        .bind(update.playbook)
        .bind(update.inventory)
        .bind(update.log)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "result document of task {task_id}"
            )));
        }
        Ok(())
    }

    async fn get_task_artifacts(&self, task_id: &str) -> StoreResult<Option<TaskArtifacts>> {
        let row = sqlx::query(
            "SELECT task_id, username, playbook, inventory, log \
             FROM remediation_task_artifacts WHERE task_id = $1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| -> StoreResult<TaskArtifacts> {
            Ok(TaskArtifacts {
                task_id: row.try_get("task_id")?,
                username: row.try_get("username")?,
                playbook: row.try_get("playbook")?,
                inventory: row.try_get("inventory")?,
                log: row.try_get("log")?,
            })
        })
        .transpose()
    }

    async fn delete_task_artifacts(&self, task_ids: &[String]) -> StoreResult<()> {
        sqlx::query("DELETE FROM remediation_task_artifacts WHERE task_id = ANY($1)")
            .bind(task_ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
