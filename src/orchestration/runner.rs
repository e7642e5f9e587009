//! # Automation Runner Interface
//!
//! The runner is a black box: it takes an inventory and a playbook, runs
//! them, and reports one event per (host, step) to a registered callback.
//! [`CommandRunner`] drives an external process that prints those events as
//! JSON lines on stdout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::constants::RunnerOutcome;
use crate::error::RemediationError;
use crate::orchestration::playbook::PreparedRun;

/// One (host, step) outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerEvent {
    pub host: String,
    pub step: String,
    pub outcome: RunnerOutcome,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub msg: String,
}

impl RunnerEvent {
    pub fn new(host: &str, step: &str, outcome: RunnerOutcome) -> Self {
        Self {
            host: host.to_string(),
            step: step.to_string(),
            outcome,
            stdout: String::new(),
            stderr: String::new(),
            msg: String::new(),
        }
    }

    pub fn with_stdout(mut self, stdout: &str) -> Self {
        self.stdout = stdout.to_string();
        self
    }

    pub fn with_stderr(mut self, stderr: &str) -> Self {
        self.stderr = stderr.to_string();
        self
    }

    pub fn with_msg(mut self, msg: &str) -> Self {
        self.msg = msg.to_string();
        self
    }

    /// The output relevant to the outcome: the connection message when
    /// unreachable, stdout on success, stderr on failure
    pub fn output(&self) -> &str {
        match self.outcome {
            RunnerOutcome::Unreachable => &self.msg,
            RunnerOutcome::Ok => &self.stdout,
            RunnerOutcome::Failed => &self.stderr,
        }
    }
}

/// Receiver of runner events, one method per outcome
#[async_trait]
pub trait RunnerCallback: Send + Sync {
    async fn on_unreachable(&self, event: &RunnerEvent);
    async fn on_ok(&self, event: &RunnerEvent);
    async fn on_failed(&self, event: &RunnerEvent);
}

/// Route an event to the method matching its outcome
pub async fn dispatch(callback: &dyn RunnerCallback, event: &RunnerEvent) {
    match event.outcome {
        RunnerOutcome::Unreachable => callback.on_unreachable(event).await,
        RunnerOutcome::Ok => callback.on_ok(event).await,
        RunnerOutcome::Failed => callback.on_failed(event).await,
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to start runner: {0}")]
    Spawn(String),

    #[error("Runner I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Runner exited with status {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },

    #[error("Failed to serialize run input: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<RunnerError> for RemediationError {
    fn from(err: RunnerError) -> Self {
        Self::Runner(err.to_string())
    }
}

#[async_trait]
pub trait PlaybookRunner: Send + Sync {
    /// Run to completion, reporting every event to `callback` before returning
    async fn run(
        &self,
        task_id: &str,
        prepared: &PreparedRun,
        callback: Arc<dyn RunnerCallback>,
    ) -> Result<(), RunnerError>;
}

/// Runs the configured command with `--inventory <file> --playbook <file>`
/// and reads events from its stdout, one JSON object per line
#[derive(Debug, Clone)]
pub struct CommandRunner {
    config: RunnerConfig,
}

impl CommandRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    async fn write_inputs(
        &self,
        task_id: &str,
        prepared: &PreparedRun,
    ) -> Result<(PathBuf, PathBuf), RunnerError> {
        let dir = PathBuf::from(&self.config.work_dir).join(task_id);
        tokio::fs::create_dir_all(&dir).await?;
        let inventory = dir.join("inventory.json");
        let playbook = dir.join("playbook.json");
        tokio::fs::write(&inventory, prepared.inventory_json()?).await?;
        tokio::fs::write(&playbook, prepared.playbook_json()?).await?;
        Ok((inventory, playbook))
    }
}

#[async_trait]
impl PlaybookRunner for CommandRunner {
    async fn run(
        &self,
        task_id: &str,
        prepared: &PreparedRun,
        callback: Arc<dyn RunnerCallback>,
    ) -> Result<(), RunnerError> {
        let (inventory, playbook) = self.write_inputs(task_id, prepared).await?;

        info!(
            task_id = task_id,
            command = %self.config.command,
            "Starting automation runner"
        );

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .arg("--inventory")
            .arg(&inventory)
            .arg("--playbook")
            .arg(&playbook)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunnerError::Spawn(format!("{}: {e}", self.config.command)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::Spawn("stdout not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunnerError::Spawn("stderr not captured".to_string()))?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut events = 0usize;
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<RunnerEvent>(line) {
                Ok(event) => {
                    events += 1;
                    dispatch(callback.as_ref(), &event).await;
                }
                Err(e) => debug!(task_id = task_id, error = %e, "Ignoring non-event runner output"),
            }
        }

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            warn!(
                task_id = task_id,
                code = ?status.code(),
                events = events,
                "Automation runner exited unsuccessfully"
            );
            return Err(RunnerError::Exited {
                code: status.code(),
                stderr,
            });
        }

        info!(task_id = task_id, events = events, "Automation runner finished");
        Ok(())
    }
}
