//! # Correction Sweeper
//!
//! Background service that forces tasks stuck in `running` into a terminal
//! state once they are older than the configured timeout.
//!
//! ## Flow
//!
//! 1. Timer tick triggers a sweep
//! 2. The progress store lists tasks with any unit still running
//! 3. Tasks older than `service_timeout_threshold_min` (measured from
//!    `create_time`) are reconciled through the same path fault handling
//!    uses
//! 4. Corrections are counted and logged
//!
//! The runner process of a corrected task is left alone; a late callback
//! for a corrected unit simply overwrites `unknown` with its real outcome.
//!
//! ## Configuration
//!
//! ```toml
//! [correction]
//! enabled = true
//! interval_seconds = 60
//! service_timeout_threshold_min = 15
//! ```

use chrono::Utc;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::CorrectionConfig;
use crate::database::ProgressStore;
use crate::error::RemediationResult;
use crate::metrics;
use crate::models::Task;
use crate::orchestration::task_manager::reconcile_task;

/// Task corrected during one sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correction {
    pub task_id: String,
    pub age_seconds: i64,
    pub corrected_units: u64,
}

#[derive(Clone)]
pub struct CorrectionSweeper {
    store: Arc<dyn ProgressStore>,
    config: CorrectionConfig,
}

impl std::fmt::Debug for CorrectionSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrectionSweeper")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CorrectionSweeper {
    #[must_use]
    pub fn new(store: Arc<dyn ProgressStore>, config: CorrectionConfig) -> Self {
        Self { store, config }
    }

    fn threshold_seconds(&self) -> i64 {
        i64::try_from(self.config.service_timeout_threshold_min.saturating_mul(60))
            .unwrap_or(i64::MAX)
    }

    /// Run sweeps until the surrounding task is cancelled. A failed sweep
    /// is logged and the loop keeps going.
    pub async fn run(&self) -> RemediationResult<()> {
        let mut interval_timer = interval(Duration::from_secs(self.config.interval_seconds));

        info!(
            interval_seconds = self.config.interval_seconds,
            threshold_min = self.config.service_timeout_threshold_min,
            "Starting correction sweeper"
        );

        loop {
            interval_timer.tick().await;

            match self.sweep_once(Utc::now().timestamp()).await {
                Ok(corrections) if corrections.is_empty() => {
                    debug!("No stuck tasks this cycle");
                }
                Ok(corrections) => {
                    info!(
                        corrected_tasks = corrections.len(),
                        corrected_units = corrections.iter().map(|c| c.corrected_units).sum::<u64>(),
                        "Correction sweep completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Correction sweep failed");
                }
            }
        }
    }

    /// One sweep at time `now` (unix seconds)
    pub async fn sweep_once(&self, now: i64) -> RemediationResult<Vec<Correction>> {
        let threshold = self.threshold_seconds();
        let stuck: Vec<Task> = self
            .store
            .running_tasks()
            .await?
            .into_iter()
            .filter(|task| now.saturating_sub(task.create_time) >= threshold)
            .collect();

        let mut corrections = Vec::with_capacity(stuck.len());
        for task in stuck {
            let age_seconds = now.saturating_sub(task.create_time);
            match reconcile_task(self.store.as_ref(), &task.task_id, task.task_type, &[]).await {
                Ok(corrected_units) => {
                    metrics::sweeper_corrections_total()
                        .add(1, &[KeyValue::new("task_type", task.task_type.as_str())]);
                    info!(
                        task_id = %task.task_id,
                        task_type = %task.task_type,
                        age_seconds = age_seconds,
                        corrected_units = corrected_units,
                        "Corrected stuck task"
                    );
                    corrections.push(Correction {
                        task_id: task.task_id,
                        age_seconds,
                        corrected_units,
                    });
                }
                Err(e) => {
                    warn!(task_id = %task.task_id, error = %e, "Could not correct stuck task");
                }
            }
        }
        Ok(corrections)
    }
}
