//! # Task Manager
//!
//! The four execution hooks every task type implements, and the driver that
//! sequences them through the execution state machine.
//!
//! The driver is the only caller of the hooks. Once `pre_handle` succeeded,
//! `fault_handle` runs exactly once whatever happens afterwards, so a run
//! never leaves a unit `running` behind.

use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::database::{ProgressMode, ProgressStore};
use crate::error::RemediationResult;
use crate::logging::log_task_operation;
use crate::metrics;
use crate::models::TaskType;
use crate::state_machine::{ExecutionEvent, ExecutionState, ExecutionStateMachine, TransitionRecord};

/// Per-task-type execution hooks
#[async_trait]
pub trait TaskManager: Send {
    fn task_id(&self) -> &str;

    fn task_type(&self) -> TaskType;

    /// Move targeted units to their running status. On error nothing has
    /// started and the task may be executed again.
    async fn pre_handle(&mut self) -> RemediationResult<()>;

    /// Run the playbook; returns once every callback was delivered
    async fn handle(&mut self) -> RemediationResult<()>;

    /// Assemble and persist the result document
    async fn post_handle(&mut self) -> RemediationResult<()>;

    /// Force units still running to their terminal unknown status and fill
    /// progress. Safe to call repeatedly. Returns the number of units moved.
    async fn fault_handle(&self) -> RemediationResult<u64>;
}

/// Outcome of one driven execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub task_id: String,
    pub task_type: TaskType,
    pub final_state: ExecutionState,
    pub history: Vec<TransitionRecord>,
    /// Units moved out of running by fault handling
    pub corrected_units: u64,
    pub error: Option<String>,
}

/// Reconcile a task's units after an execution attempt: fill CVE progress
/// for the targeted CVEs (all when empty) and move running units to
/// unknown. Shared by fault handling, the supervisor and the sweeper.
pub async fn reconcile_task(
    store: &dyn ProgressStore,
    task_id: &str,
    task_type: TaskType,
    cve_list: &[String],
) -> RemediationResult<u64> {
    if task_type.is_cve_task() {
        store
            .set_cve_progress(task_id, cve_list, ProgressMode::Fill)
            .await?;
    }
    let corrected = store.fix_task_status(task_id, task_type.unit_kind()).await?;
    if corrected > 0 {
        info!(
            task_id = task_id,
            task_type = %task_type,
            corrected = corrected,
            "Moved dangling running units to unknown"
        );
    }
    Ok(corrected)
}

/// Sequences the hooks of a [`TaskManager`] through the execution states
#[derive(Clone)]
pub struct ExecutionDriver {
    store: Arc<dyn ProgressStore>,
}

impl std::fmt::Debug for ExecutionDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionDriver").finish_non_exhaustive()
    }
}

impl ExecutionDriver {
    pub fn new(store: Arc<dyn ProgressStore>) -> Self {
        Self { store }
    }

    /// Drive one execution end to end.
    ///
    /// Returns `Err` when initialization failed (the run stays `created`)
    /// or when the runner itself failed (after fault handling). Every other
    /// outcome, including a `fault` end state, is reported in the
    /// [`ExecutionReport`].
    pub async fn execute<M>(&self, manager: &mut M) -> RemediationResult<ExecutionReport>
    where
        M: TaskManager + ?Sized,
    {
        let task_id = manager.task_id().to_string();
        let task_type = manager.task_type();
        let mut sm = ExecutionStateMachine::new(&task_id);

        sm.transition(ExecutionEvent::Start)?;
        log_task_operation("execute", &task_id, task_type.as_str(), "pre_handling", None);

        if let Err(e) = manager.pre_handle().await {
            sm.transition(ExecutionEvent::InitFailed(e.to_string()))?;
            warn!(task_id = %task_id, error = %e, "Task initialization failed, execution not started");
            Self::record_outcome(task_type, sm.current_state());
            return Err(e);
        }
        sm.transition(ExecutionEvent::Initialized)?;

        let mut runner_failure = None;
        match manager.handle().await {
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Runner failed");
                sm.transition(ExecutionEvent::Fault(e.to_string()))?;
                runner_failure = Some(e);
            }
            Ok(()) => {
                sm.transition(ExecutionEvent::RunnerFinished)?;
                match manager.post_handle().await {
                    Err(e) => {
                        error!(task_id = %task_id, error = %e, "Failed to persist task results");
                        sm.transition(ExecutionEvent::Fault(e.to_string()))?;
                    }
                    Ok(()) => match self.dangling_units(&task_id, task_type).await {
                        0 => {
                            sm.transition(ExecutionEvent::ResultsPersisted)?;
                        }
                        dangling => {
                            warn!(task_id = %task_id, dangling = dangling, "Units never reported back");
                            sm.transition(ExecutionEvent::Fault(format!(
                                "{dangling} units still running after the run"
                            )))?;
                        }
                    },
                }
            }
        }

        let corrected_units = match manager.fault_handle().await {
            Ok(corrected) => corrected,
            Err(e) => {
                // the sweeper catches whatever is left running
                error!(task_id = %task_id, error = %e, "Fault handling failed");
                0
            }
        };

        let final_state = sm.current_state();
        let error = sm
            .history()
            .iter()
            .rev()
            .find_map(|record| record.error.clone());
        Self::record_outcome(task_type, final_state);
        log_task_operation(
            "execute",
            &task_id,
            task_type.as_str(),
            &final_state.to_string(),
            error.as_deref(),
        );

        if let Some(e) = runner_failure {
            return Err(e);
        }

        Ok(ExecutionReport {
            task_id,
            task_type,
            final_state,
            history: sm.into_history(),
            corrected_units,
            error,
        })
    }

    async fn dangling_units(&self, task_id: &str, task_type: TaskType) -> u64 {
        match self
            .store
            .count_running_units(task_id, task_type.unit_kind())
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(task_id = task_id, error = %e, "Could not count running units");
                0
            }
        }
    }

    fn record_outcome(task_type: TaskType, final_state: ExecutionState) {
        metrics::executions_total().add(
            1,
            &[
                KeyValue::new("task_type", task_type.as_str()),
                KeyValue::new("final_state", final_state.to_string()),
            ],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InMemoryStore;
    use crate::error::RemediationError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Hooks {
        fail_pre: bool,
        fail_handle: bool,
        fail_post: bool,
        calls: Vec<&'static str>,
        fault_calls: AtomicU32,
    }

    #[async_trait]
    impl TaskManager for Hooks {
        fn task_id(&self) -> &str {
            "t1"
        }

        fn task_type(&self) -> TaskType {
            TaskType::RepoSet
        }

        async fn pre_handle(&mut self) -> RemediationResult<()> {
            self.calls.push("pre");
            if self.fail_pre {
                return Err(RemediationError::Persistence("down".into()));
            }
            Ok(())
        }

        async fn handle(&mut self) -> RemediationResult<()> {
            self.calls.push("handle");
            if self.fail_handle {
                return Err(RemediationError::Runner("crashed".into()));
            }
            Ok(())
        }

        async fn post_handle(&mut self) -> RemediationResult<()> {
            self.calls.push("post");
            if self.fail_post {
                return Err(RemediationError::Persistence("write".into()));
            }
            Ok(())
        }

        async fn fault_handle(&self) -> RemediationResult<u64> {
            self.fault_calls.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }
    }

    fn driver() -> ExecutionDriver {
        ExecutionDriver::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn clean_run_completes_and_still_reconciles() {
        let mut hooks = Hooks::default();
        let report = driver().execute(&mut hooks).await.unwrap();

        assert_eq!(report.final_state, ExecutionState::Completed);
        assert_eq!(hooks.calls, vec!["pre", "handle", "post"]);
        assert_eq!(hooks.fault_calls.load(Ordering::SeqCst), 1);
        assert!(report.error.is_none());
    }

    #[tokio::test]
    async fn failed_initialization_skips_everything_else() {
        let mut hooks = Hooks {
            fail_pre: true,
            ..Default::default()
        };
        let err = driver().execute(&mut hooks).await.unwrap_err();

        assert!(matches!(err, RemediationError::Persistence(_)));
        assert_eq!(hooks.calls, vec!["pre"]);
        assert_eq!(hooks.fault_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn runner_failure_is_reported_after_fault_handling() {
        let mut hooks = Hooks {
            fail_handle: true,
            ..Default::default()
        };
        let err = driver().execute(&mut hooks).await.unwrap_err();

        assert!(matches!(err, RemediationError::Runner(_)));
        assert_eq!(hooks.calls, vec!["pre", "handle"]);
        assert_eq!(hooks.fault_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn post_handle_failure_ends_in_fault() {
        let mut hooks = Hooks {
            fail_post: true,
            ..Default::default()
        };
        let report = driver().execute(&mut hooks).await.unwrap();

        assert_eq!(report.final_state, ExecutionState::Fault);
        assert_eq!(hooks.fault_calls.load(Ordering::SeqCst), 1);
        assert!(report.error.unwrap().contains("write"));
    }
}
