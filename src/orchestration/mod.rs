//! # Orchestration Engine
//!
//! Execution of remediation tasks against an external automation runner.
//!
//! ## Core Components
//!
//! - **status_aggregator**: collapses raw unit statuses into summary statuses
//! - **playbook**: inventory and playbook generation per task type
//! - **runner**: the `PlaybookRunner` seam and the process-backed runner
//! - **callback**: per-type handlers that turn runner events into unit writes
//! - **managers**: per-type `TaskManager` implementations
//! - **task_manager**: the hook trait and the driver that sequences it
//! - **correction_sweeper**: time-based backstop for tasks stuck running

pub mod callback;
pub mod correction_sweeper;
pub mod managers;
pub mod playbook;
pub mod runner;
pub mod status_aggregator;
pub mod task_manager;

// Re-export core types and components for easy access
pub use callback::{CallbackRegistry, CveCallback, CveScanCallback, CveStatusMapping, RepoSetCallback};
pub use correction_sweeper::{Correction, CorrectionSweeper};
pub use managers::{build_manager, ManagerContext};
pub use playbook::{PlaybookBuilder, PreparedRun};
pub use runner::{CommandRunner, PlaybookRunner, RunnerCallback, RunnerError, RunnerEvent};
pub use status_aggregator::{aggregate_cve_statuses, CveAggregation, StatusCounts};
pub use task_manager::{reconcile_task, ExecutionDriver, ExecutionReport, TaskManager};
