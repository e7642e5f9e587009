#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Remediation Core
//!
//! Task orchestration and progress tracking for fleet-wide CVE remediation.
//!
//! ## Overview
//!
//! A task (cve-fix, cve-rollback, repo-set or cve-scan) is generated from a
//! caller-supplied host/CVE membership, executed through an external
//! automation runner, and tracked per unit: one row per (task, host, CVE) or
//! (task, host). Runner events arrive through per-type callback handlers
//! that write unit statuses as they come in; summary statuses are always
//! derived from the unit rows, never stored.
//!
//! ## Architecture
//!
//! ```text
//! TaskService ──> ExecutionDriver ──> TaskManager (per type)
//!                                        │  pre_handle / handle / post_handle / fault_handle
//!                                        ▼
//!                                  PlaybookRunner ──events──> callback handlers
//!                                                                 │
//!                                        ProgressStore <──────────┘
//! CorrectionSweeper ──(stuck tasks)──> ProgressStore
//! ```
//!
//! ## Module Organization
//!
//! - [`models`] - tasks, units, hosts and result documents
//! - [`database`] - progress and result stores (in-memory and PostgreSQL)
//! - [`cache`] - bounded task membership cache
//! - [`orchestration`] - aggregation, playbooks, runner, callbacks, managers, sweeper
//! - [`state_machine`] - execution lifecycle states and transitions
//! - [`services`] - caller-facing task operations
//! - [`config`] - layered configuration
//! - [`error`] - error types and caller result codes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use remediation_core::config::RemediationConfig;
//! use remediation_core::database::InMemoryStore;
//! use remediation_core::orchestration::CommandRunner;
//! use remediation_core::services::TaskService;
//!
//! let config = RemediationConfig::default();
//! let store = Arc::new(InMemoryStore::new());
//! let service = TaskService::new(
//!     store.clone(),
//!     store,
//!     Arc::new(CommandRunner::new(config.runner.clone())),
//!     config.task.clone(),
//! );
//! # let _ = service;
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # All tests; PostgreSQL tests need DATABASE_URL and --ignored
//! ```

pub mod cache;
pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod orchestration;
pub mod services;
pub mod state_machine;

pub use cache::{TaskCache, TaskMembership};
pub use config::{ConfigManager, RemediationConfig};
pub use constants::{CveHostStatus, RepoStatus, RunnerOutcome, ScanStatus, TaskStatus};
pub use database::{InMemoryStore, PgStore, ProgressMode, ProgressStore, ResultStore};
pub use error::{Partial, RemediationError, RemediationResult, ResultCode};
pub use models::{Task, TaskType};
pub use orchestration::{CorrectionSweeper, ExecutionDriver, ExecutionReport, TaskManager};
pub use services::{TaskQueryService, TaskService};
pub use state_machine::{ExecutionState, ExecutionStateMachine};
