//! # Callback Handlers
//!
//! One [`RunnerCallback`](crate::orchestration::runner::RunnerCallback)
//! implementation per task type. Each handler owns the in-memory
//! accumulators of a single execution run and writes every tracked unit's
//! status through the progress store as events arrive.
//!
//! Persistence failures are logged and swallowed: a lost write leaves the
//! unit `running`, and the task manager's fault handling moves it to
//! `unknown` afterwards.

pub mod cve;
pub mod registry;
pub mod repo_set;
pub mod scan;

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::constants::RunnerOutcome;

pub use cve::{CveCallback, CveStatusMapping};
pub use registry::{CallbackRegistry, Registration};
pub use repo_set::RepoSetCallback;
pub use scan::CveScanCallback;

/// Raw runner outcome of an untracked step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub info: String,
    pub outcome: RunnerOutcome,
}

/// Domain status of a tracked unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitRecord<S> {
    pub info: String,
    pub status: S,
}

type ByHost<T> = HashMap<String, HashMap<String, T>>;

/// Everything a handler has seen during one run, keyed by host name and
/// then by unit or step name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackRecords<S> {
    pub units: ByHost<UnitRecord<S>>,
    pub checks: ByHost<StepRecord>,
    pub steps: ByHost<StepRecord>,
}

impl<S> Default for CallbackRecords<S> {
    fn default() -> Self {
        Self {
            units: HashMap::new(),
            checks: HashMap::new(),
            steps: HashMap::new(),
        }
    }
}

impl<S> CallbackRecords<S> {
    pub fn unit(&self, host: &str, unit: &str) -> Option<&UnitRecord<S>> {
        self.units.get(host).and_then(|units| units.get(unit))
    }

    /// Check results of a host as (step name, passed), sorted by step name
    pub fn check_results(&self, host: &str) -> Vec<(String, bool)> {
        let mut results: Vec<(String, bool)> = self
            .checks
            .get(host)
            .map(|checks| {
                checks
                    .iter()
                    .map(|(step, record)| (step.clone(), record.outcome.is_success()))
                    .collect()
            })
            .unwrap_or_default();
        results.sort();
        results
    }

    pub fn checks_passed(&self, host: &str) -> bool {
        self.checks
            .get(host)
            .map_or(true, |checks| checks.values().all(|r| r.outcome.is_success()))
    }
}

/// Interior-mutable accumulator shared by concurrent event deliveries
#[derive(Debug)]
pub struct Accumulator<S> {
    inner: Mutex<CallbackRecords<S>>,
}

impl<S> Default for Accumulator<S> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(CallbackRecords::default()),
        }
    }
}

impl<S: Clone> Accumulator<S> {
    pub fn record_unit(&self, host: &str, unit: &str, record: UnitRecord<S>) {
        self.inner
            .lock()
            .units
            .entry(host.to_string())
            .or_default()
            .insert(unit.to_string(), record);
    }

    pub fn record_check(&self, host: &str, step: &str, record: StepRecord) {
        self.inner
            .lock()
            .checks
            .entry(host.to_string())
            .or_default()
            .insert(step.to_string(), record);
    }

    pub fn record_step(&self, host: &str, step: &str, record: StepRecord) {
        self.inner
            .lock()
            .steps
            .entry(host.to_string())
            .or_default()
            .insert(step.to_string(), record);
    }

    pub fn snapshot(&self) -> CallbackRecords<S> {
        self.inner.lock().clone()
    }
}
