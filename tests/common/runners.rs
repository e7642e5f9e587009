//! Runner doubles that replay scripted events instead of driving a process.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Notify;

use remediation_core::orchestration::runner::dispatch;
use remediation_core::orchestration::{
    CallbackRegistry, PlaybookRunner, PreparedRun, RunnerCallback, RunnerError, RunnerEvent,
};

/// Delivers its script concurrently to the callback, optionally failing
/// after the first `fail_after` events
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    events: Mutex<Vec<RunnerEvent>>,
    fail_after: Option<usize>,
    runs: AtomicUsize,
    prepared: Mutex<Vec<PreparedRun>>,
}

impl ScriptedRunner {
    pub fn new(events: Vec<RunnerEvent>) -> Self {
        Self {
            events: Mutex::new(events),
            ..Default::default()
        }
    }

    pub fn failing_after(events: Vec<RunnerEvent>, delivered: usize) -> Self {
        Self {
            events: Mutex::new(events),
            fail_after: Some(delivered),
            ..Default::default()
        }
    }

    /// Replace the script for later runs
    pub fn set_events(&self, events: Vec<RunnerEvent>) {
        *self.events.lock() = events;
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn last_prepared(&self) -> Option<PreparedRun> {
        self.prepared.lock().last().cloned()
    }
}

#[async_trait]
impl PlaybookRunner for ScriptedRunner {
    async fn run(
        &self,
        _task_id: &str,
        prepared: &PreparedRun,
        callback: Arc<dyn RunnerCallback>,
    ) -> Result<(), RunnerError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.prepared.lock().push(prepared.clone());

        let events = self.events.lock().clone();
        let delivered = self.fail_after.map_or(events.len(), |n| n.min(events.len()));
        join_all(
            events[..delivered]
                .iter()
                .map(|event| dispatch(callback.as_ref(), event)),
        )
        .await;

        if self.fail_after.is_some() {
            return Err(RunnerError::Exited {
                code: Some(4),
                stderr: "connection reset by peer".to_string(),
            });
        }
        Ok(())
    }
}

/// Posts its script back through the callback registry, the way a remote
/// runner reporting over the network would
#[derive(Debug, Default)]
pub struct RemoteRunner {
    registry: OnceLock<Arc<CallbackRegistry>>,
    events: Mutex<Vec<RunnerEvent>>,
    rejected: AtomicUsize,
}

impl RemoteRunner {
    pub fn new(events: Vec<RunnerEvent>) -> Self {
        Self {
            events: Mutex::new(events),
            ..Default::default()
        }
    }

    pub fn attach(&self, registry: Arc<CallbackRegistry>) {
        let _ = self.registry.set(registry);
    }

    /// Events the registry refused to route
    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlaybookRunner for RemoteRunner {
    async fn run(
        &self,
        task_id: &str,
        _prepared: &PreparedRun,
        _callback: Arc<dyn RunnerCallback>,
    ) -> Result<(), RunnerError> {
        let registry = self
            .registry
            .get()
            .ok_or_else(|| RunnerError::Spawn("runner not attached to a registry".to_string()))?;
        let events = self.events.lock().clone();
        for event in &events {
            if registry.deliver(task_id, event).await.is_err() {
                self.rejected.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

/// Panics mid-run after delivering its script
#[derive(Debug, Default)]
pub struct PanickingRunner {
    events: Vec<RunnerEvent>,
}

impl PanickingRunner {
    pub fn new(events: Vec<RunnerEvent>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl PlaybookRunner for PanickingRunner {
    async fn run(
        &self,
        _task_id: &str,
        _prepared: &PreparedRun,
        callback: Arc<dyn RunnerCallback>,
    ) -> Result<(), RunnerError> {
        for event in &self.events {
            dispatch(callback.as_ref(), event).await;
        }
        panic!("runner crashed");
    }
}

/// Blocks inside `run` until released, then delivers its script
#[derive(Debug, Default)]
pub struct GatedRunner {
    events: Vec<RunnerEvent>,
    started: Notify,
    release: Notify,
    runs: AtomicUsize,
}

impl GatedRunner {
    pub fn new(events: Vec<RunnerEvent>) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }

    /// Resolves once a run is parked at the gate
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    /// Let one parked (or the next) run continue
    pub fn release(&self) {
        self.release.notify_one();
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlaybookRunner for GatedRunner {
    async fn run(
        &self,
        _task_id: &str,
        _prepared: &PreparedRun,
        callback: Arc<dyn RunnerCallback>,
    ) -> Result<(), RunnerError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        self.release.notified().await;
        for event in &self.events {
            dispatch(callback.as_ref(), event).await;
        }
        Ok(())
    }
}
