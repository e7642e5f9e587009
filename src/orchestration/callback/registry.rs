//! Push-style callback routing.
//!
//! While a task executes, its handler is registered under the task id so
//! that events posted back by a remote runner reach the same accumulators
//! an in-process runner would feed.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{RemediationError, RemediationResult};
use crate::orchestration::runner::{dispatch, RunnerCallback, RunnerEvent};

#[derive(Default)]
pub struct CallbackRegistry {
    handlers: DashMap<String, Arc<dyn RunnerCallback>>,
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("registered", &self.handlers.len())
            .finish()
    }
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `task_id` until the returned guard drops
    pub fn register(
        self: &Arc<Self>,
        task_id: &str,
        callback: Arc<dyn RunnerCallback>,
    ) -> Registration {
        if self
            .handlers
            .insert(task_id.to_string(), Arc::clone(&callback))
            .is_some()
        {
            warn!(task_id = task_id, "Replaced an existing callback registration");
        }
        debug!(task_id = task_id, "Callback registered");
        Registration {
            registry: Arc::clone(self),
            task_id: task_id.to_string(),
            callback,
        }
    }

    pub fn is_registered(&self, task_id: &str) -> bool {
        self.handlers.contains_key(task_id)
    }

    /// Route an externally delivered event; `NotFound` if the task is not
    /// currently executing
    pub async fn deliver(&self, task_id: &str, event: &RunnerEvent) -> RemediationResult<()> {
        // clone out so the shard lock is not held across the await
        let handler = self
            .handlers
            .get(task_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                RemediationError::NotFound(format!("no execution in progress for task {task_id}"))
            })?;
        dispatch(handler.as_ref(), event).await;
        Ok(())
    }

    /// Only removes the entry if it still holds `callback`; a later run
    /// may have replaced it
    fn unregister(&self, task_id: &str, callback: &Arc<dyn RunnerCallback>) {
        if self
            .handlers
            .remove_if(task_id, |_, current| Arc::ptr_eq(current, callback))
            .is_some()
        {
            debug!(task_id = task_id, "Callback unregistered");
        } else {
            debug!(task_id = task_id, "Registration already superseded");
        }
    }
}

/// Removes the registration when dropped
pub struct Registration {
    registry: Arc<CallbackRegistry>,
    task_id: String,
    callback: Arc<dyn RunnerCallback>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("task_id", &self.task_id)
            .finish()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(&self.task_id, &self.callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::RunnerOutcome;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    #[async_trait]
    impl RunnerCallback for Counter {
        async fn on_unreachable(&self, _event: &RunnerEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_ok(&self, _event: &RunnerEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_failed(&self, _event: &RunnerEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn delivery_requires_a_live_registration() {
        let registry = Arc::new(CallbackRegistry::new());
        let counter = Arc::new(Counter::default());
        let event = RunnerEvent::new("h1", "cve-1", RunnerOutcome::Ok);

        {
            let _guard = registry.register("t1", counter.clone());
            registry.deliver("t1", &event).await.unwrap();
            assert!(registry.is_registered("t1"));
        }

        assert!(!registry.is_registered("t1"));
        let err = registry.deliver("t1", &event).await.unwrap_err();
        assert!(matches!(err, RemediationError::NotFound(_)));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_guard_keeps_newer_registration() {
        let registry = Arc::new(CallbackRegistry::new());
        let first = Arc::new(Counter::default());
        let second = Arc::new(Counter::default());
        let event = RunnerEvent::new("h1", "cve-1", RunnerOutcome::Ok);

        let first_guard = registry.register("t1", first.clone());
        let second_guard = registry.register("t1", second.clone());
        drop(first_guard);

        assert!(registry.is_registered("t1"));
        registry.deliver("t1", &event).await.unwrap();
        assert_eq!(first.0.load(Ordering::SeqCst), 0);
        assert_eq!(second.0.load(Ordering::SeqCst), 1);

        drop(second_guard);
        assert!(!registry.is_registered("t1"));
    }
}
