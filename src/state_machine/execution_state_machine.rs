use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    errors::{StateMachineError, StateMachineResult},
    events::ExecutionEvent,
    states::ExecutionState,
};

/// One applied transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: ExecutionState,
    pub to: ExecutionState,
    pub event: String,
    pub error: Option<String>,
    pub at: i64,
}

/// In-memory state machine for a single execution run. Transitions are not
/// persisted; the durable outcome of a run lives in the unit statuses.
#[derive(Debug, Clone)]
pub struct ExecutionStateMachine {
    task_id: String,
    state: ExecutionState,
    history: Vec<TransitionRecord>,
}

impl ExecutionStateMachine {
    pub fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            state: ExecutionState::default(),
            history: Vec::new(),
        }
    }

    pub fn current_state(&self) -> ExecutionState {
        self.state
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    pub fn into_history(self) -> Vec<TransitionRecord> {
        self.history
    }

    /// Attempt to transition the run
    pub fn transition(&mut self, event: ExecutionEvent) -> StateMachineResult<ExecutionState> {
        let current_state = self.state;
        let target_state = determine_target_state(current_state, &event)?;

        debug!(
            task_id = %self.task_id,
            from = %current_state,
            to = %target_state,
            event = event.event_type(),
            "Execution state transition"
        );

        self.history.push(TransitionRecord {
            from: current_state,
            to: target_state,
            event: event.event_type().to_string(),
            error: event.error_message().map(str::to_string),
            at: Utc::now().timestamp(),
        });
        self.state = target_state;
        Ok(target_state)
    }
}

/// Determine the target state based on current state and event
pub fn determine_target_state(
    current_state: ExecutionState,
    event: &ExecutionEvent,
) -> StateMachineResult<ExecutionState> {
    let target = match (current_state, event) {
        (ExecutionState::Created, ExecutionEvent::Start) => ExecutionState::PreHandling,

        // a failed initialization leaves the task as if never started
        (ExecutionState::PreHandling, ExecutionEvent::Initialized) => ExecutionState::Executing,
        (ExecutionState::PreHandling, ExecutionEvent::InitFailed(_)) => ExecutionState::Created,

        (ExecutionState::Executing, ExecutionEvent::RunnerFinished) => {
            ExecutionState::PostHandling
        }
        (ExecutionState::PostHandling, ExecutionEvent::ResultsPersisted) => {
            ExecutionState::Completed
        }

        (ExecutionState::Executing | ExecutionState::PostHandling, ExecutionEvent::Fault(_)) => {
            ExecutionState::Fault
        }

        (from_state, _) => {
            return Err(StateMachineError::InvalidTransition {
                from: Some(from_state.to_string()),
                to: format!("{event:?}"),
            })
        }
    };

    Ok(target)
}
