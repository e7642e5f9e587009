use serde::{Deserialize, Serialize};

/// Events that drive an execution run between states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ExecutionEvent {
    /// Begin initialization
    Start,
    /// Units initialized, hand the playbook to the runner
    Initialized,
    /// Initialization write failed; the run never started
    InitFailed(String),
    /// The runner returned and every callback was delivered
    RunnerFinished,
    /// Results persisted and no unit was left running
    ResultsPersisted,
    /// The run cannot complete normally
    Fault(String),
}

impl ExecutionEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Initialized => "initialized",
            Self::InitFailed(_) => "init_failed",
            Self::RunnerFinished => "runner_finished",
            Self::ResultsPersisted => "results_persisted",
            Self::Fault(_) => "fault",
        }
    }

    /// Extract error message if this is a failure event
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::InitFailed(msg) | Self::Fault(msg) => Some(msg),
            _ => None,
        }
    }
}
