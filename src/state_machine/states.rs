use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a single task execution run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Built but not started; also where a failed initialization lands
    #[default]
    Created,
    /// Units are being initialized to their running status
    PreHandling,
    /// The runner is executing the playbook
    Executing,
    /// Results are being assembled and persisted
    PostHandling,
    /// Every unit reported and results were persisted
    Completed,
    /// The run ended with a runner error or dangling units
    Fault,
}

impl ExecutionState {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Fault)
    }

    /// Whether the runner may still deliver callbacks for this run
    pub fn is_active(&self) -> bool {
        matches!(self, Self::PreHandling | Self::Executing | Self::PostHandling)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::PreHandling => write!(f, "pre_handling"),
            Self::Executing => write!(f, "executing"),
            Self::PostHandling => write!(f, "post_handling"),
            Self::Completed => write!(f, "completed"),
            Self::Fault => write!(f, "fault"),
        }
    }
}

impl std::str::FromStr for ExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "pre_handling" => Ok(Self::PreHandling),
            "executing" => Ok(Self::Executing),
            "post_handling" => Ok(Self::PostHandling),
            "completed" => Ok(Self::Completed),
            "fault" => Ok(Self::Fault),
            _ => Err(format!("Invalid execution state: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_round_trip() {
        for state in [
            ExecutionState::Created,
            ExecutionState::PreHandling,
            ExecutionState::Executing,
            ExecutionState::PostHandling,
            ExecutionState::Completed,
            ExecutionState::Fault,
        ] {
            assert_eq!(state.to_string().parse::<ExecutionState>(), Ok(state));
        }
        assert!("pending".parse::<ExecutionState>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(ExecutionState::Completed.is_terminal());
        assert!(ExecutionState::Fault.is_terminal());
        assert!(!ExecutionState::Created.is_terminal());
        assert!(ExecutionState::Executing.is_active());
    }
}
