use thiserror::Error;

/// Errors raised while driving an execution run
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateMachineError {
    #[error("Invalid state transition from {from:?} to {to:?}")]
    InvalidTransition { from: Option<String>, to: String },
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;

impl From<StateMachineError> for crate::error::RemediationError {
    fn from(err: StateMachineError) -> Self {
        crate::error::RemediationError::InvalidState(err.to_string())
    }
}
