//! # Error Types
//!
//! Crate-wide error enum plus the caller-facing result codes.
//!
//! Errors are returned, never thrown across the orchestration boundary:
//! persistence and not-found failures are translated at each store call,
//! runner failures surface to the task manager, and usage errors are
//! rejected before any state is touched.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::database::StoreError;

#[derive(Debug, Error)]
pub enum RemediationError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Insert failed: {0}")]
    InsertFailed(String),

    #[error("Update failed: {0}")]
    UpdateFailed(String),

    #[error("Runner error: {0}")]
    Runner(String),

    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Task {0} is running")]
    TaskIsRunning(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type RemediationResult<T> = Result<T, RemediationError>;

impl From<StoreError> for RemediationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Database(msg) => Self::Persistence(msg),
        }
    }
}

impl From<sqlx::Error> for RemediationError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            other => Self::Persistence(other.to_string()),
        }
    }
}

impl RemediationError {
    pub fn code(&self) -> ResultCode {
        ResultCode::from(self)
    }

    /// Translate a store failure raised while creating rows
    pub fn on_insert(err: StoreError) -> Self {
        match err {
            StoreError::Database(msg) => Self::InsertFailed(msg),
            other => other.into(),
        }
    }

    /// Translate a store failure raised while changing existing rows
    pub fn on_update(err: StoreError) -> Self {
        match err {
            StoreError::Database(msg) => Self::UpdateFailed(msg),
            other => other.into(),
        }
    }
}

/// Status code reported to callers of the query and mutation surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    Succeed,
    PartialSucceed,
    NoData,
    DatabaseQueryError,
    DatabaseUpdateError,
    DatabaseInsertError,
    ParamError,
    ServerError,
    TaskIsRunning,
}

impl From<&RemediationError> for ResultCode {
    fn from(err: &RemediationError) -> Self {
        match err {
            RemediationError::NotFound(_) => Self::NoData,
            RemediationError::Persistence(_) => Self::DatabaseQueryError,
            RemediationError::InsertFailed(_) => Self::DatabaseInsertError,
            RemediationError::UpdateFailed(_) => Self::DatabaseUpdateError,
            RemediationError::Usage(_) | RemediationError::Validation(_) => Self::ParamError,
            RemediationError::TaskIsRunning(_) => Self::TaskIsRunning,
            RemediationError::Runner(_)
            | RemediationError::InvalidState(_)
            | RemediationError::Configuration(_)
            | RemediationError::Serialization(_) => Self::ServerError,
        }
    }
}

/// Outcome of a bulk operation naming several keys.
///
/// `missing` lists the requested keys that did not exist; `result` holds
/// everything that did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partial<T> {
    pub result: T,
    pub missing: Vec<String>,
}

impl<T> Partial<T> {
    pub fn complete(result: T) -> Self {
        Self {
            result,
            missing: Vec::new(),
        }
    }

    pub fn new(result: T, missing: Vec<String>) -> Self {
        Self { result, missing }
    }

    pub fn code(&self) -> ResultCode {
        if self.missing.is_empty() {
            ResultCode::Succeed
        } else {
            ResultCode::PartialSucceed
        }
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_translate_to_codes() {
        let not_found: RemediationError = StoreError::NotFound("task t1".into()).into();
        assert_eq!(not_found.code(), ResultCode::NoData);

        let db: RemediationError = StoreError::Database("connection reset".into()).into();
        assert_eq!(db.code(), ResultCode::DatabaseQueryError);

        let insert = RemediationError::on_insert(StoreError::Database("duplicate key".into()));
        assert_eq!(insert.code(), ResultCode::DatabaseInsertError);
        let update = RemediationError::on_update(StoreError::Database("deadlock".into()));
        assert_eq!(update.code(), ResultCode::DatabaseUpdateError);
        let missing = RemediationError::on_update(StoreError::NotFound("unit".into()));
        assert_eq!(missing.code(), ResultCode::NoData);

        assert_eq!(
            RemediationError::Usage("mode".into()).code(),
            ResultCode::ParamError
        );
    }

    #[test]
    fn partial_outcome_code() {
        assert_eq!(Partial::complete(1).code(), ResultCode::Succeed);
        assert_eq!(
            Partial::new(1, vec!["t2".into()]).code(),
            ResultCode::PartialSucceed
        );
    }
}
