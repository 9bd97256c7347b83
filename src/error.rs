//! Error kinds shared by every layer of the orchestrator.
//!
//! Each variant maps to one propagation policy: validation and lookup
//! failures go back to the caller untouched, timeouts are absorbed by the
//! subtask executor, and provider failures are retried once before the
//! background runner gives up.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Malformed command, bad timestamp, unknown subtask id, or a plan
    /// mutation forbidden by the lock rules. Never retried.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// Unknown session, or the session belongs to someone else.
    #[error("not found: {0}")]
    NotFound(String),

    /// A background runner already owns this session.
    #[error("a run is already in progress for this session")]
    AlreadyRunning,

    /// Execution command issued before `confirm_plan`.
    #[error("the plan has not been confirmed yet")]
    PlanNotConfirmed,

    /// Agent call exceeded its per-invocation budget.
    #[error("agent call timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The LLM provider failed after the retry.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Missing or invalid bearer token.
    #[error("unauthorized")]
    Unauthorized,

    /// Underlying storage failure (disk, serialization).
    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        OrchestratorError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Storage(err.to_string())
    }
}

impl OrchestratorError {
    /// True for errors caused by the caller rather than the system.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            OrchestratorError::ValidationFailed(_)
                | OrchestratorError::NotFound(_)
                | OrchestratorError::AlreadyRunning
                | OrchestratorError::PlanNotConfirmed
                | OrchestratorError::Unauthorized
        )
    }
}
