use thiserror::Error;

use crate::providers::HistoryError;

/// Outcome classification for a failed activity invocation.
///
/// `Failed` is an application error: it is recorded once as
/// `ActivityFailed` and surfaces at the orchestrator's await point.
/// `Transient` asks the dispatcher to run the activity again with backoff.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActivityError {
    #[error("{0}")]
    Failed(String),

    #[error("transient: {0}")]
    Transient(String),
}

impl ActivityError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<String> for ActivityError {
    fn from(msg: String) -> Self {
        Self::Failed(msg)
    }
}

/// Recorded history does not match what re-executing the orchestrator produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("nondeterministic: {0}")]
pub struct ReplayMismatch(pub String);

/// Errors returned by the client-facing `Runtime` API.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("orchestration not registered: {0}")]
    UnknownOrchestration(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("instance already exists: {0}")]
    InstanceExists(String),

    #[error("instance {0} has not reached a terminal state")]
    NotTerminal(String),

    #[error("timed out waiting for instance {0}")]
    Timeout(String),

    #[error("codec: {0}")]
    Codec(String),

    #[error("gave up on instance {instance} after {attempts} conflicting writes")]
    ConflictRetriesExhausted { instance: String, attempts: u32 },

    #[error(transparent)]
    History(HistoryError),
}

impl From<HistoryError> for RuntimeError {
    fn from(e: HistoryError) -> Self {
        match e {
            HistoryError::InstanceNotFound(id) => RuntimeError::InstanceNotFound(id),
            HistoryError::InstanceExists(id) => RuntimeError::InstanceExists(id),
            other => RuntimeError::History(other),
        }
    }
}
