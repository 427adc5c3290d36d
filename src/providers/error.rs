use thiserror::Error;

/// Errors surfaced by `HistoryStore` implementations.
///
/// `ConcurrentWriteConflict` is the only variant the runtime retries: it
/// means another writer appended after the caller's read, so the caller
/// must re-read and recompute its decision.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("instance already exists: {0}")]
    InstanceExists(String),

    #[error("concurrent write conflict on {instance}: expected {expected} events, found {actual}")]
    ConcurrentWriteConflict {
        instance: String,
        expected: usize,
        actual: usize,
    },

    #[error("history cap exceeded for {instance} (cap={cap}, have={have}, append={append})")]
    CapExceeded {
        instance: String,
        cap: usize,
        have: usize,
        append: usize,
    },

    #[error("invalid append for {instance}: {reason}")]
    InvalidEvent { instance: String, reason: String },

    #[error("storage: {0}")]
    Storage(String),
}

impl HistoryError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, HistoryError::ConcurrentWriteConflict { .. })
    }
}

impl From<std::io::Error> for HistoryError {
    fn from(e: std::io::Error) -> Self {
        HistoryError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for HistoryError {
    fn from(e: serde_json::Error) -> Self {
        HistoryError::Storage(e.to_string())
    }
}
