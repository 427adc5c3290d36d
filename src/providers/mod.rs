use std::collections::{HashMap, HashSet};

use crate::Event;

mod error;
pub use error::HistoryError;

/// Storage abstraction for append-only orchestration history per instance.
///
/// Appends are optimistic: the caller passes the history length it last
/// observed and the store rejects the write with
/// `HistoryError::ConcurrentWriteConflict` if anything was appended since.
/// An accepted append is visible in full to every subsequent `read`.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create a new, empty instance. Fails if the instance already exists.
    async fn create_instance(&self, instance: &str) -> Result<(), HistoryError>;

    /// Read the full ordered history for an instance.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, HistoryError>;

    /// Append events if the stored history still has `expected_len` events.
    /// Returns the new history length.
    async fn append(&self, instance: &str, expected_len: usize, new_events: Vec<Event>)
    -> Result<usize, HistoryError>;

    /// Enumerate known instances.
    async fn list_instances(&self) -> Result<Vec<String>, HistoryError>;

    /// Remove an instance and its history.
    async fn remove_instance(&self, instance: &str) -> Result<(), HistoryError>;
}

/// Check the structural invariants of a history sequence.
///
/// Schedule sequence numbers (activities and timers share one space) must
/// strictly increase, every completion must reference an earlier schedule
/// of the same kind and appear at most once, and nothing may follow a
/// terminal event.
pub fn validate_history(events: &[Event]) -> Result<(), String> {
    let mut last_seq = 0u64;
    // seq -> whether it is a timer
    let mut scheduled: HashMap<u64, bool> = HashMap::new();
    let mut completed: HashSet<u64> = HashSet::new();
    let mut terminal_at: Option<usize> = None;
    for (idx, ev) in events.iter().enumerate() {
        if let Some(t) = terminal_at {
            return Err(format!("{} at #{idx} follows terminal event at #{t}", ev.kind_name()));
        }
        match ev {
            Event::OrchestratorStarted { .. } if idx != 0 => {
                return Err(format!("OrchestratorStarted must be the first event, found at #{idx}"));
            }
            Event::ActivityScheduled { seq, .. } | Event::TimerCreated { seq, .. } => {
                if *seq <= last_seq {
                    return Err(format!("{} seq={seq} at #{idx} does not follow seq={last_seq}", ev.kind_name()));
                }
                last_seq = *seq;
                scheduled.insert(*seq, matches!(ev, Event::TimerCreated { .. }));
            }
            Event::ActivityCompleted { seq, .. } | Event::ActivityFailed { seq, .. } | Event::TimerFired { seq, .. } => {
                let is_timer = matches!(ev, Event::TimerFired { .. });
                if scheduled.get(seq) != Some(&is_timer) {
                    return Err(format!("{} seq={seq} at #{idx} has no matching schedule", ev.kind_name()));
                }
                if !completed.insert(*seq) {
                    return Err(format!("duplicate completion for seq={seq} at #{idx}"));
                }
            }
            e if e.is_terminal() => terminal_at = Some(idx),
            _ => {}
        }
    }
    Ok(())
}

/// Shared append guard used by the bundled stores.
pub(crate) fn check_append(
    instance: &str,
    existing: &[Event],
    expected_len: usize,
    new_events: &[Event],
    cap: usize,
) -> Result<(), HistoryError> {
    if existing.len() != expected_len {
        return Err(HistoryError::ConcurrentWriteConflict {
            instance: instance.to_string(),
            expected: expected_len,
            actual: existing.len(),
        });
    }
    // a lone terminal event may close a history that is already at the cap
    let limit = match new_events {
        [only] if only.is_terminal() => cap.saturating_add(1),
        _ => cap,
    };
    if existing.len() + new_events.len() > limit {
        return Err(HistoryError::CapExceeded {
            instance: instance.to_string(),
            cap,
            have: existing.len(),
            append: new_events.len(),
        });
    }
    let combined: Vec<Event> = existing.iter().chain(new_events.iter()).cloned().collect();
    validate_history(&combined).map_err(|reason| HistoryError::InvalidEvent {
        instance: instance.to_string(),
        reason,
    })
}

/// Default maximum number of events per instance for the bundled stores.
pub const DEFAULT_HISTORY_CAP: usize = 1024;

/// In-memory provider for tests.
pub mod in_memory;
/// Filesystem-backed provider for local development.
pub mod fs;
