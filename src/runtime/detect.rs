use std::collections::HashSet;

use crate::{Event, ReplayMismatch, describe_schedule};

/// Scheduled events from history that the orchestrator did not reproduce this turn.
pub fn detect_unclaimed_schedules(recorded: &[Event], claimed: usize) -> Option<ReplayMismatch> {
    let first = recorded.get(claimed)?;
    Some(ReplayMismatch(format!(
        "history schedules {} more operations starting with {} that the orchestrator no longer schedules",
        recorded.len() - claimed,
        describe_schedule(first)
    )))
}

/// What to do with an activity or timer completion arriving for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionDisposition {
    /// Append it and replay.
    Accept,
    /// The instance already reached a terminal event.
    InstanceTerminal,
    /// The work was started by an earlier run of this instance id.
    StaleExecution,
    /// A completion for this seq is already recorded.
    Duplicate,
    /// No schedule with this seq exists.
    UnknownSeq,
}

/// The `execution_id` recorded in `OrchestratorStarted`, if the instance started.
pub fn execution_id(history: &[Event]) -> Option<&str> {
    match history.first() {
        Some(Event::OrchestratorStarted { execution_id, .. }) => Some(execution_id.as_str()),
        _ => None,
    }
}

pub fn classify_completion(history: &[Event], execution: &str, seq: u64) -> CompletionDisposition {
    if execution_id(history) != Some(execution) {
        return CompletionDisposition::StaleExecution;
    }
    if history.iter().any(Event::is_terminal) {
        return CompletionDisposition::InstanceTerminal;
    }
    let mut scheduled = false;
    for e in history {
        if e.seq() != Some(seq) {
            continue;
        }
        if e.is_completion() {
            return CompletionDisposition::Duplicate;
        }
        scheduled |= e.is_schedule();
    }
    if scheduled {
        CompletionDisposition::Accept
    } else {
        CompletionDisposition::UnknownSeq
    }
}

fn completed_seqs(history: &[Event]) -> HashSet<u64> {
    history
        .iter()
        .filter(|e| e.is_completion())
        .filter_map(Event::seq)
        .collect()
}

/// Activities scheduled in history that have no completion yet, in schedule order.
pub fn outstanding_activities(history: &[Event]) -> Vec<(u64, String, String)> {
    let completed = completed_seqs(history);
    history
        .iter()
        .filter_map(|e| match e {
            Event::ActivityScheduled { seq, name, input } if !completed.contains(seq) => {
                Some((*seq, name.clone(), input.clone()))
            }
            _ => None,
        })
        .collect()
}

/// Timers created in history that have not fired yet, as `(seq, fire_at_ms)`.
pub fn outstanding_timers(history: &[Event]) -> Vec<(u64, u64)> {
    let completed = completed_seqs(history);
    history
        .iter()
        .filter_map(|e| match e {
            Event::TimerCreated { seq, fire_at_ms } if !completed.contains(seq) => Some((*seq, *fire_at_ms)),
            _ => None,
        })
        .collect()
}
