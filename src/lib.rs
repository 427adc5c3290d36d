//! Deterministic replay orchestration core in the style of the Durable Task Framework.
//!
//! Orchestrations are ordinary async Rust functions that await activity
//! results through an `OrchestrationContext`. The engine records every
//! decision as an append-only `Event` and, on each new completion, re-runs
//! the orchestrator from the start against that history. Awaits whose
//! completion is already recorded resolve immediately; the first await
//! without one suspends the turn and becomes a new `ActivityScheduled`
//! (or `TimerCreated`) event. It provides:
//!
//! - Public data model: `Event`, `Action`
//! - Turn driver: `run_turn`, `run_turn_with`, and `Executor`
//! - `DurableFuture` and `JoinFuture` for sequential and fan-out awaits,
//!   `TimerFuture` for durable delays
//! - Replay-safe helpers: `new_guid`, `current_utc_ms`, `is_replaying`
//! - An in-process `Runtime` that persists history via a `HistoryStore`
//!   and dispatches activities on tokio tasks
use std::future::Future;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

use serde::{Deserialize, Serialize};

pub mod error;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod runtime;

pub use crate::error::{ActivityError, ReplayMismatch, RuntimeError};
pub use crate::futures::{DurableFuture, JoinFuture, TimerFuture};
pub use runtime::registry::{ActivityRegistry, OrchestrationRegistry};
pub use runtime::{InstanceInfo, OrchestrationStatus, RetryPolicy, Runtime, RuntimeOptions};

use crate::_typed_codec::Codec;

// Internal codec utilities for typed I/O (kept private; public API remains ergonomic)
mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;
    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }
    pub struct Json;
    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            // Plain strings travel unquoted so string and typed APIs interoperate
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(_) => {
                    let val = Value::String(s.to_string());
                    serde_json::from_value(val).map_err(|e| e.to_string())
                }
            }
        }
    }
}

/// Wall-clock milliseconds since the epoch. Only used where the value is
/// recorded in history before anything replays it.
pub(crate) fn wall_clock_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Append-only orchestration history entries persisted by a provider and
/// consumed during replay. Activity and timer events share one per-instance
/// sequence space that pairs each schedule with its single completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// Instance was started by orchestration name with input.
    OrchestratorStarted {
        name: String,
        input: String,
        timestamp_ms: u64,
        /// Identifies this run of the instance id. Work started by an earlier,
        /// purged run carries a different value and is ignored.
        #[serde(default)]
        execution_id: String,
    },
    /// Activity was scheduled under a fresh sequence number.
    ActivityScheduled { seq: u64, name: String, input: String },
    /// Activity completed successfully with a result.
    ActivityCompleted { seq: u64, result: String },
    /// Activity failed with an error string.
    ActivityFailed { seq: u64, error: String },
    /// Durable timer created; it fires at `fire_at_ms` (epoch milliseconds).
    TimerCreated { seq: u64, fire_at_ms: u64 },
    /// Durable timer fired.
    TimerFired { seq: u64, fire_at_ms: u64 },
    /// Orchestrator returned a value.
    OrchestratorCompleted { result: String },
    /// Orchestrator failed: unhandled activity error, replay mismatch, or unknown orchestration.
    OrchestratorFailed { error: String },
    /// Instance was terminated by a client request.
    OrchestratorTerminated { reason: String },
}

impl Event {
    /// Sequence number for activity and timer events.
    pub fn seq(&self) -> Option<u64> {
        match self {
            Event::ActivityScheduled { seq, .. }
            | Event::ActivityCompleted { seq, .. }
            | Event::ActivityFailed { seq, .. }
            | Event::TimerCreated { seq, .. }
            | Event::TimerFired { seq, .. } => Some(*seq),
            _ => None,
        }
    }

    /// True for the events that open a seq: `ActivityScheduled` and `TimerCreated`.
    pub fn is_schedule(&self) -> bool {
        matches!(self, Event::ActivityScheduled { .. } | Event::TimerCreated { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestratorCompleted { .. } | Event::OrchestratorFailed { .. } | Event::OrchestratorTerminated { .. }
        )
    }

    /// True for the events that close a seq.
    pub fn is_completion(&self) -> bool {
        matches!(
            self,
            Event::ActivityCompleted { .. } | Event::ActivityFailed { .. } | Event::TimerFired { .. }
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Event::OrchestratorStarted { .. } => "OrchestratorStarted",
            Event::ActivityScheduled { .. } => "ActivityScheduled",
            Event::ActivityCompleted { .. } => "ActivityCompleted",
            Event::ActivityFailed { .. } => "ActivityFailed",
            Event::TimerCreated { .. } => "TimerCreated",
            Event::TimerFired { .. } => "TimerFired",
            Event::OrchestratorCompleted { .. } => "OrchestratorCompleted",
            Event::OrchestratorFailed { .. } => "OrchestratorFailed",
            Event::OrchestratorTerminated { .. } => "OrchestratorTerminated",
        }
    }
}

/// Declarative decisions produced by an orchestration turn. The runtime
/// persists the matching `Event`s before materializing them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Schedule an activity invocation.
    CallActivity { seq: u64, name: String, input: String },
    /// Arm a durable timer.
    CreateTimer { seq: u64, fire_at_ms: u64 },
}

// Short form of a schedule event for mismatch messages.
pub(crate) fn describe_schedule(ev: &Event) -> String {
    match ev {
        Event::ActivityScheduled { seq, name, input } => format!("ActivityScheduled('{name}','{input}') seq={seq}"),
        Event::TimerCreated { seq, fire_at_ms } => format!("TimerCreated(fire_at_ms={fire_at_ms}) seq={seq}"),
        other => other.kind_name().to_string(),
    }
}

#[derive(Debug)]
struct CtxInner {
    instance: String,
    history: Vec<Event>,
    actions: Vec<Action>,

    // Schedules recorded before this turn, in history order, and the cursor
    // of the next one the orchestrator must reproduce.
    recorded_schedules: Vec<Event>,
    next_claim: usize,
    next_seq: u64,

    recorded_completions: usize,
    delivered_completions: usize,
    produced_new_work: bool,

    start_ms: u64,
    // start_ms advanced to the fire time of each timer delivered this turn
    clock_ms: u64,
    guid_counter: u64,
    mismatch: Option<ReplayMismatch>,
}

impl CtxInner {
    fn new(instance: String, history: Vec<Event>) -> Self {
        let mut recorded_schedules = Vec::new();
        let mut recorded_completions = 0;
        let mut start_ms = 0;
        for ev in &history {
            match ev {
                e if e.is_schedule() => recorded_schedules.push(e.clone()),
                e if e.is_completion() => recorded_completions += 1,
                Event::OrchestratorStarted { timestamp_ms, .. } => start_ms = *timestamp_ms,
                _ => {}
            }
        }
        let next_seq = recorded_schedules.last().and_then(Event::seq).map_or(1, |s| s + 1);
        Self {
            instance,
            history,
            actions: Vec::new(),
            recorded_schedules,
            next_claim: 0,
            next_seq,
            recorded_completions,
            delivered_completions: 0,
            produced_new_work: false,
            start_ms,
            clock_ms: start_ms,
            guid_counter: 0,
            mismatch: None,
        }
    }

    fn diverged(&mut self, recorded: &Event, produced: String) {
        self.mismatch = Some(ReplayMismatch(format!(
            "schedule #{} is {} in history but the orchestrator scheduled {produced}",
            self.next_claim + 1,
            describe_schedule(recorded),
        )));
    }

    fn allocate_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.produced_new_work = true;
        seq
    }

    /// Claim the sequence number for the next activity the orchestrator schedules.
    /// Returns `None` once a mismatch has been recorded.
    fn claim_activity(&mut self, name: &str, input: &str) -> Option<u64> {
        if self.mismatch.is_some() {
            return None;
        }
        if let Some(recorded) = self.recorded_schedules.get(self.next_claim).cloned() {
            match &recorded {
                Event::ActivityScheduled { seq, name: n, input: i } if n == name && i == input => {
                    self.next_claim += 1;
                    return Some(*seq);
                }
                _ => {
                    self.diverged(&recorded, format!("('{name}','{input}')"));
                    return None;
                }
            }
        }
        let seq = self.allocate_seq();
        self.history.push(Event::ActivityScheduled {
            seq,
            name: name.to_string(),
            input: input.to_string(),
        });
        self.actions.push(Action::CallActivity {
            seq,
            name: name.to_string(),
            input: input.to_string(),
        });
        Some(seq)
    }

    /// Claim the sequence number for the next timer. A new timer fires
    /// `delay_ms` after the wall clock at the moment it is first recorded.
    fn claim_timer(&mut self, delay_ms: u64) -> Option<u64> {
        if self.mismatch.is_some() {
            return None;
        }
        if let Some(recorded) = self.recorded_schedules.get(self.next_claim).cloned() {
            if let Event::TimerCreated { seq, .. } = recorded {
                self.next_claim += 1;
                return Some(seq);
            }
            self.diverged(&recorded, format!("a timer of {delay_ms}ms"));
            return None;
        }
        let seq = self.allocate_seq();
        let fire_at_ms = wall_clock_ms().saturating_add(delay_ms);
        self.history.push(Event::TimerCreated { seq, fire_at_ms });
        self.actions.push(Action::CreateTimer { seq, fire_at_ms });
        Some(seq)
    }

    fn timer_fired(&mut self, seq: u64) -> bool {
        let fired = self.history.iter().find_map(|e| match e {
            Event::TimerFired { seq: s, fire_at_ms } if *s == seq => Some(*fire_at_ms),
            _ => None,
        });
        match fired {
            Some(fire_at_ms) => {
                self.delivered_completions += 1;
                self.clock_ms = self.clock_ms.max(fire_at_ms);
                true
            }
            None => false,
        }
    }

    fn completion_for(&mut self, seq: u64) -> Option<Result<String, String>> {
        let out = self.history.iter().find_map(|e| match e {
            Event::ActivityCompleted { seq: s, result } if *s == seq => Some(Ok(result.clone())),
            Event::ActivityFailed { seq: s, error } if *s == seq => Some(Err(error.clone())),
            _ => None,
        })?;
        self.delivered_completions += 1;
        Some(out)
    }
}

/// User-facing orchestration context for scheduling and replay-safe helpers.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Construct a new context for `instance` from an existing history vector.
    pub fn new(instance: impl Into<String>, history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance.into(), history))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance.clone()
    }

    /// True while this turn is still re-delivering recorded completions and
    /// has not scheduled anything new.
    pub fn is_replaying(&self) -> bool {
        let inner = self.lock();
        !inner.produced_new_work && inner.delivered_completions < inner.recorded_completions
    }

    /// Replay-safe clock: the start timestamp recorded in `OrchestratorStarted`,
    /// moved forward to the fire time of every timer the orchestrator has
    /// awaited so far.
    pub fn current_utc_ms(&self) -> u64 {
        self.lock().clock_ms
    }

    /// Deterministic UUID (v5) derived from the instance id, its recorded
    /// start time and a per-turn counter. Identical on every replay as long
    /// as calls happen in the same order.
    pub fn new_guid(&self) -> String {
        let mut inner = self.lock();
        let name = format!("{}_{}_{}", inner.instance, inner.start_ms, inner.guid_counter);
        inner.guid_counter += 1;
        uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
    }

    /// Schedule an activity and return a `DurableFuture` correlated to it by
    /// sequence number. Nothing is recorded until the future is first polled.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        DurableFuture::new(self.clone(), name.into(), input.into())
    }

    /// Typed helper: serializes input and decodes the activity result.
    pub fn schedule_activity_typed<In: Serialize, Out: serde::de::DeserializeOwned + Send>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> impl Future<Output = Result<Out, String>> + Send {
        let fut = _typed_codec::Json::encode(input).map(|payload| self.schedule_activity(name, payload));
        async move {
            let raw = fut?.await?;
            _typed_codec::Json::decode::<Out>(&raw)
        }
    }

    /// Durable delay. Resolves once the runtime records `TimerFired`.
    pub fn schedule_timer(&self, delay_ms: u64) -> TimerFuture {
        TimerFuture::new(self.clone(), delay_ms)
    }

    /// Call an activity, rescheduling it as a fresh call after each failure.
    ///
    /// Between attempts the orchestrator waits on a durable timer of
    /// `policy.next_delay(attempt)`. It gives up with the last error once
    /// `policy.max_attempts` calls have failed, or when the next attempt
    /// would start later than `policy.timeout` after the first one.
    pub async fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: &RetryPolicy,
    ) -> Result<String, String> {
        let name: String = name.into();
        let input: String = input.into();
        let first_attempt_ms = self.current_utc_ms();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let err = match self.schedule_activity(name.clone(), input.clone()).await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            if !policy.should_retry(attempts) {
                return Err(err);
            }
            let delay_ms = policy.next_delay(attempts).as_millis() as u64;
            if let Some(limit) = policy.timeout {
                let elapsed = self.current_utc_ms().saturating_sub(first_attempt_ms);
                if elapsed.saturating_add(delay_ms) > limit.as_millis() as u64 {
                    return Err(err);
                }
            }
            self.schedule_timer(delay_ms).await;
        }
    }

    /// Await several activities concurrently. Activities are scheduled in
    /// vector order; results come back in the same order.
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture::new(futures)
    }

    pub(crate) fn claim_activity(&self, name: &str, input: &str) -> Option<u64> {
        self.lock().claim_activity(name, input)
    }

    pub(crate) fn completion_for(&self, seq: u64) -> Option<Result<String, String>> {
        self.lock().completion_for(seq)
    }

    pub(crate) fn claim_timer(&self, delay_ms: u64) -> Option<u64> {
        self.lock().claim_timer(delay_ms)
    }

    pub(crate) fn timer_fired(&self, seq: u64) -> bool {
        self.lock().timer_fired(seq)
    }

    fn into_turn<O>(self, output: Option<O>) -> Turn<O> {
        let mut inner = self.lock();
        let mismatch = inner
            .mismatch
            .take()
            .or_else(|| runtime::detect::detect_unclaimed_schedules(&inner.recorded_schedules, inner.next_claim));
        Turn {
            history: std::mem::take(&mut inner.history),
            actions: std::mem::take(&mut inner.actions),
            output,
            mismatch,
        }
    }
}

/// Result of polling an orchestrator once over a history.
#[derive(Debug)]
pub struct Turn<O> {
    /// Input history plus any schedule events recorded this turn.
    pub history: Vec<Event>,
    /// New work requested this turn, in scheduling order.
    pub actions: Vec<Action>,
    /// Set when the orchestrator ran to completion.
    pub output: Option<O>,
    /// Set when the history diverges from what the orchestrator produced.
    pub mismatch: Option<ReplayMismatch>,
}

/// Poll the orchestrator once with the provided history.
pub fn run_turn<O, F>(history: Vec<Event>, orchestrator: impl FnOnce(OrchestrationContext) -> F) -> Turn<O>
where
    F: Future<Output = O>,
{
    run_turn_with("", history, orchestrator)
}

/// Same as `run_turn` but binds the context to an instance id, which feeds
/// `new_guid` and the replay-safe logging macros.
pub fn run_turn_with<O, F>(
    instance: &str,
    history: Vec<Event>,
    orchestrator: impl FnOnce(OrchestrationContext) -> F,
) -> Turn<O>
where
    F: Future<Output = O>,
{
    if let Err(reason) = providers::validate_history(&history) {
        return Turn {
            history,
            actions: Vec::new(),
            output: None,
            mismatch: Some(ReplayMismatch(reason)),
        };
    }
    let ctx = OrchestrationContext::new(instance, history);
    let polled = {
        let mut fut = pin!(orchestrator(ctx.clone()));
        let mut cx = Context::from_waker(Waker::noop());
        fut.as_mut().poll(&mut cx)
    };
    let output = match polled {
        Poll::Ready(out) => Some(out),
        Poll::Pending => None,
    };
    ctx.into_turn(output)
}

/// Helper for single-threaded, host-driven execution in tests and samples.
pub struct Executor;

impl Executor {
    /// Drives an orchestrator by alternately replaying one turn and invoking
    /// `execute_actions` to append completions for the requested actions,
    /// until the orchestrator completes.
    pub fn drive_to_completion<O, F, X>(
        instance: &str,
        mut history: Vec<Event>,
        orchestrator: impl Fn(OrchestrationContext) -> F,
        mut execute_actions: X,
    ) -> Result<(Vec<Event>, O), String>
    where
        F: Future<Output = O>,
        X: FnMut(Vec<Action>, &mut Vec<Event>),
    {
        loop {
            let turn = run_turn_with(instance, history, &orchestrator);
            if let Some(m) = turn.mismatch {
                return Err(m.to_string());
            }
            history = turn.history;
            if let Some(out) = turn.output {
                return Ok((history, out));
            }
            let before = history.len();
            execute_actions(turn.actions, &mut history);
            if history.len() == before {
                return Err("orchestrator stalled: no completions were appended".to_string());
            }
        }
    }
}
