use crate::_typed_codec::{Codec, Json};
use crate::providers::HistoryStore;
use crate::providers::in_memory::InMemoryHistoryStore;
use crate::{Action, Event, OrchestrationContext, RuntimeError};
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub mod detect;
pub mod dispatch;
mod options;
pub mod registry;
pub mod replay;
pub mod timers;

use detect::CompletionDisposition;
use dispatch::{ActivityCompletion, ActivityDispatcher, ActivityTask};
use timers::{TimerService, TimerTask};
pub use options::{RetryPolicy, RuntimeOptions};
pub use registry::{ActivityRegistry, OrchestrationRegistry, OrchestrationRegistryBuilder};
use replay::{DefaultReplayEngine, ReplayEngine};

/// High-level orchestration status derived from history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    /// Instance exists but has not recorded `OrchestratorStarted` yet.
    Pending,
    Running,
    Completed { output: String },
    Failed { error: String },
    Terminated { reason: String },
}

impl OrchestrationStatus {
    pub fn from_history(history: &[Event]) -> Self {
        let mut status = OrchestrationStatus::Pending;
        for e in history {
            status = match e {
                Event::OrchestratorStarted { .. } => OrchestrationStatus::Running,
                Event::OrchestratorCompleted { result } => OrchestrationStatus::Completed { output: result.clone() },
                Event::OrchestratorFailed { error } => OrchestrationStatus::Failed { error: error.clone() },
                Event::OrchestratorTerminated { reason } => OrchestrationStatus::Terminated { reason: reason.clone() },
                _ => continue,
            };
        }
        status
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed { .. } | OrchestrationStatus::Failed { .. } | OrchestrationStatus::Terminated { .. }
        )
    }
}

/// Summary of one instance as returned by `Runtime::list_instances`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub instance_id: String,
    /// Orchestration name, once started.
    pub name: Option<String>,
    pub status: OrchestrationStatus,
    /// Recorded start time in epoch milliseconds, once started.
    pub created_at_ms: Option<u64>,
    pub history_len: usize,
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

type InstanceLocks = std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>;

/// Exclusive hold on one instance id. Dropping it releases the instance and
/// forgets its map entry when nobody else holds or waits for it.
struct InstanceGuard<'a> {
    locks: &'a InstanceLocks,
    instance: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(&self.instance).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&self.instance);
        }
    }
}

/// In-process runtime that drives orchestration instances, dispatches
/// activities, fires durable timers and persists history via a `HistoryStore`.
///
/// Each instance is advanced under its own lock, one replay cycle at a
/// time; distinct instances and all activities run in parallel.
pub struct Runtime {
    history_store: Arc<dyn HistoryStore>,
    orchestration_registry: OrchestrationRegistry,
    replay_engine: Arc<dyn ReplayEngine>,
    dispatcher: ActivityDispatcher,
    timers: TimerService,
    options: RuntimeOptions,
    instance_locks: InstanceLocks,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Start a new runtime using the in-memory history store.
    pub async fn start(
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        let history_store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
        Self::start_with_store(history_store, activity_registry, orchestration_registry).await
    }

    /// Start a new runtime with a custom `HistoryStore` implementation.
    pub async fn start_with_store(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(
            history_store,
            activity_registry,
            orchestration_registry,
            RuntimeOptions::default(),
        )
        .await
    }

    /// Start a runtime with explicit options. Non-terminal instances already
    /// in the store are resumed before this returns.
    pub async fn start_with_options(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        crate::logging::init_tracing();

        let (completion_tx, mut completion_rx) = mpsc::unbounded_channel::<ActivityCompletion>();
        let (fired_tx, mut fired_rx) = mpsc::unbounded_channel::<TimerTask>();
        let dispatcher = ActivityDispatcher::new(
            activity_registry,
            options.activity_retry.clone(),
            options.activity_timeout,
            completion_tx,
        );
        let runtime = Arc::new(Self {
            history_store,
            orchestration_registry,
            replay_engine: Arc::new(DefaultReplayEngine::new()),
            dispatcher,
            timers: TimerService::start(fired_tx),
            options,
            instance_locks: std::sync::Mutex::new(HashMap::new()),
            joins: Mutex::new(Vec::new()),
        });

        // completion routers: each completion is applied on its own task so
        // instances only contend on their own lock
        let router_rt = runtime.clone();
        let activity_router = tokio::spawn(async move {
            while let Some(completion) = completion_rx.recv().await {
                let rt = router_rt.clone();
                tokio::spawn(async move { rt.on_activity_completion(completion).await });
            }
        });
        let router_rt = runtime.clone();
        let timer_router = tokio::spawn(async move {
            while let Some(timer) = fired_rx.recv().await {
                let rt = router_rt.clone();
                tokio::spawn(async move { rt.on_timer_fired(timer).await });
            }
        });
        runtime.joins.lock().await.extend([activity_router, timer_router]);

        match runtime.resume_instances().await {
            Ok(0) => {}
            Ok(n) => info!(resumed = n, "resumed in-flight instances"),
            Err(e) => error!(error=%e, "failed to resume instances"),
        }
        runtime
    }

    async fn lock_instance(&self, instance: &str) -> InstanceGuard<'_> {
        let lock = {
            let mut locks = self.instance_locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(instance.to_string()).or_default().clone()
        };
        InstanceGuard {
            locks: &self.instance_locks,
            instance: instance.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Start a new instance under a fresh id and run its first replay cycle.
    pub async fn schedule_new_orchestration_instance(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
    ) -> Result<String, RuntimeError> {
        let instance = uuid::Uuid::new_v4().to_string();
        self.schedule_new_orchestration_instance_with_id(&instance, name, input).await?;
        Ok(instance)
    }

    /// Same as `schedule_new_orchestration_instance` with a caller-chosen id.
    pub async fn schedule_new_orchestration_instance_with_id(
        &self,
        instance: &str,
        name: impl Into<String>,
        input: impl Into<String>,
    ) -> Result<(), RuntimeError> {
        let name = name.into();
        if self.orchestration_registry.get(&name).is_none() {
            return Err(RuntimeError::UnknownOrchestration(name));
        }
        let _guard = self.lock_instance(instance).await;
        self.history_store.create_instance(instance).await?;
        let started = Event::OrchestratorStarted {
            name: name.clone(),
            input: input.into(),
            timestamp_ms: crate::wall_clock_ms(),
            execution_id: uuid::Uuid::new_v4().to_string(),
        };
        if let Err(e) = self.history_store.append(instance, 0, vec![started]).await {
            // do not leave an empty instance behind to block the id
            if let Err(cleanup) = self.history_store.remove_instance(instance).await {
                warn!(instance, error=%cleanup, "could not remove unstarted instance");
            }
            return Err(e.into());
        }
        info!(instance, orchestration=%name, "instance started");
        self.run_replay_cycle(instance).await
    }

    /// Typed variant: the input is JSON encoded.
    pub async fn schedule_new_orchestration_instance_typed<In: Serialize>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> Result<String, RuntimeError> {
        let payload = Json::encode(input).map_err(RuntimeError::Codec)?;
        self.schedule_new_orchestration_instance(name, payload).await
    }

    /// Replay the instance once and persist whatever it decided.
    ///
    /// The caller must hold the instance lock. New work is dispatched only
    /// after its schedule events are stored. A conflicting append recomputes
    /// the whole cycle from a fresh read; any other rejected append fails the
    /// instance.
    async fn run_replay_cycle(&self, instance: &str) -> Result<(), RuntimeError> {
        let mut conflicts = 0u32;
        loop {
            let history = self.history_store.read(instance).await?;
            let Some(Event::OrchestratorStarted {
                name,
                input,
                execution_id,
                ..
            }) = history.first().cloned()
            else {
                debug!(instance, "instance not started; nothing to replay");
                return Ok(());
            };
            if history.iter().any(Event::is_terminal) {
                return Ok(());
            }
            let expected_len = history.len();

            let (new_events, actions) = match self.orchestration_registry.get(&name) {
                None => {
                    error!(instance, orchestration=%name, "orchestration not registered");
                    let failed = Event::OrchestratorFailed {
                        error: format!("unregistered orchestration: {name}"),
                    };
                    (vec![failed], Vec::new())
                }
                Some(handler) => {
                    let mut turn = self.replay_engine.replay(instance, history, handler, input);
                    if let Some(mismatch) = turn.mismatch {
                        error!(instance, error=%mismatch, "replay mismatch; failing instance");
                        (vec![Event::OrchestratorFailed { error: mismatch.to_string() }], Vec::new())
                    } else {
                        let mut new_events = turn.history.split_off(expected_len);
                        match turn.output {
                            Some(Ok(result)) => {
                                new_events.push(Event::OrchestratorCompleted { result });
                                (new_events, Vec::new())
                            }
                            Some(Err(error)) => {
                                new_events.push(Event::OrchestratorFailed { error });
                                (new_events, Vec::new())
                            }
                            None => (new_events, turn.actions),
                        }
                    }
                }
            };
            if new_events.is_empty() {
                debug!(instance, "waiting on outstanding work");
                return Ok(());
            }

            let terminal = new_events.last().filter(|e| e.is_terminal()).cloned();
            match self.history_store.append(instance, expected_len, new_events).await {
                Ok(len) => {
                    debug!(instance, history_len = len, scheduled = actions.len(), "replay cycle persisted");
                    for action in actions {
                        self.materialize(instance, &execution_id, action);
                    }
                    match terminal {
                        Some(Event::OrchestratorCompleted { .. }) => info!(instance, "instance completed"),
                        Some(Event::OrchestratorFailed { error }) => warn!(instance, error=%error, "instance failed"),
                        _ => {}
                    }
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    conflicts += 1;
                    if conflicts > self.options.max_conflict_retries {
                        return Err(RuntimeError::ConflictRetriesExhausted {
                            instance: instance.to_string(),
                            attempts: conflicts,
                        });
                    }
                    warn!(instance, attempt = conflicts, error=%e, "history changed underneath replay; retrying cycle");
                }
                Err(e) => {
                    error!(instance, error=%e, "history append rejected; failing instance");
                    let failed = Event::OrchestratorFailed {
                        error: format!("history append rejected: {e}"),
                    };
                    self.append_terminal(instance, failed).await?;
                    return Ok(());
                }
            }
        }
    }

    // Hand a persisted action to the component that carries it out.
    fn materialize(&self, instance: &str, execution_id: &str, action: Action) {
        match action {
            Action::CallActivity { seq, name, input } => self.dispatcher.dispatch(ActivityTask {
                instance: instance.to_string(),
                execution_id: execution_id.to_string(),
                seq,
                name,
                input,
            }),
            Action::CreateTimer { seq, fire_at_ms } => self.timers.schedule(TimerTask {
                fire_at_ms,
                instance: instance.to_string(),
                execution_id: execution_id.to_string(),
                seq,
            }),
        }
    }

    /// Append `event` (which must be terminal) unless the instance already
    /// ended. Returns whether it was appended. The caller must hold the
    /// instance lock.
    async fn append_terminal(&self, instance: &str, event: Event) -> Result<bool, RuntimeError> {
        let mut conflicts = 0u32;
        loop {
            let history = self.history_store.read(instance).await?;
            if history.iter().any(Event::is_terminal) {
                return Ok(false);
            }
            match self.history_store.append(instance, history.len(), vec![event.clone()]).await {
                Ok(_) => return Ok(true),
                Err(e) if e.is_conflict() => {
                    conflicts += 1;
                    if conflicts > self.options.max_conflict_retries {
                        return Err(RuntimeError::ConflictRetriesExhausted {
                            instance: instance.to_string(),
                            attempts: conflicts,
                        });
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn on_activity_completion(&self, completion: ActivityCompletion) {
        let event = match completion.outcome {
            Ok(result) => Event::ActivityCompleted {
                seq: completion.seq,
                result,
            },
            Err(error) => Event::ActivityFailed {
                seq: completion.seq,
                error,
            },
        };
        debug!(instance=%completion.instance, seq=completion.seq, attempts=completion.attempts, "activity finished");
        self.record_completion(&completion.instance, &completion.execution_id, event)
            .await;
    }

    async fn on_timer_fired(&self, timer: TimerTask) {
        let event = Event::TimerFired {
            seq: timer.seq,
            fire_at_ms: timer.fire_at_ms,
        };
        self.record_completion(&timer.instance, &timer.execution_id, event).await;
    }

    /// Record one activity or timer outcome and advance the instance.
    async fn record_completion(&self, instance: &str, execution_id: &str, event: Event) {
        let Some(seq) = event.seq() else { return };
        let _guard = self.lock_instance(instance).await;

        let mut conflicts = 0u32;
        loop {
            let history = match self.history_store.read(instance).await {
                Ok(h) => h,
                Err(e) => {
                    warn!(instance, seq, error=%e, "dropping completion for unreadable instance");
                    return;
                }
            };
            match detect::classify_completion(&history, execution_id, seq) {
                CompletionDisposition::Accept => {}
                CompletionDisposition::InstanceTerminal => {
                    debug!(instance, seq, "absorbing completion for terminal instance");
                    return;
                }
                CompletionDisposition::StaleExecution => {
                    debug!(instance, seq, execution_id, "absorbing completion from an earlier run");
                    return;
                }
                CompletionDisposition::Duplicate => {
                    warn!(instance, seq, "absorbing duplicate completion");
                    return;
                }
                CompletionDisposition::UnknownSeq => {
                    warn!(instance, seq, "dropping completion for unscheduled work");
                    return;
                }
            }
            match self.history_store.append(instance, history.len(), vec![event.clone()]).await {
                Ok(_) => break,
                Err(e) if e.is_conflict() => {
                    if conflicts >= self.options.max_conflict_retries {
                        error!(instance, seq, error=%e, "conflict retries exhausted recording completion");
                        return;
                    }
                    conflicts += 1;
                    warn!(instance, seq, attempt = conflicts, "conflict recording completion; retrying");
                }
                Err(e) => {
                    error!(instance, seq, error=%e, "completion rejected by history store; failing instance");
                    let failed = Event::OrchestratorFailed {
                        error: format!("history append rejected: {e}"),
                    };
                    if let Err(e) = self.append_terminal(instance, failed).await {
                        error!(instance, error=%e, "could not record instance failure");
                    }
                    return;
                }
            }
        }
        debug!(instance, seq, kind = event.kind_name(), "completion recorded");
        if let Err(e) = self.run_replay_cycle(instance).await {
            error!(instance, error=%e, "replay cycle failed");
        }
    }

    /// Re-drive every non-terminal instance in the store: re-arm work without
    /// a recorded completion, then run a replay cycle. An instance that cannot
    /// be resumed is logged and skipped. Returns how many instances were resumed.
    pub async fn resume_instances(&self) -> Result<usize, RuntimeError> {
        let mut resumed = 0;
        for instance in self.history_store.list_instances().await? {
            match self.resume_instance(&instance).await {
                Ok(true) => resumed += 1,
                Ok(false) => {}
                Err(e) => error!(instance=%instance, error=%e, "could not resume instance; skipping"),
            }
        }
        Ok(resumed)
    }

    async fn resume_instance(&self, instance: &str) -> Result<bool, RuntimeError> {
        let _guard = self.lock_instance(instance).await;
        let history = self.history_store.read(instance).await?;
        if history.iter().any(Event::is_terminal) {
            return Ok(false);
        }
        let Some(execution_id) = detect::execution_id(&history) else {
            return Ok(false);
        };
        for (seq, name, input) in detect::outstanding_activities(&history) {
            debug!(instance, seq, name=%name, "re-dispatching outstanding activity");
            self.materialize(instance, execution_id, Action::CallActivity { seq, name, input });
        }
        for (seq, fire_at_ms) in detect::outstanding_timers(&history) {
            self.materialize(instance, execution_id, Action::CreateTimer { seq, fire_at_ms });
        }
        self.run_replay_cycle(instance).await?;
        Ok(true)
    }

    /// Stop the instance: appends `OrchestratorTerminated` and ends replay.
    /// Activities already running finish on their own; their completions are absorbed.
    /// Terminating an instance that is already terminal is a no-op.
    pub async fn terminate_instance(&self, instance: &str, reason: impl Into<String>) -> Result<(), RuntimeError> {
        let reason = reason.into();
        let _guard = self.lock_instance(instance).await;
        let terminated = Event::OrchestratorTerminated { reason: reason.clone() };
        if self.append_terminal(instance, terminated).await? {
            info!(instance, reason=%reason, "instance terminated");
        } else {
            debug!(instance, "terminate ignored; instance already terminal");
        }
        Ok(())
    }

    /// Delete a terminal instance and its history.
    pub async fn purge_instance(&self, instance: &str) -> Result<(), RuntimeError> {
        let _guard = self.lock_instance(instance).await;
        let history = self.history_store.read(instance).await?;
        if !OrchestrationStatus::from_history(&history).is_terminal() {
            return Err(RuntimeError::NotTerminal(instance.to_string()));
        }
        self.history_store.remove_instance(instance).await?;
        info!(instance, "instance purged");
        Ok(())
    }

    /// Full recorded history of an instance.
    pub async fn get_history(&self, instance: &str) -> Result<Vec<Event>, RuntimeError> {
        Ok(self.history_store.read(instance).await?)
    }

    pub async fn get_instance_status(&self, instance: &str) -> Result<OrchestrationStatus, RuntimeError> {
        let history = self.history_store.read(instance).await?;
        Ok(OrchestrationStatus::from_history(&history))
    }

    pub async fn list_instances(&self) -> Result<Vec<InstanceInfo>, RuntimeError> {
        let mut out = Vec::new();
        for instance_id in self.history_store.list_instances().await? {
            let history = match self.history_store.read(&instance_id).await {
                Ok(h) => h,
                // purged between list and read
                Err(crate::providers::HistoryError::InstanceNotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            let (name, created_at_ms) = match history.first() {
                Some(Event::OrchestratorStarted { name, timestamp_ms, .. }) => (Some(name.clone()), Some(*timestamp_ms)),
                _ => (None, None),
            };
            out.push(InstanceInfo {
                instance_id,
                name,
                status: OrchestrationStatus::from_history(&history),
                created_at_ms,
                history_len: history.len(),
            });
        }
        Ok(out)
    }

    /// Wait until the instance reaches a terminal state or the timeout elapses.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, RuntimeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = Duration::from_millis(5);
        loop {
            let status = self.get_instance_status(instance).await?;
            if status.is_terminal() {
                return Ok(status);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(RuntimeError::Timeout(instance.to_string()));
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(self.options.wait_poll_max);
        }
    }

    /// Typed variant: `Ok(Ok(out))` on Completed with decoded output,
    /// `Ok(Err(msg))` on Failed or Terminated.
    pub async fn wait_for_orchestration_typed<Out: DeserializeOwned>(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<Result<Out, String>, RuntimeError> {
        match self.wait_for_orchestration(instance, timeout).await? {
            OrchestrationStatus::Completed { output } => {
                Json::decode::<Out>(&output).map(Ok).map_err(RuntimeError::Codec)
            }
            OrchestrationStatus::Failed { error } => Ok(Err(error)),
            OrchestrationStatus::Terminated { reason } => Ok(Err(format!("terminated: {reason}"))),
            OrchestrationStatus::Pending | OrchestrationStatus::Running => {
                Err(RuntimeError::Timeout(instance.to_string()))
            }
        }
    }

    /// Abort background tasks and in-flight activities. History is left as is,
    /// so a later runtime over the same store resumes where this one stopped.
    pub async fn shutdown(self: Arc<Self>) {
        self.dispatcher.shutdown();
        self.timers.shutdown();
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
        info!("runtime shut down");
    }
}
