use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use super::options::RetryPolicy;
use super::registry::{ActivityHandler, ActivityRegistry};
use crate::ActivityError;

/// One scheduled activity call, identified by `(instance, execution_id, seq)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityTask {
    pub instance: String,
    pub execution_id: String,
    pub seq: u64,
    pub name: String,
    pub input: String,
}

/// Final outcome of an `ActivityTask` after retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityCompletion {
    pub instance: String,
    pub execution_id: String,
    pub seq: u64,
    pub outcome: Result<String, String>,
    /// Number of executions it took, including the first.
    pub attempts: u32,
}

/// Runs activities on tokio tasks and reports completions on a channel.
///
/// Delivery is at-least-once: a transient failure or a panic re-runs the
/// activity under the configured `RetryPolicy`, so side effects may repeat.
/// Exactly one `ActivityCompletion` is sent per dispatched task.
pub struct ActivityDispatcher {
    activities: Arc<ActivityRegistry>,
    retry: RetryPolicy,
    timeout: Option<Duration>,
    completions: mpsc::UnboundedSender<ActivityCompletion>,
    tasks: Mutex<JoinSet<()>>,
}

impl ActivityDispatcher {
    pub fn new(
        activities: Arc<ActivityRegistry>,
        retry: RetryPolicy,
        timeout: Option<Duration>,
        completions: mpsc::UnboundedSender<ActivityCompletion>,
    ) -> Self {
        Self {
            activities,
            retry,
            timeout,
            completions,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Start executing `task` and return immediately.
    pub fn dispatch(&self, task: ActivityTask) {
        debug!(instance=%task.instance, seq=task.seq, name=%task.name, "dispatch activity");
        let handler = self.activities.get(&task.name);
        let retry = self.retry.clone();
        let timeout = self.timeout;
        let tx = self.completions.clone();
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        // reap finished tasks so the set does not grow unbounded
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let completion = match handler {
                Some(handler) => run_with_retry(handler, &retry, timeout, task).await,
                None => ActivityCompletion {
                    outcome: Err(format!("unregistered:{}", task.name)),
                    instance: task.instance,
                    execution_id: task.execution_id,
                    seq: task.seq,
                    attempts: 0,
                },
            };
            if tx.send(completion).is_err() {
                debug!("completion receiver closed; dropping activity result");
            }
        });
    }

    /// Abort all in-flight activity executions. Their completions are never sent.
    pub fn shutdown(&self) {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).abort_all();
    }
}

async fn run_with_retry(
    handler: Arc<dyn ActivityHandler>,
    retry: &RetryPolicy,
    timeout: Option<Duration>,
    task: ActivityTask,
) -> ActivityCompletion {
    let started = tokio::time::Instant::now();
    let mut attempts = 0u32;
    let outcome = loop {
        attempts += 1;
        match execute_once(handler.clone(), task.input.clone(), timeout).await {
            Ok(result) => break Ok(result),
            Err(ActivityError::Failed(error)) => break Err(error),
            Err(ActivityError::Transient(error)) => {
                if !retry.should_retry(attempts) {
                    warn!(instance=%task.instance, seq=task.seq, name=%task.name, attempts, error=%error, "activity retries exhausted");
                    break Err(format!("{} failed after {attempts} attempts: {error}", task.name));
                }
                let delay = retry.next_delay(attempts);
                if let Some(limit) = retry.timeout
                    && started.elapsed() + delay > limit
                {
                    warn!(instance=%task.instance, seq=task.seq, name=%task.name, attempts, error=%error, "activity retry timeout reached");
                    break Err(format!("{} failed after {attempts} attempts: {error}", task.name));
                }
                let delay_ms = delay.as_millis() as u64;
                warn!(
                    instance=%task.instance,
                    seq=task.seq,
                    name=%task.name,
                    attempt=attempts,
                    delay_ms,
                    error=%error,
                    "transient activity failure; retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    };
    ActivityCompletion {
        instance: task.instance,
        execution_id: task.execution_id,
        seq: task.seq,
        outcome,
        attempts,
    }
}

// Aborts the wrapped task when the owner is dropped or aborted.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run the handler once on its own task so a panic surfaces as a `JoinError`.
async fn execute_once(
    handler: Arc<dyn ActivityHandler>,
    input: String,
    timeout: Option<Duration>,
) -> Result<String, ActivityError> {
    let mut guard = AbortOnDrop(tokio::spawn(async move { handler.invoke(input).await }));
    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut guard.0).await {
            Ok(joined) => joined,
            Err(_) => {
                return Err(ActivityError::Failed(format!(
                    "timeout: activity did not complete within {}ms",
                    limit.as_millis()
                )));
            }
        },
        None => (&mut guard.0).await,
    };
    match joined {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(ActivityError::Transient(format!("activity panicked: {msg}")))
        }
        Err(e) => Err(ActivityError::Transient(e.to_string())),
    }
}
