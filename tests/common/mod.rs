#![allow(dead_code)]
use durable_replay::Event;
use durable_replay::providers::in_memory::InMemoryHistoryStore;
use durable_replay::providers::{HistoryError, HistoryStore};
use std::sync::Arc as StdArc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

pub async fn wait_for_history<F>(store: StdArc<dyn HistoryStore>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&Vec<Event>) -> bool,
{
    wait_for_history_event(
        store,
        instance,
        |hist| if predicate(hist) { Some(()) } else { None },
        timeout_ms,
    )
    .await
    .is_some()
}

pub async fn wait_for_history_event<T, F>(
    store: StdArc<dyn HistoryStore>,
    instance: &str,
    selector: F,
    timeout_ms: u64,
) -> Option<T>
where
    F: Fn(&Vec<Event>) -> Option<T>,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Ok(hist) = store.read(instance).await
            && let Some(v) = selector(&hist)
        {
            return Some(v);
        }
        if Instant::now() > deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn count_completions(hist: &[Event], seq: u64) -> usize {
    hist.iter()
        .filter(|e| matches!(e, Event::ActivityCompleted { seq: s, .. } | Event::ActivityFailed { seq: s, .. } if *s == seq))
        .count()
}

/// In-memory store that rejects the next `conflicts` appends with a
/// concurrent-write conflict before delegating.
pub struct ConflictingStore {
    inner: InMemoryHistoryStore,
    conflicts: AtomicU32,
    injected: AtomicU32,
}

impl ConflictingStore {
    pub fn new(conflicts: u32) -> Self {
        Self {
            inner: InMemoryHistoryStore::default(),
            conflicts: AtomicU32::new(conflicts),
            injected: AtomicU32::new(0),
        }
    }

    pub fn arm(&self, conflicts: u32) {
        self.conflicts.store(conflicts, Ordering::SeqCst);
    }

    pub fn injected(&self) -> u32 {
        self.injected.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl HistoryStore for ConflictingStore {
    async fn create_instance(&self, instance: &str) -> Result<(), HistoryError> {
        self.inner.create_instance(instance).await
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, HistoryError> {
        self.inner.read(instance).await
    }

    async fn append(&self, instance: &str, expected_len: usize, new_events: Vec<Event>) -> Result<usize, HistoryError> {
        let armed = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(HistoryError::ConcurrentWriteConflict {
                instance: instance.to_string(),
                expected: expected_len,
                actual: expected_len + 1,
            });
        }
        self.inner.append(instance, expected_len, new_events).await
    }

    async fn list_instances(&self) -> Result<Vec<String>, HistoryError> {
        self.inner.list_instances().await
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), HistoryError> {
        self.inner.remove_instance(instance).await
    }
}
