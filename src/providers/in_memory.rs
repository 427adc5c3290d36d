use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{DEFAULT_HISTORY_CAP, HistoryError, HistoryStore, check_append};
use crate::Event;

pub struct InMemoryHistoryStore {
    inner: Mutex<HashMap<String, Vec<Event>>>,
    cap: usize,
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::new_with_cap(DEFAULT_HISTORY_CAP)
    }
}

impl InMemoryHistoryStore {
    pub fn new_with_cap(cap: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            cap,
        }
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_instance(&self, instance: &str) -> Result<(), HistoryError> {
        let mut g = self.inner.lock().await;
        if g.contains_key(instance) {
            return Err(HistoryError::InstanceExists(instance.to_string()));
        }
        g.insert(instance.to_string(), Vec::new());
        Ok(())
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, HistoryError> {
        let g = self.inner.lock().await;
        g.get(instance)
            .cloned()
            .ok_or_else(|| HistoryError::InstanceNotFound(instance.to_string()))
    }

    async fn append(
        &self,
        instance: &str,
        expected_len: usize,
        new_events: Vec<Event>,
    ) -> Result<usize, HistoryError> {
        let mut g = self.inner.lock().await;
        let cur = g
            .get_mut(instance)
            .ok_or_else(|| HistoryError::InstanceNotFound(instance.to_string()))?;
        check_append(instance, cur, expected_len, &new_events, self.cap)?;
        cur.extend(new_events);
        Ok(cur.len())
    }

    async fn list_instances(&self) -> Result<Vec<String>, HistoryError> {
        let mut out: Vec<String> = self.inner.lock().await.keys().cloned().collect();
        out.sort();
        Ok(out)
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), HistoryError> {
        let mut g = self.inner.lock().await;
        if g.remove(instance).is_none() {
            return Err(HistoryError::InstanceNotFound(instance.to_string()));
        }
        Ok(())
    }
}
