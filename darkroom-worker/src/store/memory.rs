//! In-process record store
//!
//! Used by tests and by `memory://` deployments where jobs need not survive
//! a restart.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use super::{CasOutcome, RecordStore};
use crate::error::StoreError;

#[derive(Default)]
struct State {
    records: HashMap<String, String>,
    lists: HashMap<String, VecDeque<String>>,
}

impl State {
    fn push(&mut self, queue: &str, job_id: &str) {
        self.lists
            .entry(queue.to_string())
            .or_default()
            .push_back(job_id.to_string());
    }
}

/// Record store backed by a mutex-guarded map
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    pushed: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_and_push(
        &self,
        job_id: &str,
        record: &str,
        queue: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.records.insert(job_id.to_string(), record.to_string());
        state.push(queue, job_id);
        drop(state);

        self.pushed.notify_waiters();
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.state.lock().await.records.get(job_id).cloned())
    }

    async fn all(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.state.lock().await.records.values().cloned().collect())
    }

    async fn compare_and_swap(
        &self,
        job_id: &str,
        expected: &str,
        new: &str,
        requeue: Option<&str>,
    ) -> Result<CasOutcome, StoreError> {
        let mut state = self.state.lock().await;

        match state.records.get(job_id) {
            None => return Ok(CasOutcome::Missing),
            Some(current) if current != expected => return Ok(CasOutcome::Conflict),
            Some(_) => {}
        }

        state.records.insert(job_id.to_string(), new.to_string());
        if let Some(queue) = requeue {
            state.push(queue, job_id);
        }
        drop(state);

        if requeue.is_some() {
            self.pushed.notify_waiters();
        }
        Ok(CasOutcome::Swapped)
    }

    async fn remove(&self, job_id: &str, queues: &[&str]) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let existed = state.records.remove(job_id).is_some();

        for queue in queues {
            if let Some(list) = state.lists.get_mut(*queue) {
                list.retain(|id| id != job_id);
            }
        }

        Ok(existed)
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before checking so a push between the check
            // and the wait is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let popped = self
                .state
                .lock()
                .await
                .lists
                .get_mut(queue)
                .and_then(|list| list.pop_front());

            if popped.is_some() {
                return Ok(popped);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn len(&self, queue: &str) -> Result<usize, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .lists
            .get(queue)
            .map_or(0, VecDeque::len))
    }

    async fn clear(&self, queues: &[&str]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let removed = state.records.len();
        state.records.clear();

        for queue in queues {
            state.lists.remove(*queue);
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_pop_times_out_on_empty_list() {
        let store = MemoryStore::new();
        let popped = store.pop("q", Duration::from_millis(20)).await.unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let store = Arc::new(MemoryStore::new());

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.pop("q", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.insert_and_push("a", "{}", "q").await.unwrap();

        let popped = waiter.await.unwrap().unwrap();
        assert_eq!(popped.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_compare_and_swap_outcomes() {
        let store = MemoryStore::new();
        store.insert_and_push("a", "v1", "q").await.unwrap();
        store.pop("q", Duration::from_millis(1)).await.unwrap();

        assert_eq!(
            store.compare_and_swap("a", "stale", "v2", None).await.unwrap(),
            CasOutcome::Conflict
        );
        assert_eq!(
            store.compare_and_swap("missing", "v1", "v2", None).await.unwrap(),
            CasOutcome::Missing
        );
        assert_eq!(
            store.compare_and_swap("a", "v1", "v2", Some("q")).await.unwrap(),
            CasOutcome::Swapped
        );

        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("v2"));
        assert_eq!(store.len("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_drops_pending_occurrences() {
        let store = MemoryStore::new();
        store.insert_and_push("a", "{}", "q").await.unwrap();
        store.insert_and_push("b", "{}", "q").await.unwrap();

        assert!(store.remove("a", &["q"]).await.unwrap());
        assert!(!store.remove("a", &["q"]).await.unwrap());
        assert_eq!(store.len("q").await.unwrap(), 1);
        assert_eq!(store.clear(&["q"]).await.unwrap(), 1);
        assert_eq!(store.len("q").await.unwrap(), 0);
    }
}
