//! Append-only buffer of execution results.

use std::sync::Mutex;

use uuid::Uuid;

use crate::models::TaskResult;

/// Thread-safe FIFO buffer of [`TaskResult`]s.
///
/// Workers append; the reporter drains with [`ResultStore::snapshot_and_clear`].
/// Reads hand out clones so a published result can never be mutated.
#[derive(Debug, Default)]
pub struct ResultStore {
    results: Mutex<Vec<TaskResult>>,
}

impl ResultStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a result.
    pub fn add(&self, result: TaskResult) {
        let mut results = self.results.lock().expect("result store lock poisoned");
        results.push(result);
    }

    /// Atomically take every buffered result, leaving the store empty.
    pub fn snapshot_and_clear(&self) -> Vec<TaskResult> {
        let mut results = self.results.lock().expect("result store lock poisoned");
        std::mem::take(&mut *results)
    }

    /// All buffered results for a task, in insertion order.
    pub fn get_by_task_id(&self, task_id: Uuid) -> Vec<TaskResult> {
        let results = self.results.lock().expect("result store lock poisoned");
        results
            .iter()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect()
    }

    /// Number of buffered results.
    pub fn len(&self) -> usize {
        self.results.lock().expect("result store lock poisoned").len()
    }

    /// True when no results are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
