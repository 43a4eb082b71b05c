//! The task repository: live task set plus execution history.
//!
//! A single read/write lock guards the live collection; history is
//! append-only. Every mutation is followed by a snapshot write. Snapshot
//! failures degrade durability but never fail the mutation: the error is
//! logged and the store continues in memory.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::error::StoreError;
use crate::models::{Task, TaskStatus};
use crate::snapshot;

#[derive(Debug, Default)]
struct Inner {
    live: HashMap<Uuid, Task>,
    history: Vec<Task>,
}

/// In-memory task store with snapshot persistence.
#[derive(Debug)]
pub struct TaskStore {
    inner: RwLock<Inner>,
    snapshot_path: Option<PathBuf>,
}

impl TaskStore {
    /// Create a store with no snapshot persistence (tests, ephemeral runs).
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            snapshot_path: None,
        }
    }

    /// Open a store backed by the snapshot file in `config`, recovering any
    /// previously persisted task set.
    ///
    /// Recovery rules: tasks in a terminal state move to history; tasks
    /// caught RUNNING by a crash are rewritten to PENDING so they execute
    /// again (at-least-once); every other status is preserved as stored.
    pub fn open(config: &StorageConfig) -> anyhow::Result<Self> {
        let path = config.snapshot_file();
        let mut inner = Inner::default();

        if let Some(records) = snapshot::load_snapshot(&path)? {
            let mut reset = 0usize;
            // A terminal task is persisted twice: once from the live set and
            // once from its history copy (same id and version). Dedupe so a
            // load/save cycle does not grow the history.
            let mut seen_terminal: HashSet<(Uuid, u64)> = HashSet::new();
            for mut task in records {
                if task.status.is_terminal() {
                    if seen_terminal.insert((task.id, task.version)) {
                        inner.history.push(task);
                    }
                    continue;
                }
                if task.status == TaskStatus::Running {
                    task.status = TaskStatus::Pending;
                    reset += 1;
                }
                inner.live.insert(task.id, task);
            }
            info!(
                live = inner.live.len(),
                history = inner.history.len(),
                reset_to_pending = reset,
                "recovered task snapshot"
            );
        }

        Ok(Self {
            inner: RwLock::new(inner),
            snapshot_path: Some(path),
        })
    }

    // -- Reads ---------------------------------------------------------------

    /// Fetch a task by id.
    pub fn get(&self, id: Uuid) -> Result<Task, StoreError> {
        let inner = self.inner.read().expect("task store lock poisoned");
        inner
            .live
            .get(&id)
            .cloned()
            .ok_or(StoreError::TaskNotFound(id))
    }

    /// All live tasks.
    pub fn list(&self) -> Vec<Task> {
        let inner = self.inner.read().expect("task store lock poisoned");
        inner.live.values().cloned().collect()
    }

    /// Live tasks with the given status.
    pub fn list_by_status(&self, status: TaskStatus) -> Vec<Task> {
        let inner = self.inner.read().expect("task store lock poisoned");
        inner
            .live
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect()
    }

    /// Live tasks in PENDING.
    pub fn list_pending(&self) -> Vec<Task> {
        self.list_by_status(TaskStatus::Pending)
    }

    /// True when the task has completed successfully -- whether still in
    /// the live set or retired to history by a restart. Dependency checks
    /// use this so finished parents keep satisfying their children.
    pub fn is_done(&self, id: Uuid) -> bool {
        let inner = self.inner.read().expect("task store lock poisoned");
        if let Some(task) = inner.live.get(&id) {
            return task.status == TaskStatus::Done;
        }
        inner
            .history
            .iter()
            .any(|t| t.id == id && t.status == TaskStatus::Done)
    }

    /// Every task execution that reached a terminal state, oldest first.
    pub fn list_history(&self) -> Vec<Task> {
        let inner = self.inner.read().expect("task store lock poisoned");
        inner.history.clone()
    }

    /// Number of live tasks.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("task store lock poisoned")
            .live
            .len()
    }

    /// True when no live tasks exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -- Mutations -----------------------------------------------------------

    /// Insert a new task.
    ///
    /// Validates the record, rejects duplicate ids, and rejects any insert
    /// that would close a dependency cycle. Ids are minted before insertion,
    /// so a new task can complete a cycle through edges that already exist;
    /// the check walks the dependency graph of the current live set.
    pub fn add(&self, task: Task) -> Result<Task, StoreError> {
        task.validate().map_err(|reason| StoreError::InvalidTask {
            id: task.id,
            reason,
        })?;

        let tasks = {
            let mut inner = self.inner.write().expect("task store lock poisoned");
            if inner.live.contains_key(&task.id) {
                return Err(StoreError::DuplicateTask(task.id));
            }
            if closes_cycle(&inner.live, &task) {
                return Err(StoreError::DependencyCycle { id: task.id });
            }
            debug!(task_id = %task.id, name = %task.name, "task added");
            inner.live.insert(task.id, task.clone());
            collect_all(&inner)
        };
        self.persist_tasks(tasks);

        Ok(task)
    }

    /// Transition a task to `new_status`.
    ///
    /// Rejects edges not present in the lifecycle graph; on success stamps
    /// `updated_at`, bumps `version`, and copies a snapshot of the record
    /// into history when the new status is terminal.
    pub fn update_status(&self, id: Uuid, new_status: TaskStatus) -> Result<Task, StoreError> {
        let (updated, tasks) = {
            let mut inner = self.inner.write().expect("task store lock poisoned");
            let task = inner.live.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;

            if !task.status.can_transition_to(new_status) {
                return Err(StoreError::InvalidTransition {
                    id,
                    from: task.status,
                    to: new_status,
                });
            }

            task.status = new_status;
            task.updated_at = Utc::now();
            task.version += 1;
            let updated = task.clone();

            if new_status.is_terminal() {
                inner.history.push(updated.clone());
            }

            (updated, collect_all(&inner))
        };
        self.persist_tasks(tasks);

        debug!(task_id = %id, status = %new_status, version = updated.version, "status updated");
        Ok(updated)
    }

    /// Bump the retry counter of a task's policy.
    ///
    /// Fails when the task has no retry policy or the counter is already at
    /// the maximum, so the counter can never exceed `max_retries`.
    pub fn increment_retries(&self, id: Uuid) -> Result<Task, StoreError> {
        let (updated, tasks) = {
            let mut inner = self.inner.write().expect("task store lock poisoned");
            let task = inner.live.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;

            let policy = task.retry_policy.as_mut().ok_or(StoreError::InvalidTask {
                id,
                reason: "task has no retry policy".to_owned(),
            })?;
            if policy.current_retries >= policy.max_retries {
                return Err(StoreError::RetriesExhausted {
                    id,
                    max: policy.max_retries,
                });
            }
            policy.current_retries += 1;
            task.updated_at = Utc::now();
            task.version += 1;

            (task.clone(), collect_all(&inner))
        };
        self.persist_tasks(tasks);

        Ok(updated)
    }

    /// Remove a task from the live set.
    pub fn remove(&self, id: Uuid) -> Result<Task, StoreError> {
        let (removed, tasks) = {
            let mut inner = self.inner.write().expect("task store lock poisoned");
            let removed = inner.live.remove(&id).ok_or(StoreError::TaskNotFound(id))?;
            (removed, collect_all(&inner))
        };
        self.persist_tasks(tasks);

        Ok(removed)
    }

    // -- Persistence ---------------------------------------------------------

    /// Write the full task set (live + history) to the snapshot file now.
    ///
    /// Used at shutdown for a final durable snapshot; routine persistence
    /// happens automatically after every mutation.
    pub fn persist_snapshot(&self) -> anyhow::Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let tasks = {
            let inner = self.inner.read().expect("task store lock poisoned");
            collect_all(&inner)
        };
        snapshot::write_snapshot(path, &tasks)
    }

    /// Best-effort snapshot write performed outside the store lock.
    fn persist_tasks(&self, tasks: Vec<Task>) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        if let Err(e) = snapshot::write_snapshot(path, &tasks) {
            warn!(error = %e, "snapshot write failed; continuing in memory");
        }
    }
}

/// Live tasks followed by history, the persisted snapshot order.
fn collect_all(inner: &Inner) -> Vec<Task> {
    let mut tasks: Vec<Task> = inner.live.values().cloned().collect();
    tasks.sort_by_key(|t| t.created_at);
    tasks.extend(inner.history.iter().cloned());
    tasks
}

/// Walk the dependency edges of the live set from each of `task`'s
/// dependencies; if `task.id` is reachable, inserting it closes a cycle.
fn closes_cycle(live: &HashMap<Uuid, Task>, task: &Task) -> bool {
    let mut stack: Vec<Uuid> = task.dependencies.clone();
    let mut visited: HashSet<Uuid> = HashSet::new();

    while let Some(current) = stack.pop() {
        if current == task.id {
            return true;
        }
        if !visited.insert(current) {
            continue;
        }
        if let Some(dep) = live.get(&current) {
            stack.extend(dep.dependencies.iter().copied());
        }
    }

    false
}
