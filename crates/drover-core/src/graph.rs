//! Dependency tracking between tasks.
//!
//! The graph maps each parent task to the set of tasks waiting on it. A
//! task is admitted to the queue only once every one of its dependencies
//! has reached DONE; completions release eligible dependents. Task records
//! themselves stay in the store -- the graph holds ids only and consults
//! the store for statuses, in separate short critical sections so the two
//! locks are never held together.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tracing::debug;
use uuid::Uuid;

use drover_store::{Task, TaskStore};

#[derive(Debug, Default)]
struct GraphInner {
    /// Tasks blocked on at least one unfinished parent.
    waiting: HashSet<Uuid>,
    /// Parent id -> tasks waiting for it.
    dependents: HashMap<Uuid, HashSet<Uuid>>,
}

/// Tracks which tasks are blocked on which parents.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    inner: Mutex<GraphInner>,
}

impl DependencyGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task's dependencies.
    ///
    /// Every dependency that has not reached DONE adds the task to the
    /// waiting set and to that parent's dependents. Returns `true` when at
    /// least one dependency is unmet (the task must not be admitted yet).
    /// A dependency id the store does not know is treated as unmet; a
    /// parent retired to history still counts as DONE.
    pub fn register(&self, task: &Task, store: &TaskStore) -> bool {
        let unmet: Vec<Uuid> = task
            .dependencies
            .iter()
            .copied()
            .filter(|dep| !store.is_done(*dep))
            .collect();

        if unmet.is_empty() {
            let mut inner = self.inner.lock().expect("dependency graph lock poisoned");
            inner.waiting.remove(&task.id);
            return false;
        }

        let mut inner = self.inner.lock().expect("dependency graph lock poisoned");
        inner.waiting.insert(task.id);
        for dep in unmet {
            inner.dependents.entry(dep).or_default().insert(task.id);
        }
        true
    }

    /// Handle the completion of `id`.
    ///
    /// When `id` finished in DONE, returns every dependent whose other
    /// parents are all DONE as well, removing each from the waiting set and
    /// from all parents' dependent sets. When `id` ended in any other
    /// state its dependents stay blocked and the result is empty.
    pub fn on_completed(&self, id: Uuid, store: &TaskStore) -> Vec<Uuid> {
        if !store.is_done(id) {
            return Vec::new();
        }

        let candidates: Vec<Uuid> = {
            let inner = self.inner.lock().expect("dependency graph lock poisoned");
            match inner.dependents.get(&id) {
                Some(set) => set.iter().copied().collect(),
                None => return Vec::new(),
            }
        };

        // Check each candidate's remaining parents against the store with
        // the graph lock released.
        let mut ready: Vec<Task> = Vec::new();
        for candidate in candidates {
            let Ok(task) = store.get(candidate) else {
                continue;
            };
            let all_done = task.dependencies.iter().all(|dep| store.is_done(*dep));
            if all_done {
                ready.push(task);
            }
        }
        // Stable order for simultaneous releases: oldest task first.
        ready.sort_by_key(|t| (t.created_at, t.id));

        let mut inner = self.inner.lock().expect("dependency graph lock poisoned");
        for task in &ready {
            inner.waiting.remove(&task.id);
            for dep in &task.dependencies {
                if let Some(set) = inner.dependents.get_mut(dep) {
                    set.remove(&task.id);
                    if set.is_empty() {
                        inner.dependents.remove(dep);
                    }
                }
            }
            debug!(task_id = %task.id, released_by = %id, "dependencies satisfied");
        }

        ready.into_iter().map(|t| t.id).collect()
    }

    /// True while the task has at least one unmet dependency registered.
    pub fn has_unmet(&self, id: Uuid) -> bool {
        self.inner
            .lock()
            .expect("dependency graph lock poisoned")
            .waiting
            .contains(&id)
    }

    /// Number of tasks currently blocked.
    pub fn waiting_len(&self) -> usize {
        self.inner
            .lock()
            .expect("dependency graph lock poisoned")
            .waiting
            .len()
    }

    /// Rebuild the graph from the live task set, e.g. after a restart.
    pub fn rebuild(&self, store: &TaskStore) {
        {
            let mut inner = self.inner.lock().expect("dependency graph lock poisoned");
            inner.waiting.clear();
            inner.dependents.clear();
        }
        for task in store.list() {
            if !task.dependencies.is_empty() {
                self.register(&task, store);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_store::{ScheduleKind, TaskStatus};

    fn add_task(store: &TaskStore, name: &str, deps: &[Uuid]) -> Task {
        let mut task = Task::new(name, ScheduleKind::Immediate);
        task.dependencies = deps.to_vec();
        store.add(task).expect("add task")
    }

    fn mark_done(store: &TaskStore, id: Uuid) {
        store.update_status(id, TaskStatus::Queued).expect("queued");
        store.update_status(id, TaskStatus::Running).expect("running");
        store.update_status(id, TaskStatus::Done).expect("done");
    }

    #[test]
    fn register_without_deps_is_unblocked() {
        let store = TaskStore::in_memory();
        let graph = DependencyGraph::new();
        let task = add_task(&store, "solo", &[]);

        assert!(!graph.register(&task, &store));
        assert!(!graph.has_unmet(task.id));
    }

    #[test]
    fn register_blocks_on_unfinished_parent() {
        let store = TaskStore::in_memory();
        let graph = DependencyGraph::new();
        let parent = add_task(&store, "parent", &[]);
        let child = add_task(&store, "child", &[parent.id]);

        assert!(graph.register(&child, &store));
        assert!(graph.has_unmet(child.id));
        assert_eq!(graph.waiting_len(), 1);
    }

    #[test]
    fn completion_releases_child() {
        let store = TaskStore::in_memory();
        let graph = DependencyGraph::new();
        let parent = add_task(&store, "parent", &[]);
        let child = add_task(&store, "child", &[parent.id]);

        graph.register(&child, &store);
        mark_done(&store, parent.id);

        let released = graph.on_completed(parent.id, &store);
        assert_eq!(released, vec![child.id]);
        assert!(!graph.has_unmet(child.id));
    }

    #[test]
    fn child_waits_for_every_parent() {
        let store = TaskStore::in_memory();
        let graph = DependencyGraph::new();
        let a = add_task(&store, "a", &[]);
        let b = add_task(&store, "b", &[]);
        let child = add_task(&store, "child", &[a.id, b.id]);

        graph.register(&child, &store);

        mark_done(&store, a.id);
        assert!(graph.on_completed(a.id, &store).is_empty());
        assert!(graph.has_unmet(child.id));

        mark_done(&store, b.id);
        assert_eq!(graph.on_completed(b.id, &store), vec![child.id]);
    }

    #[test]
    fn failed_parent_releases_nothing() {
        let store = TaskStore::in_memory();
        let graph = DependencyGraph::new();
        let parent = add_task(&store, "parent", &[]);
        let child = add_task(&store, "child", &[parent.id]);

        graph.register(&child, &store);
        store
            .update_status(parent.id, TaskStatus::Queued)
            .expect("queued");
        store
            .update_status(parent.id, TaskStatus::Running)
            .expect("running");
        store
            .update_status(parent.id, TaskStatus::Failed)
            .expect("failed");

        assert!(graph.on_completed(parent.id, &store).is_empty());
        assert!(graph.has_unmet(child.id));
    }

    #[test]
    fn unknown_dependency_counts_as_unmet() {
        let store = TaskStore::in_memory();
        let graph = DependencyGraph::new();
        let child = add_task(&store, "child", &[Uuid::new_v4()]);

        assert!(graph.register(&child, &store));
    }

    #[test]
    fn simultaneous_release_is_oldest_first() {
        let store = TaskStore::in_memory();
        let graph = DependencyGraph::new();
        let parent = add_task(&store, "parent", &[]);
        let first = add_task(&store, "first", &[parent.id]);
        let second = add_task(&store, "second", &[parent.id]);

        graph.register(&first, &store);
        graph.register(&second, &store);
        mark_done(&store, parent.id);

        let released = graph.on_completed(parent.id, &store);
        assert_eq!(released, vec![first.id, second.id]);
    }

    #[test]
    fn rebuild_restores_waiting_set() {
        let store = TaskStore::in_memory();
        let parent = add_task(&store, "parent", &[]);
        let child = add_task(&store, "child", &[parent.id]);

        let graph = DependencyGraph::new();
        graph.rebuild(&store);

        assert!(graph.has_unmet(child.id));
        mark_done(&store, parent.id);
        assert_eq!(graph.on_completed(parent.id, &store), vec![child.id]);
    }
}
