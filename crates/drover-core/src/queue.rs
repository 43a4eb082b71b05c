//! Thread-safe priority queue of task ids.
//!
//! A min-heap keyed by `(priority value, enqueue sequence)`: higher
//! priority (lower value) wins, and tasks of equal priority leave in FIFO
//! order. The queue also tracks the running set so that a task is never
//! queued or running more than once at a time.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Mutex;

use tokio::sync::Notify;
use uuid::Uuid;

use drover_store::TaskPriority;

/// Heap entry. The derived ordering compares `(priority, seq, id)`, which
/// under `Reverse` yields lowest-priority-value-first with FIFO tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    priority: u8,
    seq: u64,
    id: Uuid,
}

#[derive(Debug, Default)]
struct QueueInner {
    heap: BinaryHeap<Reverse<Entry>>,
    queued: HashSet<Uuid>,
    running: HashSet<Uuid>,
    next_seq: u64,
}

/// Priority queue plus running-set tracking.
#[derive(Debug, Default)]
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl TaskQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a task id at the given priority.
    ///
    /// Returns `false` without enqueueing when the id is already queued or
    /// running, so a task occupies at most one slot at a time.
    pub fn enqueue(&self, id: Uuid, priority: TaskPriority) -> bool {
        let mut inner = self.inner.lock().expect("task queue lock poisoned");
        if inner.queued.contains(&id) || inner.running.contains(&id) {
            return false;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Reverse(Entry {
            priority: priority.queue_value(),
            seq,
            id,
        }));
        inner.queued.insert(id);
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Pop up to `n` ids in priority order, moving each into the running
    /// set in the same critical section.
    pub fn try_take_up_to(&self, n: usize) -> Vec<Uuid> {
        let mut inner = self.inner.lock().expect("task queue lock poisoned");
        let mut taken = Vec::new();
        while taken.len() < n {
            let Some(Reverse(entry)) = inner.heap.pop() else {
                break;
            };
            inner.queued.remove(&entry.id);
            inner.running.insert(entry.id);
            taken.push(entry.id);
        }
        taken
    }

    /// Remove an id from the running set once its execution slot is free.
    pub fn release(&self, id: Uuid) -> bool {
        let mut inner = self.inner.lock().expect("task queue lock poisoned");
        inner.running.remove(&id)
    }

    /// True when the id is currently queued or running.
    pub fn is_tracked(&self, id: Uuid) -> bool {
        let inner = self.inner.lock().expect("task queue lock poisoned");
        inner.queued.contains(&id) || inner.running.contains(&id)
    }

    /// Number of queued (not yet running) ids.
    pub fn queued_len(&self) -> usize {
        self.inner
            .lock()
            .expect("task queue lock poisoned")
            .queued
            .len()
    }

    /// Number of running ids.
    pub fn running_len(&self) -> usize {
        self.inner
            .lock()
            .expect("task queue lock poisoned")
            .running
            .len()
    }

    /// Wait until something is enqueued. Used by the dispatch loop to react
    /// to new work without waiting for the next tick.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order_wins() {
        let queue = TaskQueue::new();
        let low = Uuid::new_v4();
        let medium = Uuid::new_v4();
        let high = Uuid::new_v4();

        queue.enqueue(low, TaskPriority::Low);
        queue.enqueue(medium, TaskPriority::Medium);
        queue.enqueue(high, TaskPriority::High);

        assert_eq!(queue.try_take_up_to(3), vec![high, medium, low]);
    }

    #[test]
    fn fifo_within_priority() {
        let queue = TaskQueue::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let third = Uuid::new_v4();

        queue.enqueue(first, TaskPriority::Medium);
        queue.enqueue(second, TaskPriority::Medium);
        queue.enqueue(third, TaskPriority::Medium);

        assert_eq!(queue.try_take_up_to(3), vec![first, second, third]);
    }

    #[test]
    fn take_respects_limit() {
        let queue = TaskQueue::new();
        for _ in 0..5 {
            queue.enqueue(Uuid::new_v4(), TaskPriority::Medium);
        }

        assert_eq!(queue.try_take_up_to(2).len(), 2);
        assert_eq!(queue.queued_len(), 3);
        assert_eq!(queue.running_len(), 2);
    }

    #[test]
    fn duplicate_enqueue_is_noop() {
        let queue = TaskQueue::new();
        let id = Uuid::new_v4();

        assert!(queue.enqueue(id, TaskPriority::High));
        assert!(!queue.enqueue(id, TaskPriority::High));
        assert_eq!(queue.queued_len(), 1);
    }

    #[test]
    fn running_task_cannot_requeue_until_released() {
        let queue = TaskQueue::new();
        let id = Uuid::new_v4();

        queue.enqueue(id, TaskPriority::Medium);
        assert_eq!(queue.try_take_up_to(1), vec![id]);
        assert!(queue.is_tracked(id));

        // Still running: enqueue refused.
        assert!(!queue.enqueue(id, TaskPriority::Medium));

        assert!(queue.release(id));
        assert!(!queue.is_tracked(id));
        assert!(queue.enqueue(id, TaskPriority::Medium));
    }

    #[test]
    fn release_unknown_is_false() {
        let queue = TaskQueue::new();
        assert!(!queue.release(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn enqueue_wakes_waiter() {
        use std::sync::Arc;

        let queue = Arc::new(TaskQueue::new());
        let waiter = Arc::clone(&queue);
        let handle = tokio::spawn(async move {
            waiter.notified().await;
        });

        // Give the waiter a chance to park before notifying.
        tokio::task::yield_now().await;
        queue.enqueue(Uuid::new_v4(), TaskPriority::Medium);

        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("waiter should be woken")
            .expect("waiter task should not panic");
    }
}
