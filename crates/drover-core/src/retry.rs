//! Retry scheduling for failed and timed-out tasks.
//!
//! A retry bumps the task's attempt counter, parks the task in RETRY, and
//! arms a one-shot trigger at `now + retry_delay * backoff^(attempt - 1)`.
//! When the trigger fires the scheduler returns the task to PENDING and
//! re-enqueues it at its original priority.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use drover_store::{Task, TaskStatus, TaskStore};

use crate::cron::{FireKind, TriggerRegistry};

/// Applies retry policies and schedules future re-enqueues.
pub struct RetryController {
    store: Arc<TaskStore>,
    triggers: Arc<TriggerRegistry>,
}

impl RetryController {
    /// Create a controller over the store and trigger registry.
    pub fn new(store: Arc<TaskStore>, triggers: Arc<TriggerRegistry>) -> Self {
        Self { store, triggers }
    }

    /// True when the task has a retry policy with attempts remaining.
    pub fn should_retry(&self, task: &Task) -> bool {
        task.should_retry()
    }

    /// Schedule a retry for a task that just failed or timed out.
    ///
    /// Increments the attempt counter, transitions the task to RETRY, and
    /// registers the one-shot trigger. Returns the planned fire time.
    pub fn schedule(&self, task_id: Uuid) -> Result<DateTime<Utc>> {
        let task = self
            .store
            .get(task_id)
            .with_context(|| format!("cannot retry task {task_id}"))?;

        if !matches!(task.status, TaskStatus::Failed | TaskStatus::Timeout) {
            bail!(
                "cannot retry task {}: status is {}, expected FAILED or TIMEOUT",
                task_id,
                task.status
            );
        }

        let updated = self
            .store
            .increment_retries(task_id)
            .with_context(|| format!("cannot retry task {task_id}"))?;
        let policy = updated
            .retry_policy
            .as_ref()
            .context("retry counter incremented on a task without a policy")?;

        let delay = policy.next_delay();
        let fire_at = Utc::now()
            + chrono::Duration::from_std(delay).context("retry delay out of range")?;

        self.store.update_status(task_id, TaskStatus::Retry)?;
        self.triggers
            .register_once(task_id, fire_at, updated.priority, FireKind::Retry);

        info!(
            task_id = %task_id,
            attempt = policy.current_retries,
            max_retries = policy.max_retries,
            fire_at = %fire_at,
            "retry scheduled"
        );

        Ok(fire_at)
    }
}
