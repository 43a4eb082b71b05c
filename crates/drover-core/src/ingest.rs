//! Periodic pull of task definitions from an external source.
//!
//! A [`TaskSource`] returns task drafts keyed by an external identifier;
//! the ingest job inserts each unseen draft as a PENDING task and drops
//! duplicates, so re-fetching the same upstream data is idempotent. Source
//! failures are logged and the next tick retries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use drover_store::{RetryPolicy, ScheduleKind, Task, TaskPriority, TaskStore};

/// A task definition pulled from an external system.
#[derive(Debug, Clone)]
pub struct TaskDraft {
    /// Stable upstream identifier used for de-duplication.
    pub external_key: String,
    pub name: String,
    pub schedule_kind: ScheduleKind,
    pub cron_expr: Option<String>,
    pub priority: TaskPriority,
    pub tags: Vec<String>,
    pub parameters: serde_json::Value,
    pub owner: Option<String>,
    pub timeout_seconds: Option<u32>,
    pub retry_policy: Option<RetryPolicy>,
}

impl TaskDraft {
    /// A minimal immediate draft; the remaining fields use task defaults.
    pub fn immediate(external_key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            external_key: external_key.into(),
            name: name.into(),
            schedule_kind: ScheduleKind::Immediate,
            cron_expr: None,
            priority: TaskPriority::Medium,
            tags: Vec::new(),
            parameters: serde_json::Value::Object(serde_json::Map::new()),
            owner: None,
            timeout_seconds: None,
            retry_policy: None,
        }
    }

    /// Mint a task record from the draft.
    pub fn into_task(self) -> Task {
        let mut task = Task::new(self.name, self.schedule_kind);
        task.cron_expr = self.cron_expr;
        task.priority = self.priority;
        task.tags = self.tags;
        task.parameters = self.parameters;
        task.owner = self.owner;
        task.timeout_seconds = self.timeout_seconds;
        task.retry_policy = self.retry_policy;
        task
    }
}

/// A pluggable upstream of task definitions.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Human-readable source name for logs.
    fn name(&self) -> &str;

    /// Fetch the current task definitions from the upstream.
    async fn fetch(&self) -> Result<Vec<TaskDraft>>;
}

/// Periodic ingest job inserting fetched drafts into the store.
pub struct IngestJob {
    store: Arc<TaskStore>,
    source: Arc<dyn TaskSource>,
    interval: Duration,
    /// External key -> task id of everything already inserted.
    seen: Mutex<HashMap<String, Uuid>>,
}

impl IngestJob {
    /// Create a job pulling from `source` every `interval`.
    pub fn new(store: Arc<TaskStore>, source: Arc<dyn TaskSource>, interval: Duration) -> Self {
        Self {
            store,
            source,
            interval,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Run the periodic pull until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.pull_once().await {
                        warn!(source = %self.source.name(), error = %e, "task ingest failed");
                    }
                }
            }
        }
        debug!(source = %self.source.name(), "ingest job stopped");
    }

    /// One fetch-and-insert cycle. Returns the number of tasks inserted.
    pub async fn pull_once(&self) -> Result<usize> {
        let drafts = self.source.fetch().await?;
        let mut inserted = 0usize;

        for draft in drafts {
            let key = draft.external_key.clone();
            {
                let seen = self.seen.lock().expect("ingest seen-map lock poisoned");
                if seen.contains_key(&key) {
                    debug!(external_key = %key, "duplicate task draft dropped");
                    continue;
                }
            }

            match self.store.add(draft.into_task()) {
                Ok(task) => {
                    self.seen
                        .lock()
                        .expect("ingest seen-map lock poisoned")
                        .insert(key.clone(), task.id);
                    info!(
                        source = %self.source.name(),
                        external_key = %key,
                        task_id = %task.id,
                        "ingested task"
                    );
                    inserted += 1;
                }
                Err(e) => {
                    warn!(external_key = %key, error = %e, "rejected ingested task");
                }
            }
        }

        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticSource {
        drafts: Vec<TaskDraft>,
    }

    #[async_trait]
    impl TaskSource for StaticSource {
        fn name(&self) -> &str {
            "static"
        }

        async fn fetch(&self) -> Result<Vec<TaskDraft>> {
            Ok(self.drafts.clone())
        }
    }

    struct BrokenSource;

    #[async_trait]
    impl TaskSource for BrokenSource {
        fn name(&self) -> &str {
            "broken"
        }

        async fn fetch(&self) -> Result<Vec<TaskDraft>> {
            anyhow::bail!("upstream unavailable")
        }
    }

    #[tokio::test]
    async fn pull_inserts_pending_tasks() {
        let store = Arc::new(TaskStore::in_memory());
        let source = Arc::new(StaticSource {
            drafts: vec![
                TaskDraft::immediate("ext-1", "first"),
                TaskDraft::immediate("ext-2", "second"),
            ],
        });
        let job = IngestJob::new(Arc::clone(&store), source, Duration::from_secs(60));

        let inserted = job.pull_once().await.expect("pull");
        assert_eq!(inserted, 2);
        assert_eq!(store.list_pending().len(), 2);
    }

    #[tokio::test]
    async fn repeated_pull_is_idempotent() {
        let store = Arc::new(TaskStore::in_memory());
        let source = Arc::new(StaticSource {
            drafts: vec![TaskDraft::immediate("ext-1", "only")],
        });
        let job = IngestJob::new(Arc::clone(&store), source, Duration::from_secs(60));

        assert_eq!(job.pull_once().await.expect("pull"), 1);
        assert_eq!(job.pull_once().await.expect("pull"), 0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn invalid_draft_is_skipped() {
        let store = Arc::new(TaskStore::in_memory());
        let mut bad = TaskDraft::immediate("ext-bad", "nameless");
        bad.name = "".to_owned();
        let source = Arc::new(StaticSource {
            drafts: vec![bad, TaskDraft::immediate("ext-ok", "fine")],
        });
        let job = IngestJob::new(Arc::clone(&store), source, Duration::from_secs(60));

        assert_eq!(job.pull_once().await.expect("pull"), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn source_failure_propagates() {
        let store = Arc::new(TaskStore::in_memory());
        let job = IngestJob::new(store, Arc::new(BrokenSource), Duration::from_secs(60));
        assert!(job.pull_once().await.is_err());
    }
}
