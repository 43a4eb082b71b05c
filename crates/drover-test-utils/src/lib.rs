//! Shared test utilities for drover integration tests.
//!
//! Provides scripted task handlers, a capturing report sink, a static
//! ingest source, temp-dir storage setup, and a [`TestEngine`] that wires
//! a full scheduler with millisecond-scale tick intervals.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use drover_core::handler::{HandlerOutput, HandlerRegistry, TaskHandler};
use drover_core::ingest::{TaskDraft, TaskSource};
use drover_core::report::{ReportRow, ReportSink};
use drover_core::scheduler::{Scheduler, SchedulerConfig};
use drover_store::config::StorageConfig;
use drover_store::{ResultStore, ScheduleKind, Task, TaskStatus, TaskStore};

// ---------------------------------------------------------------------------
// Task builders
// ---------------------------------------------------------------------------

/// An immediate task routed to `tag`.
pub fn immediate_task(name: &str, tag: &str) -> Task {
    let mut task = Task::new(name, ScheduleKind::Immediate);
    task.tags = vec![tag.to_owned()];
    task
}

/// A scheduled task with the given cron expression, routed to `tag`.
pub fn scheduled_task(name: &str, tag: &str, cron: &str) -> Task {
    let mut task = Task::new(name, ScheduleKind::Scheduled);
    task.cron_expr = Some(cron.to_owned());
    task.tags = vec![tag.to_owned()];
    task
}

// ---------------------------------------------------------------------------
// Scripted handlers
// ---------------------------------------------------------------------------

/// Handler that always succeeds and counts its runs.
pub struct OkHandler {
    tag: String,
    pub runs: Arc<AtomicU32>,
}

impl OkHandler {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_owned(),
            runs: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn run_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.runs)
    }
}

#[async_trait]
impl TaskHandler for OkHandler {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn run(&self, task: &Task, _cancel: CancellationToken) -> Result<HandlerOutput> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(HandlerOutput::ok_with(
            serde_json::json!({ "handled": task.name }),
        ))
    }
}

/// Handler that fails the first `n` runs, then succeeds. Counts attempts.
pub struct FailTimesHandler {
    tag: String,
    failures_left: AtomicU32,
    pub attempts: Arc<AtomicU32>,
}

impl FailTimesHandler {
    pub fn new(tag: &str, failures: u32) -> Self {
        Self {
            tag: tag.to_owned(),
            failures_left: AtomicU32::new(failures),
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn attempt_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.attempts)
    }
}

#[async_trait]
impl TaskHandler for FailTimesHandler {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn run(&self, _task: &Task, _cancel: CancellationToken) -> Result<HandlerOutput> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            anyhow::bail!("scripted failure ({left} left)");
        }
        Ok(HandlerOutput::ok())
    }
}

/// Handler that sleeps for a configured duration, returning early with an
/// error when cancelled.
pub struct SleepHandler {
    tag: String,
    duration: Duration,
}

impl SleepHandler {
    pub fn new(tag: &str, duration: Duration) -> Self {
        Self {
            tag: tag.to_owned(),
            duration,
        }
    }
}

#[async_trait]
impl TaskHandler for SleepHandler {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn run(&self, _task: &Task, cancel: CancellationToken) -> Result<HandlerOutput> {
        tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("cancelled"),
            _ = tokio::time::sleep(self.duration) => Ok(HandlerOutput::ok()),
        }
    }
}

/// Handler that appends each task name to a shared list, optionally
/// holding the worker slot for a while first.
pub struct RecordingHandler {
    tag: String,
    delay: Duration,
    pub order: Arc<Mutex<Vec<String>>>,
}

impl RecordingHandler {
    pub fn new(tag: &str, delay: Duration) -> Self {
        Self {
            tag: tag.to_owned(),
            delay,
            order: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn order_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.order)
    }
}

#[async_trait]
impl TaskHandler for RecordingHandler {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn run(&self, task: &Task, _cancel: CancellationToken) -> Result<HandlerOutput> {
        self.order.lock().unwrap().push(task.name.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(HandlerOutput::ok())
    }
}

// ---------------------------------------------------------------------------
// Capturing sink and static source
// ---------------------------------------------------------------------------

/// Report sink that records every delivery; can be scripted to fail.
#[derive(Default)]
pub struct CapturingSink {
    pub batches: Mutex<Vec<Vec<ReportRow>>>,
    pub singles: Mutex<Vec<(Uuid, ReportRow)>>,
    pub fail_batches: bool,
}

impl CapturingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail_batches: true,
            ..Self::default()
        }
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    pub fn delivered_rows(&self) -> Vec<ReportRow> {
        self.batches.lock().unwrap().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl ReportSink for CapturingSink {
    async fn update_with_results(&self, rows: &[ReportRow]) -> Result<bool> {
        if self.fail_batches {
            anyhow::bail!("sink scripted to fail");
        }
        self.batches.lock().unwrap().push(rows.to_vec());
        Ok(true)
    }

    async fn update_single_result(&self, task_id: Uuid, row: &ReportRow) -> Result<()> {
        self.singles.lock().unwrap().push((task_id, row.clone()));
        Ok(())
    }
}

/// Task source returning a fixed list of drafts.
pub struct StaticSource {
    pub drafts: Vec<TaskDraft>,
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

// ---------------------------------------------------------------------------
// Storage and engine harness
// ---------------------------------------------------------------------------

/// A storage config rooted in a fresh temp dir. Keep the guard alive for
/// the duration of the test.
pub fn temp_storage() -> (StorageConfig, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().expect("failed to create temp storage dir");
    let config = StorageConfig::new(dir.path());
    (config, dir)
}

/// Scheduler config with millisecond-scale ticks for fast tests.
pub fn fast_config(concurrency: usize) -> SchedulerConfig {
    SchedulerConfig {
        poll_interval: Duration::from_millis(25),
        concurrency,
        coalesce: false,
        max_instances: 5,
        dispatch_interval: Duration::from_millis(10),
        retry_scan_interval: Duration::from_millis(500),
        trigger_tick: Duration::from_millis(10),
        drain_timeout: Duration::from_secs(2),
    }
}

/// A running scheduler over an in-memory (or provided) store.
pub struct TestEngine {
    pub store: Arc<TaskStore>,
    pub results: Arc<ResultStore>,
    pub scheduler: Arc<Scheduler>,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<Result<()>>,
}

impl TestEngine {
    /// Spawn an engine over a fresh in-memory store.
    pub fn spawn(handlers: HandlerRegistry, concurrency: usize) -> Self {
        Self::spawn_with(fast_config(concurrency), TaskStore::in_memory(), handlers)
    }

    /// Spawn an engine with explicit config and store.
    pub fn spawn_with(config: SchedulerConfig, store: TaskStore, handlers: HandlerRegistry) -> Self {
        let store = Arc::new(store);
        let results = Arc::new(ResultStore::new());
        let scheduler = Arc::new(Scheduler::new(
            config,
            Arc::clone(&store),
            Arc::clone(&results),
            Arc::new(handlers),
        ));

        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let run_scheduler = Arc::clone(&scheduler);
        let handle = tokio::spawn(async move { run_scheduler.run(run_cancel).await });

        Self {
            store,
            results,
            scheduler,
            cancel,
            handle,
        }
    }

    /// Stop the engine and wait for the drain to complete.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        self.handle.await.expect("scheduler task panicked")
    }
}

/// Poll `check` every 10 ms until it returns true or `deadline` passes.
pub async fn wait_until(deadline: Duration, check: impl Fn() -> bool) -> bool {
    let end = tokio::time::Instant::now() + deadline;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= end {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait for a task to reach `status`.
pub async fn wait_for_status(
    store: &Arc<TaskStore>,
    id: Uuid,
    status: TaskStatus,
    deadline: Duration,
) -> bool {
    let store = Arc::clone(store);
    wait_until(deadline, move || {
        store.get(id).map(|t| t.status == status).unwrap_or(false)
    })
    .await
}
