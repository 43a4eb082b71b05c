//! The scheduler loop: admits pending tasks, drains the priority queue
//! into the worker pool, and reacts to trigger fires and completions.
//!
//! One `tokio::select!` loop drives four periodic concerns -- the admit
//! tick, the dispatch tick, the retry-inspection tick, and trigger fire
//! events -- plus the completion channel fed by spawned executors. Worker
//! parallelism is bounded by a semaphore; the dispatch path never waits on
//! a worker. On cancellation the loop stops admitting, cancels running
//! handlers, drains completions within a bounded wait, and writes a final
//! snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use drover_store::{ResultStore, Task, TaskResult, TaskStatus, TaskStore};

use crate::cron::{FireKind, TriggerConfig, TriggerFire, TriggerRegistry};
use crate::executor::{self, ExecutionReport, ExecutionStatus};
use crate::graph::DependencyGraph;
use crate::handler::HandlerRegistry;
use crate::queue::TaskQueue;
use crate::report::Reporter;
use crate::retry::RetryController;
use crate::timeout::TimeoutSupervisor;

/// Tunables for the scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Cadence of the admit tick scanning PENDING tasks.
    pub poll_interval: Duration,
    /// Maximum number of concurrently executing tasks.
    pub concurrency: usize,
    /// Collapse missed cron fires into one.
    pub coalesce: bool,
    /// Cap on emitted missed cron fires when not coalescing.
    pub max_instances: u32,
    /// Cadence of the dispatch tick (enqueues also wake the dispatcher).
    pub dispatch_interval: Duration,
    /// Cadence of the diagnostic scan of tasks awaiting retry.
    pub retry_scan_interval: Duration,
    /// Cadence of the trigger registry's due-entry check.
    pub trigger_tick: Duration,
    /// Bounded wait for in-flight executions at shutdown.
    pub drain_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            concurrency: 5,
            coalesce: false,
            max_instances: 5,
            dispatch_interval: Duration::from_secs(1),
            retry_scan_interval: Duration::from_secs(30),
            trigger_tick: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Shared engine state handed to spawned executions and timers.
struct Ctx {
    config: SchedulerConfig,
    store: Arc<TaskStore>,
    results: Arc<ResultStore>,
    handlers: Arc<HandlerRegistry>,
    queue: Arc<TaskQueue>,
    graph: Arc<DependencyGraph>,
    triggers: Arc<TriggerRegistry>,
    timeouts: Arc<TimeoutSupervisor>,
    retry: RetryController,
    reporter: Option<Arc<Reporter>>,
    /// Cancellation tokens of currently executing tasks.
    running_cancels: Mutex<HashMap<Uuid, CancellationToken>>,
}

/// The scheduling engine.
pub struct Scheduler {
    ctx: Arc<Ctx>,
}

impl Scheduler {
    /// Wire up a scheduler over the given store, result buffer, and
    /// handler registry.
    pub fn new(
        config: SchedulerConfig,
        store: Arc<TaskStore>,
        results: Arc<ResultStore>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        let triggers = Arc::new(TriggerRegistry::new(TriggerConfig {
            tick: config.trigger_tick,
            coalesce: config.coalesce,
            max_instances: config.max_instances,
        }));
        let retry = RetryController::new(Arc::clone(&store), Arc::clone(&triggers));

        Self {
            ctx: Arc::new(Ctx {
                config,
                store,
                results,
                handlers,
                queue: Arc::new(TaskQueue::new()),
                graph: Arc::new(DependencyGraph::new()),
                triggers,
                timeouts: Arc::new(TimeoutSupervisor::new()),
                retry,
                reporter: None,
                running_cancels: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Attach a reporter for immediate terminal-failure notifications.
    pub fn with_reporter(mut self, reporter: Arc<Reporter>) -> Self {
        let ctx = Arc::get_mut(&mut self.ctx)
            .expect("with_reporter must be called before the scheduler is shared");
        ctx.reporter = Some(reporter);
        self
    }

    /// The trigger registry (exposed for inspection).
    pub fn triggers(&self) -> &Arc<TriggerRegistry> {
        &self.ctx.triggers
    }

    /// The priority queue (exposed for inspection).
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.ctx.queue
    }

    /// Run the engine until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let ctx = &self.ctx;

        // Startup recovery: rebuild dependency tracking from the live set
        // and re-register recurring triggers. One-shot retry delays are not
        // replayed; the admit tick folds those tasks back to PENDING.
        ctx.graph.rebuild(&ctx.store);
        for task in ctx.store.list_by_status(TaskStatus::Scheduled) {
            let Some(expr) = task.cron_expr.as_deref() else {
                continue;
            };
            if let Err(e) = ctx.triggers.register_cron(task.id, expr, task.priority) {
                error!(task_id = %task.id, error = %e, "could not re-register cron trigger");
            }
        }

        let mut fires = ctx
            .triggers
            .take_events()
            .context("trigger event stream already taken")?;
        let trigger_cancel = cancel.child_token();
        let trigger_loop = ctx.triggers.start(trigger_cancel.clone());

        let semaphore = Arc::new(Semaphore::new(ctx.config.concurrency.max(1)));
        let (done_tx, mut done_rx) =
            mpsc::channel::<ExecutionReport>(ctx.config.concurrency.max(1) * 2);
        let mut in_flight: usize = 0;

        let mut admit = tokio::time::interval(ctx.config.poll_interval);
        let mut dispatch = tokio::time::interval(ctx.config.dispatch_interval);
        let mut retry_scan = tokio::time::interval(ctx.config.retry_scan_interval);
        admit.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        dispatch.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        retry_scan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            concurrency = ctx.config.concurrency,
            poll_interval = ?ctx.config.poll_interval,
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = admit.tick() => self.admit_tick().await,
                _ = dispatch.tick() => self.dispatch(&semaphore, &done_tx, &mut in_flight),
                _ = ctx.queue.notified() => self.dispatch(&semaphore, &done_tx, &mut in_flight),
                Some(fire) = fires.recv() => self.handle_fire(fire),
                Some(report) = done_rx.recv() => {
                    in_flight = in_flight.saturating_sub(1);
                    self.handle_done(report).await;
                }
                _ = retry_scan.tick() => self.retry_scan(),
            }
        }

        // Drain: cancel running handlers and wait for their reports within
        // the configured bound.
        info!(in_flight, "scheduler stopping; draining executions");
        {
            let cancels = ctx
                .running_cancels
                .lock()
                .expect("running-cancel map lock poisoned");
            for token in cancels.values() {
                token.cancel();
            }
        }
        let deadline = tokio::time::Instant::now() + ctx.config.drain_timeout;
        while in_flight > 0 {
            match tokio::time::timeout_at(deadline, done_rx.recv()).await {
                Ok(Some(report)) => {
                    in_flight -= 1;
                    ctx.queue.release(report.task_id);
                    ctx.timeouts.disarm(report.task_id);
                }
                _ => break,
            }
        }
        if in_flight > 0 {
            warn!(remaining = in_flight, "drain deadline expired");
        }

        ctx.timeouts.shutdown();
        trigger_cancel.cancel();
        let _ = trigger_loop.await;

        ctx.store
            .persist_snapshot()
            .context("final snapshot at shutdown")?;
        info!("scheduler stopped");
        Ok(())
    }

    // -- Admit ---------------------------------------------------------------

    /// Scan PENDING tasks and promote the eligible ones.
    async fn admit_tick(&self) {
        let ctx = &self.ctx;
        debug!("admit tick");

        // One-shot retry triggers do not survive a restart; return any
        // orphaned RETRY task to PENDING so it is re-admitted below.
        for task in ctx.store.list_by_status(TaskStatus::Retry) {
            if !ctx.triggers.has_pending_retry(task.id) {
                info!(task_id = %task.id, "re-admitting task with lost retry trigger");
                if let Err(e) = ctx.store.update_status(task.id, TaskStatus::Pending) {
                    warn!(task_id = %task.id, error = %e, "could not reset retry task");
                }
            }
        }

        for task in ctx.store.list_pending() {
            if !task.dependencies.is_empty() && ctx.graph.register(&task, &ctx.store) {
                debug!(task_id = %task.id, "task waiting on dependencies");
                continue;
            }
            self.admit_task(&task).await;
        }

        // The in-memory queue is volatile: tasks stuck in QUEUED after a
        // restart are silently re-enqueued.
        for task in ctx.store.list_by_status(TaskStatus::Queued) {
            if !ctx.queue.is_tracked(task.id) {
                ctx.queue.enqueue(task.id, task.priority);
            }
        }
    }

    /// Promote one PENDING task whose dependencies are all met.
    async fn admit_task(&self, task: &Task) {
        let ctx = &self.ctx;
        match task.schedule_kind {
            drover_store::ScheduleKind::Scheduled => {
                let expr = task.cron_expr.as_deref().unwrap_or_default();
                match ctx.triggers.register_cron(task.id, expr, task.priority) {
                    Ok(()) => {
                        if let Err(e) = ctx.store.update_status(task.id, TaskStatus::Scheduled) {
                            warn!(task_id = %task.id, error = %e, "could not mark task scheduled");
                        }
                    }
                    Err(e) => {
                        warn!(task_id = %task.id, cron = %expr, error = %e, "rejecting task with invalid cron");
                        let result =
                            TaskResult::failed(task.id, format!("invalid cron expression: {e}"));
                        match ctx.store.update_status(task.id, TaskStatus::Failed) {
                            Ok(_) => {
                                ctx.results.add(result.clone());
                                self.notify_terminal(task.id, &result).await;
                            }
                            Err(e) => {
                                warn!(task_id = %task.id, error = %e, "could not mark task failed");
                            }
                        }
                    }
                }
            }
            drover_store::ScheduleKind::Immediate => {
                match ctx.store.update_status(task.id, TaskStatus::Queued) {
                    Ok(_) => {
                        ctx.queue.enqueue(task.id, task.priority);
                        debug!(task_id = %task.id, priority = %task.priority, "task queued");
                    }
                    Err(e) => {
                        warn!(task_id = %task.id, error = %e, "could not queue task");
                    }
                }
            }
        }
    }

    // -- Dispatch ------------------------------------------------------------

    /// Drain the queue into the worker pool up to the free slots.
    fn dispatch(
        &self,
        semaphore: &Arc<Semaphore>,
        done_tx: &mpsc::Sender<ExecutionReport>,
        in_flight: &mut usize,
    ) {
        let ctx = &self.ctx;
        let free = semaphore.available_permits();
        if free == 0 {
            return;
        }

        for id in ctx.queue.try_take_up_to(free) {
            let task = match ctx.store.get(id) {
                Ok(task) => task,
                Err(e) => {
                    warn!(task_id = %id, error = %e, "queued task missing from store");
                    ctx.queue.release(id);
                    continue;
                }
            };

            if let Err(e) = ctx.store.update_status(id, TaskStatus::Running) {
                warn!(task_id = %id, error = %e, "could not start task");
                ctx.queue.release(id);
                continue;
            }

            // The loop is the only permit consumer, so a free slot counted
            // above is still free here.
            let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() else {
                warn!(task_id = %id, "no free worker slot after queue take");
                ctx.queue.release(id);
                continue;
            };

            let exec_cancel = CancellationToken::new();
            ctx.running_cancels
                .lock()
                .expect("running-cancel map lock poisoned")
                .insert(id, exec_cancel.clone());

            if let Some(secs) = task.timeout_seconds {
                let timeout_ctx = Arc::clone(&self.ctx);
                ctx.timeouts
                    .arm(id, Duration::from_secs(u64::from(secs)), move || async move {
                        handle_timeout(timeout_ctx, id).await;
                    });
            }

            *in_flight += 1;
            let exec_ctx = Arc::clone(&self.ctx);
            let tx = done_tx.clone();
            tokio::spawn(async move {
                let report = executor::execute_task(
                    &exec_ctx.store,
                    &exec_ctx.results,
                    &exec_ctx.handlers,
                    id,
                    exec_cancel,
                )
                .await;
                drop(permit);
                exec_ctx
                    .running_cancels
                    .lock()
                    .expect("running-cancel map lock poisoned")
                    .remove(&id);
                let _ = tx.send(report).await;
            });
        }
    }

    // -- Completions ---------------------------------------------------------

    /// Post-execution bookkeeping: free the slot, then release dependents
    /// or decide on a retry.
    async fn handle_done(&self, report: ExecutionReport) {
        let ctx = &self.ctx;
        let id = report.task_id;
        ctx.queue.release(id);
        ctx.timeouts.disarm(id);

        match report.status {
            ExecutionStatus::Completed => {
                for child in ctx.graph.on_completed(id, &ctx.store) {
                    self.admit_released_child(child).await;
                }
            }
            ExecutionStatus::Failed => {
                let Ok(task) = ctx.store.get(id) else {
                    return;
                };
                if task.should_retry() {
                    if let Err(e) = ctx.retry.schedule(id) {
                        error!(task_id = %id, error = %e, "could not schedule retry");
                    }
                } else {
                    let result = ctx
                        .results
                        .get_by_task_id(id)
                        .pop()
                        .unwrap_or_else(|| TaskResult::failed(id, "task failed"));
                    self.notify_terminal(id, &result).await;
                }
            }
            // The timeout path (or shutdown) already did the bookkeeping.
            ExecutionStatus::Preempted | ExecutionStatus::Skipped => {}
        }
    }

    /// Admit a task whose last dependency just completed.
    async fn admit_released_child(&self, id: Uuid) {
        let ctx = &self.ctx;
        let Ok(task) = ctx.store.get(id) else {
            return;
        };
        if task.status != TaskStatus::Pending {
            debug!(task_id = %id, status = %task.status, "released dependent not pending; skipping");
            return;
        }
        self.admit_task(&task).await;
    }

    // -- Trigger fires -------------------------------------------------------

    /// React to a cron occurrence or an elapsed retry delay.
    fn handle_fire(&self, fire: TriggerFire) {
        let ctx = &self.ctx;
        let id = fire.task_id;

        match fire.kind {
            FireKind::Cron => {
                let task = match ctx.store.get(id) {
                    Ok(task) => task,
                    Err(_) => {
                        warn!(task_id = %id, "cron fired for unknown task; removing trigger");
                        ctx.triggers.remove_cron(id);
                        return;
                    }
                };
                match task.status {
                    // SCHEDULED waiting for its first run, or DONE from the
                    // previous occurrence.
                    TaskStatus::Scheduled | TaskStatus::Done => {
                        match ctx.store.update_status(id, TaskStatus::Queued) {
                            Ok(_) => {
                                ctx.queue.enqueue(id, fire.priority);
                                info!(task_id = %id, "cron fire queued task");
                            }
                            Err(e) => {
                                warn!(task_id = %id, error = %e, "cron fire could not queue task");
                            }
                        }
                    }
                    // Still queued, running, or retrying from the previous
                    // occurrence: a single instance at a time.
                    other => {
                        debug!(task_id = %id, status = %other, "cron fire dropped; task busy");
                    }
                }
            }
            FireKind::Retry => {
                let task = match ctx.store.get(id) {
                    Ok(task) => task,
                    Err(e) => {
                        warn!(task_id = %id, error = %e, "retry fired for unknown task");
                        return;
                    }
                };
                match task.status {
                    TaskStatus::Retry | TaskStatus::Pending => {
                        if task.status == TaskStatus::Retry {
                            if let Err(e) = ctx.store.update_status(id, TaskStatus::Pending) {
                                warn!(task_id = %id, error = %e, "could not reset retried task");
                                return;
                            }
                        }
                        match ctx.store.update_status(id, TaskStatus::Queued) {
                            Ok(_) => {
                                ctx.queue.enqueue(id, fire.priority);
                                info!(task_id = %id, "retry fire re-queued task");
                            }
                            Err(e) => {
                                warn!(task_id = %id, error = %e, "could not re-queue retried task");
                            }
                        }
                    }
                    // The admit tick got there first.
                    other => {
                        debug!(task_id = %id, status = %other, "retry fire superseded");
                    }
                }
            }
        }
    }

    // -- Diagnostics ---------------------------------------------------------

    /// Log tasks parked in RETRY. The actual re-enqueue is trigger-driven.
    fn retry_scan(&self) {
        let waiting = self.ctx.store.list_by_status(TaskStatus::Retry);
        if !waiting.is_empty() {
            debug!(count = waiting.len(), "tasks awaiting retry");
        }
    }

    /// Push a terminal failure through the immediate reporting channel.
    async fn notify_terminal(&self, id: Uuid, result: &TaskResult) {
        if let Some(reporter) = &self.ctx.reporter {
            reporter.report_single(id, result).await;
        }
    }
}

/// Timeout supervisor callback: preempt the worker and decide on a retry.
async fn handle_timeout(ctx: Arc<Ctx>, id: Uuid) {
    warn!(task_id = %id, "task timed out");

    // Cancel the running handler first so it can unwind promptly.
    if let Some(token) = ctx
        .running_cancels
        .lock()
        .expect("running-cancel map lock poisoned")
        .get(&id)
    {
        token.cancel();
    }

    let task = match ctx.store.update_status(id, TaskStatus::Timeout) {
        Ok(task) => task,
        Err(e) => {
            // Lost the race against a regular completion.
            debug!(task_id = %id, error = %e, "timeout raced completion; ignoring");
            return;
        }
    };

    let timeout_secs = task.timeout_seconds.unwrap_or_default();
    let result = TaskResult {
        task_id: id,
        success: false,
        timestamp: Utc::now(),
        details: serde_json::json!({
            "error": format!("execution exceeded {timeout_secs}s timeout"),
        }),
    };
    ctx.results.add(result.clone());
    ctx.queue.release(id);

    if task.should_retry() {
        if let Err(e) = ctx.retry.schedule(id) {
            error!(task_id = %id, error = %e, "could not schedule retry after timeout");
        }
    } else if let Some(reporter) = &ctx.reporter {
        reporter.report_single(id, &result).await;
    }
}
