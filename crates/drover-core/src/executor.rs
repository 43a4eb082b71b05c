//! One unit of worker-pool work: execute a task body end to end.
//!
//! The executor resolves the handler for a task already marked RUNNING,
//! runs it under a cancellation token, maps the outcome onto the lifecycle
//! (success -> DONE, handler error or rejection -> FAILED), and appends the
//! execution result. Errors never propagate to the dispatch path; every
//! completed execution produces a result row. When the timeout supervisor
//! preempted the task mid-flight, the executor steps aside: the status and
//! result row were already written by the timeout path.

use anyhow::anyhow;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use drover_store::{ResultStore, StoreError, TaskResult, TaskStatus, TaskStore};

use crate::handler::HandlerRegistry;

/// How an execution ended, as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Handler succeeded; task is DONE.
    Completed,
    /// Handler failed or rejected the input; task is FAILED.
    Failed,
    /// The timeout supervisor (or shutdown) got there first; the task was
    /// already moved out of RUNNING and its result row written elsewhere.
    Preempted,
    /// The task disappeared from the store before it could run.
    Skipped,
}

/// Completion message sent back to the scheduler loop.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionReport {
    pub task_id: Uuid,
    pub status: ExecutionStatus,
}

/// Execute the body of `task_id` and record the outcome.
pub async fn execute_task(
    store: &TaskStore,
    results: &ResultStore,
    handlers: &HandlerRegistry,
    task_id: Uuid,
    cancel: CancellationToken,
) -> ExecutionReport {
    let report = |status| ExecutionReport { task_id, status };

    let task = match store.get(task_id) {
        Ok(task) => task,
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "task vanished before execution");
            return report(ExecutionStatus::Skipped);
        }
    };

    let Some(handler) = handlers.resolve(&task) else {
        let message = format!("no handler registered for tags {:?}", task.tags);
        warn!(task_id = %task_id, tags = ?task.tags, "no handler for task");
        return report(finalize_failure(
            store,
            results,
            task_id,
            TaskResult::failed(task_id, message),
        ));
    };

    info!(
        task_id = %task_id,
        name = %task.name,
        handler = %handler.tag(),
        "executing task"
    );

    // Run the body on its own task so a panicking handler is isolated and
    // mapped to a failure rather than tearing down the worker.
    let body = {
        let task = task.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { handler.run(&task, cancel).await })
    };

    let outcome = match body.await {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => Err(anyhow!("handler panicked")),
        Err(_) => Err(anyhow!("handler aborted")),
    };

    match outcome {
        Ok(output) if output.success => match store.update_status(task_id, TaskStatus::Done) {
            Ok(_) => {
                results.add(TaskResult {
                    task_id,
                    success: true,
                    timestamp: Utc::now(),
                    details: output.details,
                });
                info!(task_id = %task_id, "task completed");
                report(ExecutionStatus::Completed)
            }
            Err(e) => report(preempted(store, task_id, e)),
        },
        Ok(output) => {
            let mut details = output.details;
            if details.get("error").is_none() {
                if let Some(map) = details.as_object_mut() {
                    map.insert(
                        "error".to_owned(),
                        serde_json::Value::String("handler reported failure".to_owned()),
                    );
                }
            }
            let result = TaskResult {
                task_id,
                success: false,
                timestamp: Utc::now(),
                details,
            };
            report(finalize_failure(store, results, task_id, result))
        }
        Err(e) => {
            let result = TaskResult::failed(task_id, format!("{e:#}"));
            report(finalize_failure(store, results, task_id, result))
        }
    }
}

/// Move the task to FAILED and record the failure row. Steps aside when
/// the task is no longer RUNNING (timeout preemption).
fn finalize_failure(
    store: &TaskStore,
    results: &ResultStore,
    task_id: Uuid,
    result: TaskResult,
) -> ExecutionStatus {
    match store.update_status(task_id, TaskStatus::Failed) {
        Ok(_) => {
            warn!(
                task_id = %task_id,
                error = result.error().unwrap_or("unknown"),
                "task failed"
            );
            results.add(result);
            ExecutionStatus::Failed
        }
        Err(e) => preempted(store, task_id, e),
    }
}

/// Classify a refused RUNNING exit: the expected case is a timeout (or
/// shutdown) that already moved the task on.
fn preempted(store: &TaskStore, task_id: Uuid, err: StoreError) -> ExecutionStatus {
    let current = store.get(task_id).map(|t| t.status).ok();
    match current {
        Some(TaskStatus::Timeout) | Some(TaskStatus::Retry) | Some(TaskStatus::Pending) => {
            ExecutionStatus::Preempted
        }
        _ => {
            warn!(task_id = %task_id, error = %err, "could not finalize execution");
            ExecutionStatus::Preempted
        }
    }
}
