//! Result aggregation and outbound delivery.
//!
//! On its tick the reporter drains the result store, transforms each
//! result into a row, and submits the batch to the configured sink.
//! Delivery is best-effort: a failed submission discards the batch with an
//! error log and the next tick starts fresh. A separate immediate entry
//! point pushes a single result for side-channel notifications.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use drover_store::{ResultStore, TaskResult};

/// A delivered report line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub task_id: Uuid,
    pub status_label: String,
    /// The error message, or the literal `"None"` for successes.
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

impl ReportRow {
    /// Build the row for an execution result.
    pub fn from_result(result: &TaskResult) -> Self {
        Self {
            task_id: result.task_id,
            status_label: if result.success { "SUCCESS" } else { "FAILED" }.to_owned(),
            error: result.error().unwrap_or("None").to_owned(),
            timestamp: result.timestamp,
        }
    }
}

/// Outbound delivery surface for execution results.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Deliver a batch of rows. `Ok(false)` means the surface rejected the
    /// update; the caller treats it like an error.
    async fn update_with_results(&self, rows: &[ReportRow]) -> Result<bool>;

    /// Deliver one row immediately, outside the batch cadence.
    async fn update_single_result(&self, task_id: Uuid, row: &ReportRow) -> Result<()>;
}

/// A sink that writes rows to the log. The default for local runs.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl ReportSink for LogSink {
    async fn update_with_results(&self, rows: &[ReportRow]) -> Result<bool> {
        for row in rows {
            info!(
                task_id = %row.task_id,
                status = %row.status_label,
                error = %row.error,
                "task result"
            );
        }
        Ok(true)
    }

    async fn update_single_result(&self, task_id: Uuid, row: &ReportRow) -> Result<()> {
        info!(task_id = %task_id, status = %row.status_label, error = %row.error, "task notification");
        Ok(())
    }
}

/// Periodic drain of the result store into a [`ReportSink`].
pub struct Reporter {
    results: Arc<ResultStore>,
    sink: Arc<dyn ReportSink>,
    interval: Duration,
}

impl Reporter {
    /// Create a reporter draining `results` into `sink` every `interval`.
    pub fn new(results: Arc<ResultStore>, sink: Arc<dyn ReportSink>, interval: Duration) -> Self {
        Self {
            results,
            sink,
            interval,
        }
    }

    /// Run the periodic drain until `cancel` fires, then flush once more so
    /// shutdown does not strand buffered results.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; skip it so startup does not
        // fire an empty flush.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.flush().await,
            }
        }
        self.flush().await;
        debug!("reporter stopped");
    }

    /// Drain and deliver everything currently buffered.
    pub async fn flush(&self) {
        let batch = self.results.snapshot_and_clear();
        if batch.is_empty() {
            debug!("no new results to report");
            return;
        }

        let rows: Vec<ReportRow> = batch.iter().map(ReportRow::from_result).collect();
        match self.sink.update_with_results(&rows).await {
            Ok(true) => {
                info!(count = rows.len(), "delivered result batch");
            }
            Ok(false) => {
                error!(count = rows.len(), "sink rejected result batch; discarding");
            }
            Err(e) => {
                error!(count = rows.len(), error = %e, "result delivery failed; discarding batch");
            }
        }
    }

    /// Push a single result to the sink immediately.
    pub async fn report_single(&self, task_id: Uuid, result: &TaskResult) {
        let row = ReportRow::from_result(result);
        if let Err(e) = self.sink.update_single_result(task_id, &row).await {
            error!(task_id = %task_id, error = %e, "single-result delivery failed");
        }
    }
}
