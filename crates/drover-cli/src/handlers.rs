//! Built-in demo task bodies.
//!
//! `echo` logs the task's parameters and succeeds; `nap` sleeps for
//! `parameters.seconds` (default 1). Both honor cancellation, so they make
//! serviceable stand-ins while wiring real integrations.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use drover_core::handler::{HandlerOutput, TaskHandler};
use drover_store::Task;

/// Logs the task and echoes its parameters back as the result details.
#[derive(Debug, Default)]
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    fn tag(&self) -> &str {
        "echo"
    }

    async fn run(&self, task: &Task, _cancel: CancellationToken) -> Result<HandlerOutput> {
        info!(task_id = %task.id, name = %task.name, params = %task.parameters, "echo");
        Ok(HandlerOutput::ok_with(serde_json::json!({
            "echoed": task.parameters,
        })))
    }
}

/// Sleeps for `parameters.seconds` (default 1), aborting early on
/// cancellation.
#[derive(Debug, Default)]
pub struct NapHandler;

#[async_trait]
impl TaskHandler for NapHandler {
    fn tag(&self) -> &str {
        "nap"
    }

    async fn run(&self, task: &Task, cancel: CancellationToken) -> Result<HandlerOutput> {
        let seconds = task
            .parameters
            .get("seconds")
            .and_then(|v| v.as_u64())
            .unwrap_or(1);

        tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("nap cancelled"),
            _ = tokio::time::sleep(Duration::from_secs(seconds)) => {
                Ok(HandlerOutput::ok_with(serde_json::json!({ "slept_seconds": seconds })))
            }
        }
    }
}
