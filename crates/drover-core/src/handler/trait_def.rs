//! The `TaskHandler` trait -- the plug-in interface for task bodies.
//!
//! Each concrete handler (Jira export, page sync, chat notification, ...)
//! implements this trait and is selected by a task tag. The trait is
//! intentionally object-safe so handlers can be stored as trait objects in
//! the [`super::HandlerRegistry`].

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use drover_store::Task;

/// Structured outcome of a handler run.
#[derive(Debug, Clone)]
pub struct HandlerOutput {
    /// Whether the body considers the execution successful. `false` marks
    /// the task FAILED just like a returned error, but keeps the details.
    pub success: bool,
    /// Opaque detail map recorded on the execution result.
    pub details: serde_json::Value,
}

impl HandlerOutput {
    /// A bare success with no details.
    pub fn ok() -> Self {
        Self {
            success: true,
            details: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// A success carrying a detail map.
    pub fn ok_with(details: serde_json::Value) -> Self {
        Self {
            success: true,
            details,
        }
    }

    /// A structured failure (business rejection rather than a thrown error).
    pub fn rejected(details: serde_json::Value) -> Self {
        Self {
            success: false,
            details,
        }
    }
}

/// Interface for executing a task's actual work.
///
/// The engine hands the handler an immutable snapshot of the task record
/// and a cancellation token. Handlers must watch the token: it fires on
/// timeout and on shutdown, and a cancelled handler should return promptly
/// (an `Err` is fine; the engine has already decided the outcome).
///
/// # Object Safety
///
/// This trait is object-safe; the registry stores `Arc<dyn TaskHandler>`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// The tag this handler serves (e.g. "jira-export").
    fn tag(&self) -> &str;

    /// Execute the task body.
    ///
    /// Returning `Err` or `HandlerOutput { success: false, .. }` marks the
    /// task FAILED; the error/details end up on the execution result.
    async fn run(&self, task: &Task, cancel: CancellationToken) -> Result<HandlerOutput>;
}

// Compile-time assertion: TaskHandler must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn TaskHandler) {}
};
