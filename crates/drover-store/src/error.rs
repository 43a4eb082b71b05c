//! Typed errors for store operations.

use thiserror::Error;
use uuid::Uuid;

use crate::models::TaskStatus;

/// Errors returned by [`crate::store::TaskStore`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    TaskNotFound(Uuid),

    #[error("task {0} already exists")]
    DuplicateTask(Uuid),

    #[error("invalid status transition {from} -> {to} for task {id}")]
    InvalidTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("invalid task {id}: {reason}")]
    InvalidTask { id: Uuid, reason: String },

    #[error("dependency cycle: task {id} is reachable from its own dependencies")]
    DependencyCycle { id: Uuid },

    #[error("retry counter for task {id} already at the maximum of {max}")]
    RetriesExhausted { id: Uuid, max: u32 },
}
