//! In-memory task storage with JSON snapshot persistence.
//!
//! This crate owns the task records and execution results of the engine:
//! the [`store::TaskStore`] holds the live task set plus an append-only
//! execution history, and the [`results::ResultStore`] buffers execution
//! results until the reporter drains them. Every store mutation is followed
//! by a best-effort snapshot write so that a restart can recover the task
//! set from `{storage.path}/tasks_snapshot.json`.

pub mod config;
pub mod error;
pub mod models;
pub mod results;
pub mod snapshot;
pub mod store;

pub use error::StoreError;
pub use models::{RetryPolicy, ScheduleKind, Task, TaskPriority, TaskResult, TaskStatus};
pub use results::ResultStore;
pub use store::TaskStore;
