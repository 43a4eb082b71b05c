//! Declarative TOML task files.
//!
//! A task file seeds the store with a set of task definitions at startup:
//!
//! ```toml
//! [[tasks]]
//! name = "nightly-export"
//! schedule = "scheduled"
//! cron = "0 2 * * *"
//! priority = "high"
//! tags = ["jira-export"]
//!
//! [[tasks]]
//! name = "summarize"
//! depends_on = ["nightly-export"]
//! ```
//!
//! Dependencies reference other entries by name; materialization mints a
//! UUID per entry and rewrites the references. Validation covers duplicate
//! names, unknown references, dependency cycles, and cron syntax.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use drover_store::{RetryPolicy, ScheduleKind, Task, TaskPriority, TaskStore};

use crate::cron::parse_cron_expr;

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

/// Top-level structure of a task file.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskFile {
    #[serde(default)]
    pub tasks: Vec<TaskEntry>,
}

/// A single `[[tasks]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskEntry {
    /// Unique name within the file; referenced by `depends_on`.
    pub name: String,
    /// "immediate" (default) or "scheduled".
    #[serde(default = "default_schedule")]
    pub schedule: String,
    /// 5-field cron expression; required for scheduled entries.
    #[serde(default)]
    pub cron: Option<String>,
    /// "high", "medium" (default), or "low".
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub owner: Option<String>,
    /// Opaque parameters handed to the handler.
    #[serde(default)]
    pub parameters: toml::Table,
    /// Names of entries that must complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u32>,
    #[serde(default)]
    pub retry: Option<RetryEntry>,
}

/// Retry policy fields of an entry.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryEntry {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_delay_secs: u32,
    #[serde(default = "default_backoff")]
    pub backoff_factor: f64,
}

fn default_schedule() -> String {
    "immediate".to_owned()
}

fn default_priority() -> String {
    "medium".to_owned()
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff() -> f64 {
    2.0
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Errors that can occur during task-file parsing and validation.
#[derive(Debug, Error)]
pub enum TaskFileError {
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("task file contains no tasks")]
    NoTasks,

    #[error("duplicate task name: {0:?}")]
    DuplicateTaskName(String),

    #[error("task {task:?} depends on unknown task {dependency:?}")]
    UnknownDependency { task: String, dependency: String },

    #[error("invalid schedule {value:?} on task {task:?} (expected immediate or scheduled)")]
    InvalidSchedule { task: String, value: String },

    #[error("invalid priority {value:?} on task {task:?} (expected high, medium, or low)")]
    InvalidPriority { task: String, value: String },

    #[error("task {task:?} is scheduled but has no cron expression")]
    MissingCron { task: String },

    #[error("invalid cron on task {task:?}: {reason}")]
    InvalidCron { task: String, reason: String },

    #[error("dependency cycle detected involving tasks: {0}")]
    CycleDetected(String),

    #[error("could not insert task {task:?}: {reason}")]
    InsertFailed { task: String, reason: String },
}

/// Parse and validate a task file.
pub fn parse_task_file(content: &str) -> Result<TaskFile, TaskFileError> {
    let file: TaskFile = toml::from_str(content)?;
    validate(&file)?;
    Ok(file)
}

fn validate(file: &TaskFile) -> Result<(), TaskFileError> {
    if file.tasks.is_empty() {
        return Err(TaskFileError::NoTasks);
    }

    let mut seen = HashSet::new();
    for task in &file.tasks {
        if !seen.insert(&task.name) {
            return Err(TaskFileError::DuplicateTaskName(task.name.clone()));
        }
    }

    for task in &file.tasks {
        let kind = parse_schedule(task)?;
        parse_priority(task)?;

        match (&kind, &task.cron) {
            (ScheduleKind::Scheduled, None) => {
                return Err(TaskFileError::MissingCron {
                    task: task.name.clone(),
                });
            }
            (_, Some(expr)) => {
                parse_cron_expr(expr).map_err(|e| TaskFileError::InvalidCron {
                    task: task.name.clone(),
                    reason: e.to_string(),
                })?;
            }
            _ => {}
        }

        for dep in &task.depends_on {
            if !seen.contains(dep) {
                return Err(TaskFileError::UnknownDependency {
                    task: task.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    check_for_cycles(file)
}

fn parse_schedule(task: &TaskEntry) -> Result<ScheduleKind, TaskFileError> {
    match task.schedule.as_str() {
        "immediate" => Ok(ScheduleKind::Immediate),
        "scheduled" => Ok(ScheduleKind::Scheduled),
        other => Err(TaskFileError::InvalidSchedule {
            task: task.name.clone(),
            value: other.to_owned(),
        }),
    }
}

fn parse_priority(task: &TaskEntry) -> Result<TaskPriority, TaskFileError> {
    match task.priority.as_str() {
        "high" => Ok(TaskPriority::High),
        "medium" => Ok(TaskPriority::Medium),
        "low" => Ok(TaskPriority::Low),
        other => Err(TaskFileError::InvalidPriority {
            task: task.name.clone(),
            value: other.to_owned(),
        }),
    }
}

/// Detect dependency cycles using Kahn's algorithm for topological sort.
fn check_for_cycles(file: &TaskFile) -> Result<(), TaskFileError> {
    let task_names: Vec<&str> = file.tasks.iter().map(|t| t.name.as_str()).collect();
    let name_to_idx: HashMap<&str, usize> = task_names
        .iter()
        .enumerate()
        .map(|(i, name)| (*name, i))
        .collect();

    let n = task_names.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];

    for task in &file.tasks {
        let task_idx = name_to_idx[task.name.as_str()];
        for dep_name in &task.depends_on {
            let dep_idx = name_to_idx[dep_name.as_str()];
            adj[dep_idx].push(task_idx);
            in_degree[task_idx] += 1;
        }
    }

    let mut queue: VecDeque<usize> = VecDeque::new();
    for (i, deg) in in_degree.iter().enumerate() {
        if *deg == 0 {
            queue.push_back(i);
        }
    }

    let mut sorted_count = 0usize;
    while let Some(node) = queue.pop_front() {
        sorted_count += 1;
        for &neighbor in &adj[node] {
            in_degree[neighbor] -= 1;
            if in_degree[neighbor] == 0 {
                queue.push_back(neighbor);
            }
        }
    }

    if sorted_count != n {
        let cycle_tasks: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg > 0)
            .map(|(i, _)| task_names[i])
            .collect();
        return Err(TaskFileError::CycleDetected(cycle_tasks.join(", ")));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Materialization
// ---------------------------------------------------------------------------

/// Insert every entry of a validated file into the store.
///
/// Each entry gets a freshly minted id; `depends_on` names are rewritten
/// to the minted ids. Returns the inserted tasks in file order.
pub fn materialize(file: &TaskFile, store: &Arc<TaskStore>) -> Result<Vec<Task>, TaskFileError> {
    let ids: HashMap<&str, Uuid> = file
        .tasks
        .iter()
        .map(|t| (t.name.as_str(), Uuid::new_v4()))
        .collect();

    let mut inserted = Vec::with_capacity(file.tasks.len());
    for entry in &file.tasks {
        let kind = parse_schedule(entry)?;
        let priority = parse_priority(entry)?;

        let mut task = Task::new(entry.name.clone(), kind);
        task.id = ids[entry.name.as_str()];
        task.cron_expr = entry.cron.clone();
        task.priority = priority;
        task.tags = entry.tags.clone();
        task.owner = entry.owner.clone();
        task.parameters = serde_json::to_value(&entry.parameters).unwrap_or_default();
        task.dependencies = entry
            .depends_on
            .iter()
            .map(|name| ids[name.as_str()])
            .collect();
        task.timeout_seconds = entry.timeout_seconds;
        task.retry_policy = entry.retry.as_ref().map(|r| RetryPolicy {
            max_retries: r.max_retries,
            retry_delay_secs: r.retry_delay_secs,
            backoff_factor: r.backoff_factor,
            current_retries: 0,
        });

        let task = store.add(task).map_err(|e| TaskFileError::InsertFailed {
            task: entry.name.clone(),
            reason: e.to_string(),
        })?;
        inserted.push(task);
    }

    info!(count = inserted.len(), "task file materialized");
    Ok(inserted)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_file() {
        let content = r#"
[[tasks]]
name = "only"
"#;
        let file = parse_task_file(content).expect("should parse");
        assert_eq!(file.tasks.len(), 1);
        assert_eq!(file.tasks[0].schedule, "immediate");
        assert_eq!(file.tasks[0].priority, "medium");
        assert!(file.tasks[0].depends_on.is_empty());
    }

    #[test]
    fn parse_full_file() {
        let content = r#"
[[tasks]]
name = "export"
schedule = "scheduled"
cron = "0 2 * * *"
priority = "high"
tags = ["jira-export"]
owner = "ops"
timeout_seconds = 120

[tasks.parameters]
project = "PROJ"

[tasks.retry]
max_retries = 2
retry_delay_secs = 5
backoff_factor = 1.5

[[tasks]]
name = "summarize"
depends_on = ["export"]
"#;
        let file = parse_task_file(content).expect("should parse");
        assert_eq!(file.tasks.len(), 2);
        assert_eq!(file.tasks[0].cron.as_deref(), Some("0 2 * * *"));
        assert_eq!(file.tasks[0].retry.as_ref().unwrap().max_retries, 2);
        assert_eq!(file.tasks[1].depends_on, vec!["export".to_owned()]);
    }

    #[test]
    fn rejects_empty_file() {
        let err = parse_task_file("").unwrap_err();
        assert!(matches!(err, TaskFileError::NoTasks));
    }

    #[test]
    fn rejects_duplicate_names() {
        let content = r#"
[[tasks]]
name = "twin"

[[tasks]]
name = "twin"
"#;
        let err = parse_task_file(content).unwrap_err();
        assert!(matches!(err, TaskFileError::DuplicateTaskName(name) if name == "twin"));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let content = r#"
[[tasks]]
name = "child"
depends_on = ["ghost"]
"#;
        let err = parse_task_file(content).unwrap_err();
        assert!(matches!(err, TaskFileError::UnknownDependency { .. }));
    }

    #[test]
    fn rejects_cycle() {
        let content = r#"
[[tasks]]
name = "a"
depends_on = ["b"]

[[tasks]]
name = "b"
depends_on = ["a"]
"#;
        let err = parse_task_file(content).unwrap_err();
        assert!(matches!(err, TaskFileError::CycleDetected(_)));
    }

    #[test]
    fn rejects_scheduled_without_cron() {
        let content = r#"
[[tasks]]
name = "nightly"
schedule = "scheduled"
"#;
        let err = parse_task_file(content).unwrap_err();
        assert!(matches!(err, TaskFileError::MissingCron { .. }));
    }

    #[test]
    fn rejects_bad_cron() {
        let content = r#"
[[tasks]]
name = "nightly"
schedule = "scheduled"
cron = "99 * * * *"
"#;
        let err = parse_task_file(content).unwrap_err();
        assert!(matches!(err, TaskFileError::InvalidCron { .. }));
    }

    #[test]
    fn rejects_bad_schedule_and_priority() {
        let err = parse_task_file("[[tasks]]\nname = \"x\"\nschedule = \"sometimes\"\n").unwrap_err();
        assert!(matches!(err, TaskFileError::InvalidSchedule { .. }));

        let err = parse_task_file("[[tasks]]\nname = \"x\"\npriority = \"urgent\"\n").unwrap_err();
        assert!(matches!(err, TaskFileError::InvalidPriority { .. }));
    }

    #[test]
    fn materialize_resolves_dependencies() {
        let content = r#"
[[tasks]]
name = "parent"
priority = "high"

[[tasks]]
name = "child"
depends_on = ["parent"]
"#;
        let file = parse_task_file(content).expect("parse");
        let store = Arc::new(TaskStore::in_memory());
        let tasks = materialize(&file, &store).expect("materialize");

        assert_eq!(tasks.len(), 2);
        let parent = &tasks[0];
        let child = &tasks[1];
        assert_eq!(parent.priority, TaskPriority::High);
        assert_eq!(child.dependencies, vec![parent.id]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn materialize_carries_parameters() {
        let content = r#"
[[tasks]]
name = "export"
tags = ["jira-export"]

[tasks.parameters]
project = "PROJ"
limit = 50
"#;
        let file = parse_task_file(content).expect("parse");
        let store = Arc::new(TaskStore::in_memory());
        let tasks = materialize(&file, &store).expect("materialize");

        assert_eq!(tasks[0].parameters["project"], "PROJ");
        assert_eq!(tasks[0].parameters["limit"], 50);
    }
}
