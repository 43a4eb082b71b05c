use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Queued,
    Scheduled,
    Running,
    Done,
    Failed,
    Retry,
    Timeout,
}

impl TaskStatus {
    /// Check whether `self -> to` is a legal edge in the lifecycle graph.
    ///
    /// ```text
    /// PENDING   -> QUEUED | SCHEDULED | FAILED (rejected at admit)
    /// SCHEDULED -> QUEUED            (cron fire)
    /// QUEUED    -> RUNNING
    /// RUNNING   -> DONE | FAILED | TIMEOUT
    /// DONE      -> QUEUED            (next fire of a recurring task)
    /// FAILED    -> RETRY             (retry policy applies)
    /// TIMEOUT   -> RETRY
    /// RETRY     -> PENDING           (delay elapsed)
    /// ```
    ///
    /// `DONE` ends an execution; `FAILED` and `TIMEOUT` are terminal once
    /// the retry policy is exhausted or absent.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        matches!(
            (self, to),
            (TaskStatus::Pending, TaskStatus::Queued)
                | (TaskStatus::Pending, TaskStatus::Scheduled)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Scheduled, TaskStatus::Queued)
                | (TaskStatus::Queued, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Done)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Timeout)
                | (TaskStatus::Done, TaskStatus::Queued)
                | (TaskStatus::Failed, TaskStatus::Retry)
                | (TaskStatus::Timeout, TaskStatus::Retry)
                | (TaskStatus::Retry, TaskStatus::Pending)
        )
    }

    /// True for states that end an execution (and are copied to history).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Timeout
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Queued => "QUEUED",
            Self::Scheduled => "SCHEDULED",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Retry => "RETRY",
            Self::Timeout => "TIMEOUT",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "QUEUED" => Ok(Self::Queued),
            "SCHEDULED" => Ok(Self::Scheduled),
            "RUNNING" => Ok(Self::Running),
            "DONE" => Ok(Self::Done),
            "FAILED" => Ok(Self::Failed),
            "RETRY" => Ok(Self::Retry),
            "TIMEOUT" => Ok(Self::Timeout),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Execution priority. Lower numeric value wins in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    High,
    Medium,
    Low,
}

impl TaskPriority {
    /// Numeric queue value: HIGH=0, MEDIUM=50, LOW=100.
    pub fn queue_value(self) -> u8 {
        match self {
            Self::High => 0,
            Self::Medium => 50,
            Self::Low => 100,
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Medium
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskPriority {
    type Err = TaskPriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HIGH" => Ok(Self::High),
            "MEDIUM" => Ok(Self::Medium),
            "LOW" => Ok(Self::Low),
            other => Err(TaskPriorityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskPriority`] string.
#[derive(Debug, Clone)]
pub struct TaskPriorityParseError(pub String);

impl fmt::Display for TaskPriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task priority: {:?}", self.0)
    }
}

impl std::error::Error for TaskPriorityParseError {}

// ---------------------------------------------------------------------------

/// When a task runs: as soon as a worker is free, or on a cron schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleKind {
    Immediate,
    Scheduled,
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Immediate => "IMMEDIATE",
            Self::Scheduled => "SCHEDULED",
        };
        f.write_str(s)
    }
}

impl FromStr for ScheduleKind {
    type Err = ScheduleKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IMMEDIATE" => Ok(Self::Immediate),
            "SCHEDULED" => Ok(Self::Scheduled),
            other => Err(ScheduleKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ScheduleKind`] string.
#[derive(Debug, Clone)]
pub struct ScheduleKindParseError(pub String);

impl fmt::Display for ScheduleKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid schedule kind: {:?}", self.0)
    }
}

impl std::error::Error for ScheduleKindParseError {}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Governs re-execution of a failed or timed-out task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Initial delay before the first retry, in seconds.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u32,
    /// Each retry multiplies the delay by this factor. Must be >= 1.0.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default)]
    pub current_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_secs() -> u32 {
    60
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            backoff_factor: default_backoff_factor(),
            current_retries: 0,
        }
    }
}

impl RetryPolicy {
    /// True while retry attempts remain.
    pub fn should_retry(&self) -> bool {
        self.current_retries < self.max_retries
    }

    /// Delay before the next attempt: `retry_delay_secs *
    /// backoff_factor^(current_retries - 1)`, evaluated after the counter
    /// has been incremented for the attempt being scheduled.
    pub fn next_delay(&self) -> Duration {
        let exponent = self.current_retries.saturating_sub(1);
        let secs = f64::from(self.retry_delay_secs) * self.backoff_factor.powi(exponent as i32);
        // Clamp so a pathological policy cannot overflow the conversion.
        Duration::from_secs_f64(secs.clamp(0.0, f64::from(u32::MAX)))
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of work with identity, schedule, status, and parameters.
///
/// The store exclusively owns task records; every other component holds
/// task ids and queries the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub owner: Option<String>,
    pub schedule_kind: ScheduleKind,
    #[serde(default)]
    pub cron_expr: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Routes the task body: the first tag with a registered handler wins.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Opaque to the engine; validated by the handler.
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    #[serde(default)]
    pub timeout_seconds: Option<u32>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every persisted mutation.
    #[serde(default = "default_version")]
    pub version: u64,
}

fn default_version() -> u64 {
    1
}

impl Task {
    /// Create a task in PENDING with a freshly minted id and defaults.
    pub fn new(name: impl Into<String>, schedule_kind: ScheduleKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            owner: None,
            schedule_kind,
            cron_expr: None,
            status: TaskStatus::Pending,
            priority: TaskPriority::Medium,
            tags: Vec::new(),
            parameters: serde_json::Value::Object(serde_json::Map::new()),
            dependencies: Vec::new(),
            timeout_seconds: None,
            retry_policy: None,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Structural validation applied on insert.
    ///
    /// A SCHEDULED task must carry a cron expression and an IMMEDIATE task
    /// must not; the expression itself is checked where the trigger is
    /// registered.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".to_owned());
        }
        match self.schedule_kind {
            ScheduleKind::Scheduled if self.cron_expr.is_none() => {
                return Err("SCHEDULED task requires a cron expression".to_owned());
            }
            ScheduleKind::Immediate if self.cron_expr.is_some() => {
                return Err("IMMEDIATE task must not carry a cron expression".to_owned());
            }
            _ => {}
        }
        if let Some(timeout) = self.timeout_seconds {
            if timeout == 0 {
                return Err("timeout_seconds must be positive".to_owned());
            }
        }
        if let Some(policy) = &self.retry_policy {
            if policy.backoff_factor < 1.0 {
                return Err("retry backoff_factor must be >= 1.0".to_owned());
            }
            if policy.current_retries > policy.max_retries {
                return Err("current_retries exceeds max_retries".to_owned());
            }
        }
        if self.dependencies.contains(&self.id) {
            return Err("task cannot depend on itself".to_owned());
        }
        Ok(())
    }

    /// True once the retry policy no longer permits another attempt.
    pub fn should_retry(&self) -> bool {
        self.retry_policy
            .as_ref()
            .is_some_and(RetryPolicy::should_retry)
    }
}

// ---------------------------------------------------------------------------
// Task result
// ---------------------------------------------------------------------------

/// Outcome of one execution of a task, buffered until the reporter ships it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    /// Handler-produced detail map; carries an `error` entry on failure.
    pub details: serde_json::Value,
}

impl TaskResult {
    /// Build a success result with the handler's detail map.
    pub fn ok(task_id: Uuid, details: serde_json::Value) -> Self {
        Self {
            task_id,
            success: true,
            timestamp: Utc::now(),
            details,
        }
    }

    /// Build a failure result carrying the error message.
    pub fn failed(task_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            task_id,
            success: false,
            timestamp: Utc::now(),
            details: serde_json::json!({ "error": error.into() }),
        }
    }

    /// The `error` detail, if any.
    pub fn error(&self) -> Option<&str> {
        self.details.get("error").and_then(|v| v.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
