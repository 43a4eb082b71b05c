//! Trigger registry: recurring cron entries and one-shot date entries.
//!
//! Cron expressions are parsed via the `cron` crate, which expects a
//! seconds-first format; the standard 5-field form (minute, hour,
//! day-of-month, month, day-of-week) is required at the API boundary and
//! normalized by prepending a zero seconds field. A single background loop
//! checks all entries once per tick and emits [`TriggerFire`] events over a
//! channel; one-shot date entries back the retry delays.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use drover_store::TaskPriority;

// ---------------------------------------------------------------------------
// Errors and parsing
// ---------------------------------------------------------------------------

/// Errors from cron expression handling.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("cron expression {expr:?} has {count} fields, expected 5")]
    WrongFieldCount { expr: String, count: usize },

    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidExpression { expr: String, reason: String },

    #[error("cron expression {expr:?} never fires")]
    NeverFires { expr: String },
}

/// Parse a standard 5-field cron expression.
pub fn parse_cron_expr(expr: &str) -> Result<cron::Schedule, TriggerError> {
    let count = expr.split_whitespace().count();
    if count != 5 {
        return Err(TriggerError::WrongFieldCount {
            expr: expr.to_owned(),
            count,
        });
    }
    let normalized = format!("0 {expr}");
    cron::Schedule::from_str(&normalized).map_err(|e| TriggerError::InvalidExpression {
        expr: expr.to_owned(),
        reason: e.to_string(),
    })
}

/// First occurrence strictly after `after`.
fn next_occurrence(schedule: &cron::Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Count the occurrences in `(planned, now]` and return the next planned
/// fire after `now`. `planned` is the occurrence that just came due, so the
/// count is at least one.
fn due_occurrences(
    schedule: &cron::Schedule,
    planned: DateTime<Utc>,
    now: DateTime<Utc>,
) -> (u32, Option<DateTime<Utc>>) {
    let mut count = 1u32;
    let mut cursor = planned;
    loop {
        match next_occurrence(schedule, cursor) {
            Some(next) if next <= now => {
                count += 1;
                cursor = next;
            }
            next => return (count, next),
        }
    }
}

// ---------------------------------------------------------------------------
// Fire events
// ---------------------------------------------------------------------------

/// Why a trigger fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireKind {
    /// A recurring cron occurrence: enqueue the task.
    Cron,
    /// A retry delay elapsed: return the task to PENDING and enqueue it.
    Retry,
}

/// Event emitted when a trigger comes due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerFire {
    pub task_id: Uuid,
    pub priority: TaskPriority,
    pub kind: FireKind,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Knobs for the trigger loop.
#[derive(Debug, Clone)]
pub struct TriggerConfig {
    /// How often entries are checked for due fires.
    pub tick: Duration,
    /// Collapse a backlog of missed cron occurrences into a single fire.
    pub coalesce: bool,
    /// Without coalescing, at most this many missed occurrences fire; the
    /// rest are dropped with a warning.
    pub max_instances: u32,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            coalesce: false,
            max_instances: 5,
        }
    }
}

#[derive(Debug)]
enum EntryKind {
    Cron {
        schedule: cron::Schedule,
        next_fire: DateTime<Utc>,
    },
    Once {
        at: DateTime<Utc>,
        fire: FireKind,
    },
}

#[derive(Debug)]
struct TriggerEntry {
    task_id: Uuid,
    priority: TaskPriority,
    kind: EntryKind,
}

/// Registry of cron and one-shot triggers, drained by a background loop.
pub struct TriggerRegistry {
    config: TriggerConfig,
    entries: Arc<Mutex<HashMap<String, TriggerEntry>>>,
    tx: mpsc::UnboundedSender<TriggerFire>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<TriggerFire>>>,
    once_seq: AtomicU64,
}

impl TriggerRegistry {
    /// Create a registry. Call [`TriggerRegistry::take_events`] to obtain
    /// the fire-event receiver and [`TriggerRegistry::start`] to spawn the
    /// check loop.
    pub fn new(config: TriggerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            config,
            entries: Arc::new(Mutex::new(HashMap::new())),
            tx,
            rx: Mutex::new(Some(rx)),
            once_seq: AtomicU64::new(0),
        }
    }

    /// Register (or replace) the recurring trigger for a task.
    pub fn register_cron(
        &self,
        task_id: Uuid,
        expr: &str,
        priority: TaskPriority,
    ) -> Result<(), TriggerError> {
        let schedule = parse_cron_expr(expr)?;
        let next_fire = next_occurrence(&schedule, Utc::now()).ok_or(TriggerError::NeverFires {
            expr: expr.to_owned(),
        })?;

        info!(task_id = %task_id, cron = %expr, next_fire = %next_fire, "cron trigger registered");

        let mut entries = self.entries.lock().expect("trigger registry lock poisoned");
        entries.insert(
            cron_key(task_id),
            TriggerEntry {
                task_id,
                priority,
                kind: EntryKind::Cron { schedule, next_fire },
            },
        );
        Ok(())
    }

    /// Register a one-shot trigger at an absolute time.
    pub fn register_once(
        &self,
        task_id: Uuid,
        at: DateTime<Utc>,
        priority: TaskPriority,
        fire: FireKind,
    ) {
        let seq = self.once_seq.fetch_add(1, Ordering::Relaxed);
        debug!(task_id = %task_id, at = %at, kind = ?fire, "one-shot trigger registered");

        let mut entries = self.entries.lock().expect("trigger registry lock poisoned");
        entries.insert(
            format!("once-{task_id}-{seq}"),
            TriggerEntry {
                task_id,
                priority,
                kind: EntryKind::Once { at, fire },
            },
        );
    }

    /// Remove a task's recurring trigger. Returns `true` when one existed.
    pub fn remove_cron(&self, task_id: Uuid) -> bool {
        let mut entries = self.entries.lock().expect("trigger registry lock poisoned");
        entries.remove(&cron_key(task_id)).is_some()
    }

    /// True when the task has a recurring trigger registered.
    pub fn has_cron(&self, task_id: Uuid) -> bool {
        let entries = self.entries.lock().expect("trigger registry lock poisoned");
        entries.contains_key(&cron_key(task_id))
    }

    /// True when an un-fired retry trigger exists for the task.
    pub fn has_pending_retry(&self, task_id: Uuid) -> bool {
        let entries = self.entries.lock().expect("trigger registry lock poisoned");
        entries.values().any(|e| {
            e.task_id == task_id
                && matches!(
                    e.kind,
                    EntryKind::Once {
                        fire: FireKind::Retry,
                        ..
                    }
                )
        })
    }

    /// Planned next fire of a task's recurring trigger.
    pub fn next_cron_fire(&self, task_id: Uuid) -> Option<DateTime<Utc>> {
        let entries = self.entries.lock().expect("trigger registry lock poisoned");
        entries.get(&cron_key(task_id)).and_then(|e| match &e.kind {
            EntryKind::Cron { next_fire, .. } => Some(*next_fire),
            EntryKind::Once { .. } => None,
        })
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("trigger registry lock poisoned")
            .len()
    }

    /// True when no entries are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the fire-event receiver. Yields `Some` exactly once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TriggerFire>> {
        self.rx.lock().expect("trigger registry lock poisoned").take()
    }

    /// Spawn the background check loop. The loop runs until `cancel` fires.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.config.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => registry.check_due(Utc::now()),
                }
            }
            debug!("trigger loop stopped");
        })
    }

    /// Fire every due entry. Split out from the loop so tests can drive it
    /// with an explicit clock.
    fn check_due(&self, now: DateTime<Utc>) {
        let mut fires: Vec<TriggerFire> = Vec::new();

        {
            let mut entries = self.entries.lock().expect("trigger registry lock poisoned");
            let mut spent: Vec<String> = Vec::new();

            for (key, entry) in entries.iter_mut() {
                match &mut entry.kind {
                    EntryKind::Once { at, fire } => {
                        if *at <= now {
                            fires.push(TriggerFire {
                                task_id: entry.task_id,
                                priority: entry.priority,
                                kind: *fire,
                            });
                            spent.push(key.clone());
                        }
                    }
                    EntryKind::Cron { schedule, next_fire } => {
                        if *next_fire > now {
                            continue;
                        }
                        let (due, next) = due_occurrences(schedule, *next_fire, now);
                        let emit = if self.config.coalesce {
                            1
                        } else {
                            due.min(self.config.max_instances.max(1))
                        };
                        if due > emit {
                            warn!(
                                task_id = %entry.task_id,
                                missed = due,
                                emitted = emit,
                                "dropping excess cron fires"
                            );
                        }
                        for _ in 0..emit {
                            fires.push(TriggerFire {
                                task_id: entry.task_id,
                                priority: entry.priority,
                                kind: FireKind::Cron,
                            });
                        }
                        match next {
                            Some(next) => *next_fire = next,
                            // The schedule has no future occurrences.
                            None => spent.push(key.clone()),
                        }
                    }
                }
            }

            for key in spent {
                entries.remove(&key);
            }
        }

        for fire in fires {
            debug!(task_id = %fire.task_id, kind = ?fire.kind, "trigger fired");
            // The receiver only disappears at shutdown.
            let _ = self.tx.send(fire);
        }
    }
}

fn cron_key(task_id: Uuid) -> String {
    format!("cron-{task_id}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
