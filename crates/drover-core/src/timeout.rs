//! Per-task deadline timers.
//!
//! The supervisor keeps at most one armed timer per task id. Each timer is
//! a lightweight tokio task racing a sleep against a cancellation token;
//! when the deadline wins, the timer removes itself and invokes the
//! scheduler-supplied callback, which preempts the worker and decides on a
//! retry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug)]
struct TimerEntry {
    /// Distinguishes this timer from a replacement armed for the same id.
    generation: u64,
    token: CancellationToken,
}

/// Deadline timers keyed by task id.
#[derive(Debug, Default)]
pub struct TimeoutSupervisor {
    timers: Arc<Mutex<HashMap<Uuid, TimerEntry>>>,
    next_generation: AtomicU64,
}

impl TimeoutSupervisor {
    /// Create a supervisor with no armed timers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a one-shot timer for `id`, replacing any existing one.
    ///
    /// After `timeout` elapses the timer disarms itself and runs `on_fire`.
    /// A [`TimeoutSupervisor::disarm`] call beforehand cancels it silently.
    pub fn arm<F, Fut>(&self, id: Uuid, timeout: Duration, on_fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let previous = {
            let mut timers = self.timers.lock().expect("timeout supervisor lock poisoned");
            timers.insert(
                id,
                TimerEntry {
                    generation,
                    token: token.clone(),
                },
            )
        };
        if let Some(previous) = previous {
            previous.token.cancel();
        }

        let timers = Arc::clone(&self.timers);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    // Only fire if this timer is still the registered one
                    // (a re-arm may have replaced it while sleeping).
                    let current = {
                        let mut map = timers.lock().expect("timeout supervisor lock poisoned");
                        match map.get(&id) {
                            Some(entry) if entry.generation == generation => {
                                map.remove(&id);
                                true
                            }
                            _ => false,
                        }
                    };
                    if current {
                        debug!(task_id = %id, "task deadline elapsed");
                        on_fire().await;
                    }
                }
            }
        });
    }

    /// Cancel the timer for `id`, if armed.
    pub fn disarm(&self, id: Uuid) {
        let entry = {
            let mut timers = self.timers.lock().expect("timeout supervisor lock poisoned");
            timers.remove(&id)
        };
        if let Some(entry) = entry {
            entry.token.cancel();
        }
    }

    /// Cancel every armed timer.
    pub fn shutdown(&self) {
        let entries: Vec<TimerEntry> = {
            let mut timers = self.timers.lock().expect("timeout supervisor lock poisoned");
            timers.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.token.cancel();
        }
    }

    /// Number of armed timers.
    pub fn armed_len(&self) -> usize {
        self.timers
            .lock()
            .expect("timeout supervisor lock poisoned")
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn timer_fires_after_deadline() {
        let supervisor = TimeoutSupervisor::new();
        let fired = Arc::new(AtomicU32::new(0));
        let id = Uuid::new_v4();

        let counter = Arc::clone(&fired);
        supervisor.arm(id, Duration::from_millis(20), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(supervisor.armed_len(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.armed_len(), 0);
    }

    #[tokio::test]
    async fn disarm_prevents_firing() {
        let supervisor = TimeoutSupervisor::new();
        let fired = Arc::new(AtomicU32::new(0));
        let id = Uuid::new_v4();

        let counter = Arc::clone(&fired);
        supervisor.arm(id, Duration::from_millis(20), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        supervisor.disarm(id);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(supervisor.armed_len(), 0);
    }

    #[tokio::test]
    async fn rearm_replaces_previous_timer() {
        let supervisor = TimeoutSupervisor::new();
        let fired = Arc::new(AtomicU32::new(0));
        let id = Uuid::new_v4();

        let first = Arc::clone(&fired);
        supervisor.arm(id, Duration::from_millis(20), move || async move {
            first.fetch_add(1, Ordering::SeqCst);
        });
        let second = Arc::clone(&fired);
        supervisor.arm(id, Duration::from_millis(40), move || async move {
            second.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(supervisor.armed_len(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        // Only the replacement fired.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_disarms_everything() {
        let supervisor = TimeoutSupervisor::new();
        let fired = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let counter = Arc::clone(&fired);
            supervisor.arm(Uuid::new_v4(), Duration::from_millis(20), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(supervisor.armed_len(), 3);

        supervisor.shutdown();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(supervisor.armed_len(), 0);
    }
}
