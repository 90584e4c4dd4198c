//! Periodic task scheduling.
//!
//! The connection handler registers exactly one recurring task here (the
//! keep-alive ping) and cancels it exactly once when the server is killed.
//! [`TokioScheduler`] runs each task on its own Tokio timer task.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;

/// Callback invoked each time a scheduled task fires.
pub type TaskCallback = Box<dyn Fn() + Send + Sync + 'static>;

/// Identifies a scheduled task for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// Wraps a raw id.  Implementations of [`Scheduler`] choose their own numbering.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Schedules callbacks to run after (or every) `interval`.
#[cfg_attr(test, mockall::automock)]
pub trait Scheduler: Send + Sync {
    /// Registers `task` to run after `interval`, repeating if `recurring`.
    fn schedule_task(&self, task: TaskCallback, interval: Duration, recurring: bool) -> TaskId;

    /// Stops a task.  Cancelling an unknown or already-cancelled task is a no-op.
    fn cancel_task(&self, id: TaskId);
}

/// [`Scheduler`] backed by Tokio timers.
///
/// Must be used from within a Tokio runtime.  Dropping the scheduler cancels
/// every task it still owns.
#[derive(Debug, Default)]
pub struct TokioScheduler {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<TaskId, AbortHandle>>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks registered and not yet cancelled.
    pub fn active_tasks(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, AbortHandle>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_task(&self, task: TaskCallback, interval: Duration, recurring: bool) -> TaskId {
        let id = TaskId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        // `tokio::time::interval` panics on a zero period.
        let period = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                task();
                if !recurring {
                    break;
                }
            }
        });

        debug!("scheduled {id} every {period:?} (recurring: {recurring})");
        self.lock().insert(id, handle.abort_handle());
        id
    }

    fn cancel_task(&self, id: TaskId) {
        if let Some(handle) = self.lock().remove(&id) {
            handle.abort();
            debug!("cancelled {id}");
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, handle) in self.lock().drain() {
            handle.abort();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
