//! Cancellation draining
//!
//! `cancel()` returns immediately. A background cleanup loop then waits for
//! any running body to finish and releases the booking. Until it has, the
//! task name stays in the cancelled set and a new `schedule()` for that name
//! blocks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

use singleton_core::{SchedulerError, SchedulerResult};
use singleton_infrastructure::StructuredLogger;

use crate::context::SchedulerContext;
use crate::registry::TaskRegistry;
use crate::stats_collector::SchedulerEvents;
use crate::task::Cancellable;
use crate::tracker::TaskTracker;

#[derive(Default)]
pub struct CancellationRegistry {
    cancelled: Mutex<HashMap<String, Arc<TaskTracker>>>,
    drained: Notify,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Waits until `name` has drained, failing after `timeout`.
    pub async fn wait_for(&self, name: &str, timeout: std::time::Duration) -> SchedulerResult<()> {
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.contains(name) {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(SchedulerError::CancellationPending {
                    task: name.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        }
    }

    fn insert(&self, tracker: Arc<TaskTracker>) {
        self.lock().insert(tracker.name().to_string(), tracker);
    }

    fn finish(&self, tracker: &TaskTracker) {
        {
            let mut cancelled = self.lock();
            if let Some(current) = cancelled.get(tracker.name()) {
                if std::ptr::eq(Arc::as_ptr(current), tracker) {
                    cancelled.remove(tracker.name());
                }
            }
        }
        self.drained.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<TaskTracker>>> {
        self.cancelled.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// [`Cancellable`] handle for one scheduled task.
#[derive(Clone)]
pub struct TaskHandle {
    tracker: Arc<TaskTracker>,
    ctx: Arc<SchedulerContext>,
    registry: Weak<TaskRegistry>,
    cancellations: Arc<CancellationRegistry>,
}

impl TaskHandle {
    pub(crate) fn new(
        tracker: Arc<TaskTracker>,
        ctx: Arc<SchedulerContext>,
        registry: Weak<TaskRegistry>,
        cancellations: Arc<CancellationRegistry>,
    ) -> Self {
        Self {
            tracker,
            ctx,
            registry,
            cancellations,
        }
    }

    pub fn tracker(&self) -> &Arc<TaskTracker> {
        &self.tracker
    }

    /// Runs completed by this node for this handle.
    pub fn completed_runs(&self) -> u64 {
        self.tracker.completed_runs()
    }

    pub fn is_owner(&self) -> bool {
        self.tracker.is_owner()
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task_name", &self.tracker.name())
            .field("state", &self.tracker.state())
            .finish()
    }
}

impl Cancellable for TaskHandle {
    fn cancel(&self, may_interrupt_if_running: bool) {
        if !self.tracker.mark_cancelled(may_interrupt_if_running) {
            return;
        }
        StructuredLogger::log_cancellation_requested(self.tracker.name(), may_interrupt_if_running);
        self.cancellations.insert(Arc::clone(&self.tracker));

        let tracker = Arc::clone(&self.tracker);
        let ctx = Arc::clone(&self.ctx);
        let registry = self.registry.clone();
        let cancellations = Arc::clone(&self.cancellations);
        self.ctx.runtime.spawn(async move {
            drain_cancelled(tracker, ctx, registry, cancellations).await;
        });
    }

    fn is_cancelled(&self) -> bool {
        self.tracker.is_cancelled()
    }

    fn is_done(&self) -> bool {
        self.tracker.is_retired()
    }

    fn task_name(&self) -> &str {
        self.tracker.name()
    }
}

/// Checks every `cancel_check_interval` until the booking is released. One
/// cycle lasts at most `max_wait_time_post_cancel`; cycles repeat until done.
async fn drain_cancelled(
    tracker: Arc<TaskTracker>,
    ctx: Arc<SchedulerContext>,
    registry: Weak<TaskRegistry>,
    cancellations: Arc<CancellationRegistry>,
) {
    let check_interval = ctx.config.cancel_check_interval();
    let max_wait = ctx.config.max_wait_time_post_cancel();
    let mut attempts: u32 = 0;

    'cycles: loop {
        let cycle_end = Instant::now() + max_wait;
        loop {
            attempts += 1;
            let remaining = cycle_end.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, tracker.try_release_after_cancel()).await {
                Ok(Ok(true)) => break 'cycles,
                Ok(Ok(false)) => {}
                Ok(Err(err)) => {
                    warn!(task.name = %tracker.name(), error = %err, "Releasing cancelled booking failed");
                }
                Err(_) => {}
            }
            if Instant::now() + check_interval >= cycle_end {
                break;
            }
            tokio::time::sleep(check_interval).await;
        }
        warn!(
            task.name = %tracker.name(),
            waited_ms = max_wait.as_millis() as u64,
            "Cancelled task still draining"
        );
        tokio::time::sleep(check_interval).await;
    }

    if let Some(registry) = registry.upgrade() {
        if registry.remove_if_same(tracker.name(), &tracker) {
            ctx.events.task_removed(tracker.name());
        }
    }
    cancellations.finish(&tracker);
    StructuredLogger::log_cancellation_drained(tracker.name(), attempts);
}
