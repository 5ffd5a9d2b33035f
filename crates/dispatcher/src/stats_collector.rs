//! Scheduler event sinks
//!
//! Every component reports through [`SchedulerEvents`]. The scheduler fans
//! each event out to the built-in [`StatsCollector`] and to any sinks added
//! on the builder. A panicking sink is logged and otherwise ignored.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::error;

use singleton_infrastructure::MetricsCollector;

/// 调度器事件接收接口
#[allow(unused_variables)]
pub trait SchedulerEvents: Send + Sync {
    fn task_added(&self, task_name: &str) {}

    fn task_removed(&self, task_name: &str) {}

    fn task_done(&self, task_name: &str) {}

    fn membership_changed(&self, members: usize) {}

    /// Tasks this node gained ownership of across a membership change.
    fn tasks_added_from_membership(&self, count: usize) {}

    /// Tasks this node lost across a membership change.
    fn tasks_removed_from_membership(&self, count: usize) {}

    fn run_set_size(&self, size: usize) {}

    fn computed_weight(&self, weight: u64) {}

    fn unexpected_error(&self, task_name: &str, kind: &str) {}
}

/// Point-in-time view of the counters kept by [`StatsCollector`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tasks_added: u64,
    pub tasks_removed: u64,
    pub active_tasks: usize,
    pub task_runs: u64,
    pub runs_per_task: HashMap<String, u64>,
    pub membership_changes: u64,
    pub members: usize,
    pub tasks_added_from_membership: u64,
    pub tasks_removed_from_membership: u64,
    pub run_set_size: usize,
    pub computed_weight: u64,
    pub unexpected_errors: u64,
}

impl StatsSnapshot {
    pub fn runs_of(&self, task_name: &str) -> u64 {
        self.runs_per_task.get(task_name).copied().unwrap_or(0)
    }
}

/// Counts scheduler events and mirrors them to the `metrics` facade.
pub struct StatsCollector {
    metrics: MetricsCollector,
    tasks_added: AtomicU64,
    tasks_removed: AtomicU64,
    task_runs: AtomicU64,
    runs_per_task: Mutex<HashMap<String, u64>>,
    membership_changes: AtomicU64,
    members: AtomicUsize,
    tasks_added_from_membership: AtomicU64,
    tasks_removed_from_membership: AtomicU64,
    run_set_size: AtomicUsize,
    computed_weight: AtomicU64,
    unexpected_errors: AtomicU64,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            metrics: MetricsCollector::new(),
            tasks_added: AtomicU64::new(0),
            tasks_removed: AtomicU64::new(0),
            task_runs: AtomicU64::new(0),
            runs_per_task: Mutex::new(HashMap::new()),
            membership_changes: AtomicU64::new(0),
            members: AtomicUsize::new(0),
            tasks_added_from_membership: AtomicU64::new(0),
            tasks_removed_from_membership: AtomicU64::new(0),
            run_set_size: AtomicUsize::new(0),
            computed_weight: AtomicU64::new(0),
            unexpected_errors: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let tasks_added = self.tasks_added.load(Ordering::SeqCst);
        let tasks_removed = self.tasks_removed.load(Ordering::SeqCst);
        StatsSnapshot {
            tasks_added,
            tasks_removed,
            active_tasks: tasks_added.saturating_sub(tasks_removed) as usize,
            task_runs: self.task_runs.load(Ordering::SeqCst),
            runs_per_task: self
                .runs_per_task
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            membership_changes: self.membership_changes.load(Ordering::SeqCst),
            members: self.members.load(Ordering::SeqCst),
            tasks_added_from_membership: self.tasks_added_from_membership.load(Ordering::SeqCst),
            tasks_removed_from_membership: self
                .tasks_removed_from_membership
                .load(Ordering::SeqCst),
            run_set_size: self.run_set_size.load(Ordering::SeqCst),
            computed_weight: self.computed_weight.load(Ordering::SeqCst),
            unexpected_errors: self.unexpected_errors.load(Ordering::SeqCst),
        }
    }

    fn active_tasks(&self) -> usize {
        self.tasks_added
            .load(Ordering::SeqCst)
            .saturating_sub(self.tasks_removed.load(Ordering::SeqCst)) as usize
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerEvents for StatsCollector {
    fn task_added(&self, _task_name: &str) {
        self.tasks_added.fetch_add(1, Ordering::SeqCst);
        self.metrics.record_task_added(self.active_tasks());
    }

    fn task_removed(&self, _task_name: &str) {
        self.tasks_removed.fetch_add(1, Ordering::SeqCst);
        self.metrics.record_task_removed(self.active_tasks());
    }

    fn task_done(&self, task_name: &str) {
        self.task_runs.fetch_add(1, Ordering::SeqCst);
        *self
            .runs_per_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(task_name.to_string())
            .or_insert(0) += 1;
        self.metrics.record_task_done(task_name);
    }

    fn membership_changed(&self, members: usize) {
        self.membership_changes.fetch_add(1, Ordering::SeqCst);
        self.members.store(members, Ordering::SeqCst);
        self.metrics.record_membership_changed(members);
    }

    fn tasks_added_from_membership(&self, count: usize) {
        self.tasks_added_from_membership
            .fetch_add(count as u64, Ordering::SeqCst);
        self.metrics.record_tasks_added_from_membership(count);
    }

    fn tasks_removed_from_membership(&self, count: usize) {
        self.tasks_removed_from_membership
            .fetch_add(count as u64, Ordering::SeqCst);
        self.metrics.record_tasks_removed_from_membership(count);
    }

    fn run_set_size(&self, size: usize) {
        self.run_set_size.store(size, Ordering::SeqCst);
        self.metrics.update_run_set_size(size);
    }

    fn computed_weight(&self, weight: u64) {
        self.computed_weight.store(weight, Ordering::SeqCst);
        self.metrics.update_computed_weight(weight);
    }

    fn unexpected_error(&self, _task_name: &str, kind: &str) {
        self.unexpected_errors.fetch_add(1, Ordering::SeqCst);
        self.metrics.record_unexpected_error(kind);
    }
}

/// Forwards every event to each registered sink.
#[derive(Clone, Default)]
pub struct EventFanout {
    sinks: Vec<Arc<dyn SchedulerEvents>>,
}

impl EventFanout {
    pub fn new(sinks: Vec<Arc<dyn SchedulerEvents>>) -> Self {
        Self { sinks }
    }

    fn each(&self, event: &str, f: impl Fn(&dyn SchedulerEvents)) {
        for sink in &self.sinks {
            if catch_unwind(AssertUnwindSafe(|| f(sink.as_ref()))).is_err() {
                error!(event = event, "Scheduler event sink panicked");
            }
        }
    }
}

impl SchedulerEvents for EventFanout {
    fn task_added(&self, task_name: &str) {
        self.each("task_added", |s| s.task_added(task_name));
    }

    fn task_removed(&self, task_name: &str) {
        self.each("task_removed", |s| s.task_removed(task_name));
    }

    fn task_done(&self, task_name: &str) {
        self.each("task_done", |s| s.task_done(task_name));
    }

    fn membership_changed(&self, members: usize) {
        self.each("membership_changed", |s| s.membership_changed(members));
    }

    fn tasks_added_from_membership(&self, count: usize) {
        self.each("tasks_added_from_membership", |s| {
            s.tasks_added_from_membership(count)
        });
    }

    fn tasks_removed_from_membership(&self, count: usize) {
        self.each("tasks_removed_from_membership", |s| {
            s.tasks_removed_from_membership(count)
        });
    }

    fn run_set_size(&self, size: usize) {
        self.each("run_set_size", |s| s.run_set_size(size));
    }

    fn computed_weight(&self, weight: u64) {
        self.each("computed_weight", |s| s.computed_weight(weight));
    }

    fn unexpected_error(&self, task_name: &str, kind: &str) {
        self.each("unexpected_error", |s| s.unexpected_error(task_name, kind));
    }
}
