//! Metrics collector for the clustered singleton scheduler
//!
//! Handles are resolved once at construction against whatever recorder is
//! installed at that time. Without a recorder every call is a no-op.

use metrics::{counter, gauge, Counter, Gauge};
use tracing::debug;

pub struct MetricsCollector {
    // Task lifecycle metrics
    tasks_added_total: Counter,
    tasks_removed_total: Counter,
    task_runs_total: Counter,
    unexpected_errors_total: Counter,
    active_tasks: Gauge,

    // Cluster metrics
    membership_changes_total: Counter,
    membership_size: Gauge,
    tasks_added_from_membership_total: Counter,
    tasks_removed_from_membership_total: Counter,

    // Load metrics
    run_set_size: Gauge,
    computed_weight: Gauge,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            tasks_added_total: counter!("singleton_tasks_added_total"),
            tasks_removed_total: counter!("singleton_tasks_removed_total"),
            task_runs_total: counter!("singleton_task_runs_total"),
            unexpected_errors_total: counter!("singleton_unexpected_errors_total"),
            active_tasks: gauge!("singleton_active_tasks"),
            membership_changes_total: counter!("singleton_membership_changes_total"),
            membership_size: gauge!("singleton_membership_size"),
            tasks_added_from_membership_total: counter!(
                "singleton_tasks_added_from_membership_total"
            ),
            tasks_removed_from_membership_total: counter!(
                "singleton_tasks_removed_from_membership_total"
            ),
            run_set_size: gauge!("singleton_run_set_size"),
            computed_weight: gauge!("singleton_computed_weight"),
        }
    }

    pub fn record_task_added(&self, active_tasks: usize) {
        self.tasks_added_total.increment(1);
        self.active_tasks.set(active_tasks as f64);
    }

    pub fn record_task_removed(&self, active_tasks: usize) {
        self.tasks_removed_total.increment(1);
        self.active_tasks.set(active_tasks as f64);
    }

    pub fn record_task_done(&self, task_name: &str) {
        self.task_runs_total.increment(1);
        debug!(task.name = task_name, "Task run recorded");
    }

    pub fn record_unexpected_error(&self, kind: &str) {
        counter!("singleton_unexpected_errors_by_kind_total", "kind" => kind.to_string())
            .increment(1);
        self.unexpected_errors_total.increment(1);
    }

    pub fn record_membership_changed(&self, members: usize) {
        self.membership_changes_total.increment(1);
        self.membership_size.set(members as f64);
    }

    pub fn record_tasks_added_from_membership(&self, count: usize) {
        self.tasks_added_from_membership_total.increment(count as u64);
    }

    pub fn record_tasks_removed_from_membership(&self, count: usize) {
        self.tasks_removed_from_membership_total.increment(count as u64);
    }

    pub fn update_run_set_size(&self, size: usize) {
        self.run_set_size.set(size as f64);
    }

    pub fn update_computed_weight(&self, weight: u64) {
        self.computed_weight.set(weight as f64);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
