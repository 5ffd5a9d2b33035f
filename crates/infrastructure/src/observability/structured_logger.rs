//! Structured logging utilities
//!
//! One function per scheduler lifecycle event so that field names stay
//! consistent across components.

use tracing::{debug, error, info, warn};

/// Structured logging utilities
pub struct StructuredLogger;

impl StructuredLogger {
    pub fn log_claim_acquired(task_name: &str, node_id: &str, session: &str) {
        info!(
            event = "claim_acquired",
            task.name = task_name,
            node.id = node_id,
            session = session,
            "Claimed task ownership"
        );
    }

    pub fn log_claim_contended(task_name: &str, node_id: &str) {
        debug!(
            event = "claim_contended",
            task.name = task_name,
            node.id = node_id,
            "Task is owned elsewhere, watching"
        );
    }

    pub fn log_claim_released(task_name: &str, node_id: &str, reason: &str) {
        info!(
            event = "claim_released",
            task.name = task_name,
            node.id = node_id,
            reason = reason,
            "Released task ownership"
        );
    }

    pub fn log_run_started(task_name: &str, node_id: &str, run: u64) {
        debug!(
            event = "run_started",
            task.name = task_name,
            node.id = node_id,
            task.run = run,
            "Task run started"
        );
    }

    pub fn log_run_finished(
        task_name: &str,
        node_id: &str,
        success: bool,
        duration_ms: u64,
        error_message: Option<&str>,
    ) {
        if success {
            info!(
                event = "run_finished",
                task.name = task_name,
                node.id = node_id,
                task.duration_ms = duration_ms,
                "Task run completed"
            );
        } else {
            error!(
                event = "run_failed",
                task.name = task_name,
                node.id = node_id,
                task.duration_ms = duration_ms,
                task.error = error_message.unwrap_or("Unknown error"),
                "Task run failed"
            );
        }
    }

    pub fn log_session_suspect(node_id: &str, trackers: usize) {
        warn!(
            event = "session_suspect",
            node.id = node_id,
            trackers = trackers,
            "Store connection lost, holding new runs until the session is verified"
        );
    }

    pub fn log_session_verified(task_name: &str, survived: bool) {
        if survived {
            info!(
                event = "session_verified",
                task.name = task_name,
                "Booking survived reconnect"
            );
        } else {
            warn!(
                event = "session_expired",
                task.name = task_name,
                "Booking lost with expired session, re-claiming"
            );
        }
    }

    pub fn log_cancellation_requested(task_name: &str, may_interrupt: bool) {
        info!(
            event = "cancellation_requested",
            task.name = task_name,
            may_interrupt = may_interrupt,
            "Task cancellation requested"
        );
    }

    pub fn log_cancellation_drained(task_name: &str, attempts: u32) {
        info!(
            event = "cancellation_drained",
            task.name = task_name,
            attempts = attempts,
            "Task cancellation completed, booking released"
        );
    }

    pub fn log_marked_stealable(task_name: &str, node_weight: u64, min_weight: u64) {
        info!(
            event = "marked_stealable",
            task.name = task_name,
            node.weight = node_weight,
            cluster.min_weight = min_weight,
            "Offering task to a lighter node"
        );
    }

    pub fn log_task_stolen(task_name: &str, node_id: &str) {
        info!(
            event = "task_stolen",
            task.name = task_name,
            node.id = node_id,
            "Took over stealable task"
        );
    }

    pub fn log_system_error(component: &str, operation: &str, error: &dyn std::error::Error) {
        error!(
            event = "system_error",
            component = component,
            operation = operation,
            error = %error,
            "System error occurred"
        );
    }
}
