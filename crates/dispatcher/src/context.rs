use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tracing::{error, warn};

use singleton_core::{CoordinationStore, NodeEndpoint, SchedulerConfig, StorePaths};

use crate::stats_collector::{EventFanout, SchedulerEvents};

/// Invoked on a confirmed session expiry when `halt_on_store_lost` is set.
pub type HaltHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Terminates the process.
pub fn exit_process_halt_handler() -> HaltHandler {
    Arc::new(|reason: &str| {
        error!(reason = reason, "Coordination store lost, halting process");
        std::process::exit(1);
    })
}

/// State shared by every component of one scheduler instance.
pub struct SchedulerContext {
    pub store: Arc<dyn CoordinationStore>,
    pub config: SchedulerConfig,
    pub paths: StorePaths,
    pub endpoint: NodeEndpoint,
    pub node_id: String,
    pub events: EventFanout,
    pub runtime: Handle,
    halt: HaltHandler,
    last_computed_weight: AtomicU64,
    // Names for which no legacy election was seen; that answer never changes.
    upgrade_finished: Mutex<HashSet<String>>,
}

impl SchedulerContext {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        config: SchedulerConfig,
        endpoint: NodeEndpoint,
        events: EventFanout,
        halt: HaltHandler,
        runtime: Handle,
    ) -> Self {
        Self {
            paths: StorePaths::new(config.service_version.clone()),
            node_id: endpoint.id(),
            store,
            config,
            endpoint,
            events,
            runtime,
            halt,
            last_computed_weight: AtomicU64::new(0),
            upgrade_finished: Mutex::new(HashSet::new()),
        }
    }

    pub fn halt(&self, reason: &str) {
        (self.halt)(reason);
    }

    pub fn last_computed_weight(&self) -> u64 {
        self.last_computed_weight.load(Ordering::SeqCst)
    }

    pub fn set_last_computed_weight(&self, weight: u64) {
        self.last_computed_weight.store(weight, Ordering::SeqCst);
        self.events.computed_weight(weight);
    }

    /// Whether older nodes still elect an owner for `task_name`.
    ///
    /// A negative answer is cached for the lifetime of the scheduler. A store
    /// failure is reported as in progress so that no claim is attempted.
    pub async fn is_rolling_upgrade_in_progress(&self, task_name: &str) -> bool {
        if self.upgrade_finished_for(task_name) {
            return false;
        }
        match self.store.election_path_exists(task_name).await {
            Ok(true) => true,
            Ok(false) => {
                self.upgrade_finished
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(task_name.to_string());
                false
            }
            Err(err) => {
                warn!(task.name = task_name, error = %err, "Could not check for legacy election");
                true
            }
        }
    }

    fn upgrade_finished_for(&self, task_name: &str) -> bool {
        self.upgrade_finished
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(task_name)
    }
}
