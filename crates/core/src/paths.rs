//! Path layout under the coordination store.
//!
//! These names are shared with every node that schedules against the same
//! store, including nodes of other versions during a rolling upgrade, so they
//! must not change.

pub const ROOT_PATH: &str = "/clustered_singleton";
pub const DONE_PATH: &str = "/clustered_singleton/done";
pub const STEAL_SET_PATH: &str = "/clustered_singleton/steal-set";
pub const WEIGHT_PATH: &str = "/clustered_singleton/weight";

/// Name of the ephemeral claim entry below a booking path.
pub const BOOKING_NODE: &str = "booking";

/// Reserved names directly under the root; tasks may not use them.
pub const RESERVED_NAMES: [&str; 3] = ["done", "steal-set", "weight"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    service_version: String,
}

impl StorePaths {
    pub fn new(service_version: impl Into<String>) -> Self {
        Self {
            service_version: service_version.into(),
        }
    }

    pub fn service_version(&self) -> &str {
        &self.service_version
    }

    /// Base paths created by `start()`, parents first.
    pub fn base_paths(&self) -> Vec<String> {
        vec![
            ROOT_PATH.to_string(),
            DONE_PATH.to_string(),
            STEAL_SET_PATH.to_string(),
            WEIGHT_PATH.to_string(),
            self.version_done_path(),
        ]
    }

    pub fn version_done_path(&self) -> String {
        format!("{DONE_PATH}/{}", self.service_version)
    }

    /// Persistent per-task booking path.
    pub fn booking_path(&self, task_name: &str) -> String {
        format!("{ROOT_PATH}/{task_name}")
    }

    /// Ephemeral claim entry that marks the current owner.
    pub fn claim_path(&self, task_name: &str) -> String {
        format!("{ROOT_PATH}/{task_name}/{BOOKING_NODE}")
    }

    pub fn done_marker_path(&self, task_name: &str) -> String {
        format!("{}/{task_name}", self.version_done_path())
    }

    pub fn steal_marker_path(&self, task_name: &str) -> String {
        format!("{STEAL_SET_PATH}/{task_name}")
    }

    pub fn weight_record_path(&self, node_id: &str) -> String {
        format!("{WEIGHT_PATH}/{node_id}")
    }

    pub fn is_reserved(task_name: &str) -> bool {
        RESERVED_NAMES.contains(&task_name)
    }
}
