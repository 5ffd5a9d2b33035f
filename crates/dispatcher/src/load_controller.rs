//! Membership and weight publishing
//!
//! Every node keeps an ephemeral record under the weight path; the set of
//! those records is the cluster membership. With balancing enabled the
//! record carries the node's current weight: the sum of the weights of all
//! tasks it owns.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use singleton_core::{paths::WEIGHT_PATH, CreateMode, SchedulerResult, StoreError};

use crate::context::SchedulerContext;
use crate::registry::TaskRegistry;

/// One entry of the weight path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeWeight {
    pub node_id: String,
    pub weight: u64,
}

pub struct LoadController {
    ctx: Arc<SchedulerContext>,
    registry: Arc<TaskRegistry>,
}

impl LoadController {
    pub fn new(ctx: Arc<SchedulerContext>, registry: Arc<TaskRegistry>) -> Self {
        Self { ctx, registry }
    }

    fn record_path(&self) -> String {
        self.ctx.paths.weight_record_path(&self.ctx.node_id)
    }

    /// Sum of the weights of owned tasks.
    pub fn compute_weight(&self) -> u64 {
        self.registry
            .active()
            .iter()
            .filter(|tracker| tracker.is_owner())
            .map(|tracker| u64::from(tracker.weight()))
            .sum()
    }

    /// Creates this node's membership record, replacing a stale one.
    pub async fn register_membership(&self) -> SchedulerResult<()> {
        let path = self.record_path();
        let weight = self.compute_weight();
        let data = weight.to_string();

        match self
            .ctx
            .store
            .create(&path, data.as_bytes(), CreateMode::Ephemeral)
            .await
        {
            Ok(()) => {}
            Err(StoreError::PathExists(_)) => {
                if !self.membership_record_is_ours().await? {
                    // Left by our previous session and not yet expired.
                    self.ctx.store.delete_if_exists(&path).await?;
                    self.ctx
                        .store
                        .create(&path, data.as_bytes(), CreateMode::Ephemeral)
                        .await?;
                }
            }
            Err(err) => return Err(err.into()),
        }
        self.ctx.set_last_computed_weight(weight);
        info!(node.id = %self.ctx.node_id, weight, "Registered cluster membership");
        Ok(())
    }

    pub async fn membership_record_is_ours(&self) -> SchedulerResult<bool> {
        Ok(self.ctx.store.ephemeral_owner(&self.record_path()).await?
            == Some(self.ctx.store.session_id()))
    }

    /// Writes the current weight to this node's record.
    pub async fn publish_weight(&self) -> SchedulerResult<u64> {
        let weight = self.compute_weight();
        match self
            .ctx
            .store
            .set_data(&self.record_path(), weight.to_string().as_bytes())
            .await
        {
            Ok(()) => {}
            Err(StoreError::NoNode(_)) => self.register_membership().await?,
            Err(err) => return Err(err.into()),
        }
        self.ctx.set_last_computed_weight(weight);
        debug!(node.id = %self.ctx.node_id, weight, "Published node weight");
        Ok(weight)
    }

    /// Weights of every member. Unreadable records count as zero.
    pub async fn cluster_weights(&self) -> SchedulerResult<Vec<NodeWeight>> {
        let mut weights = Vec::new();
        for node_id in self.ctx.store.get_children(WEIGHT_PATH).await? {
            let path = self.ctx.paths.weight_record_path(&node_id);
            let weight = match self.ctx.store.get_data(&path).await? {
                Some(bytes) => std::str::from_utf8(&bytes)
                    .ok()
                    .and_then(|s| s.trim().parse().ok())
                    .unwrap_or(0),
                // Vanished between listing and reading.
                None => continue,
            };
            weights.push(NodeWeight { node_id, weight });
        }
        Ok(weights)
    }

    pub async fn deregister(&self) {
        if let Err(err) = self.ctx.store.delete_if_exists(&self.record_path()).await {
            debug!(error = %err, "Membership record left for session expiry");
        }
    }

    /// Publishes the weight every balance period. Returns `None` when
    /// balancing is disabled.
    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Option<JoinHandle<()>> {
        let period = self.ctx.config.weight_balance_period()?;
        let controller = Arc::clone(self);
        let mut shutdown = shutdown.subscribe();
        Some(self.ctx.runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(err) = controller.publish_weight().await {
                            warn!(error = %err, "Could not publish node weight");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::test_context_on;
    use singleton_core::SchedulerConfig;
    use singleton_infrastructure::InMemoryCoordinationStore;

    #[tokio::test]
    async fn test_register_and_publish() {
        let cluster = InMemoryCoordinationStore::default();
        let (ctx, _session, stats) =
            test_context_on(&cluster, SchedulerConfig::default(), 1).await;
        let load = LoadController::new(ctx, Arc::new(TaskRegistry::new()));

        load.register_membership().await.unwrap();
        load.register_membership().await.unwrap();
        assert!(load.membership_record_is_ours().await.unwrap());
        assert_eq!(load.publish_weight().await.unwrap(), 0);
        assert_eq!(
            cluster.node_data("/clustered_singleton/weight/127.0.0.1:1"),
            Some(b"0".to_vec())
        );
        assert_eq!(stats.snapshot().computed_weight, 0);

        load.deregister().await;
        assert!(!cluster.node_exists("/clustered_singleton/weight/127.0.0.1:1"));
        // Publishing after the record vanished re-creates it.
        load.publish_weight().await.unwrap();
        assert!(cluster.node_exists("/clustered_singleton/weight/127.0.0.1:1"));
    }

    #[tokio::test]
    async fn test_cluster_weights_lists_members() {
        let cluster = InMemoryCoordinationStore::default();
        let (ctx_a, _a, _) = test_context_on(&cluster, SchedulerConfig::default(), 1).await;
        let (ctx_b, _b, _) = test_context_on(&cluster, SchedulerConfig::default(), 2).await;
        let load_a = LoadController::new(ctx_a, Arc::new(TaskRegistry::new()));
        let load_b = LoadController::new(ctx_b.clone(), Arc::new(TaskRegistry::new()));
        load_a.register_membership().await.unwrap();
        load_b.register_membership().await.unwrap();
        ctx_b
            .store
            .set_data("/clustered_singleton/weight/127.0.0.1:2", b"5")
            .await
            .unwrap();

        let mut weights = load_a.cluster_weights().await.unwrap();
        weights.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        assert_eq!(
            weights,
            vec![
                NodeWeight {
                    node_id: "127.0.0.1:1".to_string(),
                    weight: 0
                },
                NodeWeight {
                    node_id: "127.0.0.1:2".to_string(),
                    weight: 5
                },
            ]
        );
    }
}
