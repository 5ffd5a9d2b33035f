use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use singleton_core::SchedulerResult;
use singleton_infrastructure::StructuredLogger;

use crate::context::SchedulerContext;
use crate::load_controller::LoadController;
use crate::registry::TaskRegistry;

/// 权重均衡器：负载过高时把一个任务让给更轻的节点
pub struct WeightBalancer {
    ctx: Arc<SchedulerContext>,
    registry: Arc<TaskRegistry>,
    load: Arc<LoadController>,
}

impl WeightBalancer {
    pub fn new(
        ctx: Arc<SchedulerContext>,
        registry: Arc<TaskRegistry>,
        load: Arc<LoadController>,
    ) -> Self {
        Self {
            ctx,
            registry,
            load,
        }
    }

    /// One balancing pass. Offers at most one task and returns its name.
    ///
    /// A task qualifies when moving it leaves this node no lighter than the
    /// lightest member becomes, so two nodes never trade it back and forth.
    pub async fn rebalance(&self) -> SchedulerResult<Option<String>> {
        let ours = self.load.publish_weight().await?;
        let weights = self.load.cluster_weights().await?;
        if weights.len() < 2 {
            return Ok(None);
        }

        let min = weights
            .iter()
            .filter(|w| w.node_id != self.ctx.node_id)
            .map(|w| w.weight)
            .min()
            .unwrap_or(ours);
        let tolerance = u64::from(self.ctx.config.weight_tolerance);
        if ours <= min.saturating_add(tolerance) {
            return Ok(None);
        }

        let gap = ours - min;
        let candidate = self
            .registry
            .active()
            .into_iter()
            .filter(|tracker| {
                tracker.is_owner()
                    && !tracker.schedule().is_in_lock_step()
                    && tracker.booking().holder_count() == 1
            })
            .filter(|tracker| 2 * u64::from(tracker.weight()) <= gap)
            .max_by_key(|tracker| tracker.weight());

        let Some(tracker) = candidate else {
            debug!(weight = ours, min_weight = min, "Overloaded but no task fits the gap");
            return Ok(None);
        };
        if !tracker.request_steal(ours) {
            return Ok(None);
        }
        StructuredLogger::log_marked_stealable(tracker.booking_name(), ours, min);
        Ok(Some(tracker.name().to_string()))
    }

    /// Returns `None` when balancing is disabled.
    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Option<JoinHandle<()>> {
        let period = self.ctx.config.weight_balance_period()?;
        let balancer = Arc::clone(self);
        let mut shutdown = shutdown.subscribe();
        Some(self.ctx.runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; give claims a period to settle.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(err) = balancer.rebalance().await {
                            warn!(error = %err, "Weight balancing pass failed");
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

    fn balancer_on(ctx: Arc<SchedulerContext>) -> (WeightBalancer, Arc<LoadController>) {
        let registry = Arc::new(TaskRegistry::new());
        let load = Arc::new(LoadController::new(ctx.clone(), registry.clone()));
        (WeightBalancer::new(ctx, registry, load.clone()), load)
    }

    #[tokio::test]
    async fn test_single_member_never_offers() {
        let cluster = InMemoryCoordinationStore::default();
        let (ctx, _session, _) = test_context_on(&cluster, SchedulerConfig::default(), 1).await;
        let (balancer, load) = balancer_on(ctx);
        load.register_membership().await.unwrap();
        assert_eq!(balancer.rebalance().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lighter_node_keeps_its_tasks() {
        let cluster = InMemoryCoordinationStore::default();
        let (ctx_a, _a, _) = test_context_on(&cluster, SchedulerConfig::default(), 1).await;
        let (ctx_b, _b, _) = test_context_on(&cluster, SchedulerConfig::default(), 2).await;
        let (balancer, load_a) = balancer_on(ctx_a);
        let (_, load_b) = balancer_on(ctx_b.clone());
        load_a.register_membership().await.unwrap();
        load_b.register_membership().await.unwrap();
        ctx_b
            .store
            .set_data("/clustered_singleton/weight/127.0.0.1:2", b"9")
            .await
            .unwrap();

        assert_eq!(balancer.rebalance().await.unwrap(), None);
        // Our own record was refreshed on the way.
        assert_eq!(
            cluster.node_data("/clustered_singleton/weight/127.0.0.1:1"),
            Some(b"0".to_vec())
        );
    }

    #[tokio::test]
    async fn test_disabled_balancing_spawns_nothing() {
        let (ctx, _session, _) =
            crate::context::test_support::test_context(SchedulerConfig::default()).await;
        let (balancer, _) = balancer_on(ctx);
        let (shutdown, _) = broadcast::channel(1);
        assert!(Arc::new(balancer).start(&shutdown).is_none());
    }
}
