//! 多节点演示集群
//!
//! Runs several schedulers against one in-memory store, all competing for
//! the same periodic task, so ownership and failover can be watched in the
//! logs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use singleton_core::{NodeEndpoint, Schedule, SchedulerConfig};
use singleton_dispatcher::{task_fn, SingletonScheduler};
use singleton_infrastructure::{InMemoryCoordinationStore, InMemorySession};

#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub nodes: usize,
    pub task_name: String,
    pub period: Duration,
    pub base_port: u16,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            nodes: 3,
            task_name: "report".to_string(),
            period: Duration::from_millis(500),
            base_port: 9100,
        }
    }
}

struct DemoNode {
    scheduler: SingletonScheduler,
    session: Arc<InMemorySession>,
    runs: Arc<AtomicU64>,
}

pub struct DemoCluster {
    store: InMemoryCoordinationStore,
    nodes: Vec<DemoNode>,
    options: DemoOptions,
}

impl DemoCluster {
    pub async fn start(options: DemoOptions, config: SchedulerConfig) -> Result<Self> {
        let store = InMemoryCoordinationStore::default();
        let mut nodes = Vec::with_capacity(options.nodes);

        for index in 0..options.nodes {
            let port = options.base_port + index as u16;
            let session = store.connect();
            let scheduler = SingletonScheduler::builder(
                session.clone(),
                NodeEndpoint::new("127.0.0.1", port),
            )
            .config(config.clone())
            .halt_handler(Arc::new(|reason: &str| {
                warn!(reason = reason, "演示节点失去协调存储会话");
            }))
            .build()
            .context("创建调度器失败")?;
            scheduler.start().await.context("启动调度器失败")?;

            let runs = Arc::new(AtomicU64::new(0));
            let task = {
                let runs = runs.clone();
                let node_id = scheduler.node_id().to_string();
                task_fn(move || {
                    let runs = runs.clone();
                    let node_id = node_id.clone();
                    async move {
                        let n = runs.fetch_add(1, Ordering::SeqCst) + 1;
                        info!(node.id = %node_id, run = n, "单例任务执行");
                        Ok(())
                    }
                })
            };
            scheduler
                .schedule(
                    Schedule::builder(options.task_name.as_str())
                        .every(options.period)
                        .build(),
                    task,
                )
                .await
                .context("调度演示任务失败")?;

            nodes.push(DemoNode {
                scheduler,
                session,
                runs,
            });
        }

        info!(nodes = nodes.len(), task = %options.task_name, "演示集群已启动");
        Ok(Self {
            store,
            nodes,
            options,
        })
    }

    pub fn store(&self) -> &InMemoryCoordinationStore {
        &self.store
    }

    pub async fn current_owner(&self) -> Option<NodeEndpoint> {
        for node in &self.nodes {
            if node.session.is_connected() {
                return node
                    .scheduler
                    .get_current_task_owner(&self.options.task_name)
                    .await;
            }
        }
        None
    }

    /// Crashes the node that currently owns the task.
    pub async fn kill_owner(&self) -> Option<NodeEndpoint> {
        let owner = self.current_owner().await?;
        let node = self
            .nodes
            .iter()
            .find(|node| *node.scheduler.endpoint() == owner)?;
        node.session.kill();
        warn!(node.id = %owner, "模拟节点崩溃");
        Some(owner)
    }

    /// Runs per node, in start order.
    pub fn runs_per_node(&self) -> Vec<(String, u64)> {
        self.nodes
            .iter()
            .map(|node| {
                (
                    node.scheduler.node_id().to_string(),
                    node.runs.load(Ordering::SeqCst),
                )
            })
            .collect()
    }

    pub async fn shutdown(self) {
        for node in &self.nodes {
            if let Err(e) = node.scheduler.close().await {
                warn!(node.id = %node.scheduler.node_id(), "关闭调度器失败: {e}");
            }
        }
        info!("演示集群已关闭");
    }
}
