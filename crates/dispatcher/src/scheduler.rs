//! Public scheduler facade
//!
//! One `SingletonScheduler` runs per node. Every node that schedules the
//! same task name against the same store competes for it; at most one of
//! them runs it at any instant.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use singleton_core::{
    lock_step_copy_name, CoordinationStore, NodeEndpoint, Schedule, SchedulerConfig,
    SchedulerError, SchedulerResult, StorePaths, TaskGroup, LOCK_STEP_SEPARATOR,
};

use crate::cancellation::{CancellationRegistry, TaskHandle};
use crate::context::{exit_process_halt_handler, HaltHandler, SchedulerContext};
use crate::done_coordinator::DoneCoordinator;
use crate::load_controller::LoadController;
use crate::recovery_monitor::RecoveryMonitor;
use crate::registry::TaskRegistry;
use crate::stats_collector::{EventFanout, SchedulerEvents, StatsCollector, StatsSnapshot};
use crate::task::SingletonTask;
use crate::task_pool::{BoundedTaskPool, TaskPool};
use crate::tracker::TaskTracker;
use crate::weight_balancer::WeightBalancer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Started,
    Closed,
}

pub struct SchedulerBuilder {
    store: Arc<dyn CoordinationStore>,
    endpoint: NodeEndpoint,
    config: SchedulerConfig,
    sinks: Vec<Arc<dyn SchedulerEvents>>,
    halt: Option<HaltHandler>,
}

impl SchedulerBuilder {
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Additional receiver of scheduler events.
    pub fn event_sink(mut self, sink: Arc<dyn SchedulerEvents>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Replaces process exit on a confirmed store loss.
    pub fn halt_handler(mut self, halt: HaltHandler) -> Self {
        self.halt = Some(halt);
        self
    }

    /// Must be called inside a tokio runtime.
    pub fn build(self) -> SchedulerResult<SingletonScheduler> {
        let runtime = Handle::try_current().map_err(|_| {
            SchedulerError::illegal_state("scheduler must be built inside a tokio runtime")
        })?;
        self.config
            .validate()
            .map_err(|err| SchedulerError::Configuration(err.to_string()))?;

        let stats = Arc::new(StatsCollector::new());
        let mut sinks: Vec<Arc<dyn SchedulerEvents>> = vec![stats.clone()];
        sinks.extend(self.sinks);

        let ctx = Arc::new(SchedulerContext::new(
            self.store,
            self.config,
            self.endpoint,
            EventFanout::new(sinks),
            self.halt.unwrap_or_else(exit_process_halt_handler),
            runtime.clone(),
        ));

        let registry = Arc::new(TaskRegistry::new());
        let load = Arc::new(LoadController::new(ctx.clone(), registry.clone()));
        let default_group = TaskGroup::new(
            ctx.config.default_group_name.clone(),
            ctx.config.default_group_capacity,
        );
        let mut pools = HashMap::new();
        pools.insert(
            default_group.name.clone(),
            Arc::new(BoundedTaskPool::new(&default_group, runtime)?),
        );
        let (shutdown, _) = broadcast::channel(1);

        Ok(SingletonScheduler {
            done: Arc::new(DoneCoordinator::new(ctx.clone())),
            recovery: Arc::new(RecoveryMonitor::new(
                ctx.clone(),
                registry.clone(),
                load.clone(),
            )),
            balancer: Arc::new(WeightBalancer::new(
                ctx.clone(),
                registry.clone(),
                load.clone(),
            )),
            cancellations: Arc::new(CancellationRegistry::new()),
            pools: RwLock::new(pools),
            lock_step_counter: AtomicU64::new(0),
            lifecycle: Mutex::new(Lifecycle::Created),
            background: Mutex::new(Vec::new()),
            schedule_lock: tokio::sync::Mutex::new(()),
            shutdown,
            stats,
            load,
            registry,
            ctx,
        })
    }
}

/// 集群单例任务调度器
pub struct SingletonScheduler {
    ctx: Arc<SchedulerContext>,
    registry: Arc<TaskRegistry>,
    cancellations: Arc<CancellationRegistry>,
    done: Arc<DoneCoordinator>,
    load: Arc<LoadController>,
    recovery: Arc<RecoveryMonitor>,
    balancer: Arc<WeightBalancer>,
    stats: Arc<StatsCollector>,
    pools: RwLock<HashMap<String, Arc<BoundedTaskPool>>>,
    lock_step_counter: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
    background: Mutex<Vec<JoinHandle<()>>>,
    // Serialises the lookup-then-insert part of schedule().
    schedule_lock: tokio::sync::Mutex<()>,
    shutdown: broadcast::Sender<()>,
}

impl SingletonScheduler {
    pub fn builder(store: Arc<dyn CoordinationStore>, endpoint: NodeEndpoint) -> SchedulerBuilder {
        SchedulerBuilder {
            store,
            endpoint,
            config: SchedulerConfig::default(),
            sinks: Vec::new(),
            halt: None,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.ctx.node_id
    }

    pub fn endpoint(&self) -> &NodeEndpoint {
        &self.ctx.endpoint
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.ctx.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Execution names currently tracked on this node.
    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .registry
            .all()
            .iter()
            .map(|tracker| tracker.name().to_string())
            .collect();
        names.sort();
        names
    }

    pub fn pending_cancellations(&self) -> usize {
        self.cancellations.len()
    }

    /// Creates the base paths, registers this node and starts the
    /// background components.
    pub async fn start(&self) -> SchedulerResult<()> {
        match self.lifecycle() {
            Lifecycle::Created => {}
            Lifecycle::Started => {
                return Err(SchedulerError::illegal_state("scheduler already started"))
            }
            Lifecycle::Closed => return Err(SchedulerError::illegal_state("scheduler is closed")),
        }

        self.done.start().await?;
        self.load.register_membership().await?;
        let mut handles = self.recovery.start(&self.shutdown);
        handles.extend(self.load.start(&self.shutdown));
        handles.extend(self.balancer.start(&self.shutdown));

        *self.lock_background() = handles;
        *self.lock_lifecycle() = Lifecycle::Started;
        info!(
            node.id = %self.ctx.node_id,
            service_version = %self.ctx.paths.service_version(),
            balancing = self.ctx.config.weight_balance_period().is_some(),
            "Singleton scheduler started"
        );
        Ok(())
    }

    /// Schedules `task` under `schedule`.
    ///
    /// Re-scheduling a tracked name updates its schedule, unless either side
    /// is lock-step; then an additional tracker sharing the same booking is
    /// created. A name whose cancellation is still draining blocks for up to
    /// `max_wait_time_post_cancel` and then fails with
    /// [`SchedulerError::CancellationPending`].
    pub async fn schedule(
        &self,
        schedule: Schedule,
        task: Arc<dyn SingletonTask>,
    ) -> SchedulerResult<TaskHandle> {
        self.ensure_started()?;
        schedule.validate()?;
        let name = schedule.task_name().to_string();
        if StorePaths::is_reserved(&name) {
            return Err(SchedulerError::invalid_argument(format!(
                "task name {name} is reserved"
            )));
        }
        let group_name = schedule
            .resolved_group(&self.ctx.config.default_group_name)
            .to_string();
        let pool = self
            .pool(&group_name)
            .ok_or_else(|| SchedulerError::UnknownTaskGroup(group_name.clone()))?;

        let max_wait = self.ctx.config.max_wait_time_post_cancel();
        let deadline = Instant::now() + max_wait;
        loop {
            self.cancellations
                .wait_for(&name, deadline.saturating_duration_since(Instant::now()))
                .await?;

            let _guard = self.schedule_lock.lock().await;
            let Some(existing) = self.registry.get(&name) else {
                return self.create_tracker(name, schedule, task, pool).await;
            };

            if existing.is_retired() {
                if self.registry.remove_if_same(&name, &existing) {
                    self.ctx.events.task_removed(&name);
                }
                return self.create_tracker(name, schedule, task, pool).await;
            }

            if existing.is_cancelled() {
                // Cancelled but not yet handed to the cancelled set.
                drop(_guard);
                if Instant::now() >= deadline {
                    return Err(SchedulerError::CancellationPending {
                        task: name,
                        waited_ms: max_wait.as_millis() as u64,
                    });
                }
                tokio::time::sleep(self.ctx.config.cancel_check_interval()).await;
                continue;
            }

            if schedule.is_in_lock_step() || existing.schedule().is_in_lock_step() {
                return self.create_lock_step_copy(&existing, schedule, task, pool);
            }

            if existing.task_group() != group_name {
                return Err(SchedulerError::invalid_argument(format!(
                    "task {name} already runs in group {}, not {group_name}",
                    existing.task_group()
                )));
            }
            debug!(task.name = %name, "Updating schedule of tracked task");
            existing.update_schedule(schedule);
            return Ok(self.handle(existing));
        }
    }

    async fn create_tracker(
        &self,
        name: String,
        schedule: Schedule,
        task: Arc<dyn SingletonTask>,
        pool: Arc<BoundedTaskPool>,
    ) -> SchedulerResult<TaskHandle> {
        let booking = self.registry.bookings().get_or_create(&self.ctx, &name);
        booking.ensure_booking_path(&self.ctx).await?;

        let tracker = TaskTracker::new(
            name,
            schedule,
            task,
            booking,
            pool,
            self.ctx.clone(),
            self.done.clone(),
            Arc::downgrade(&self.registry),
        );
        Ok(self.register(tracker))
    }

    fn create_lock_step_copy(
        &self,
        existing: &Arc<TaskTracker>,
        schedule: Schedule,
        task: Arc<dyn SingletonTask>,
        pool: Arc<BoundedTaskPool>,
    ) -> SchedulerResult<TaskHandle> {
        let name = loop {
            let n = self.lock_step_counter.fetch_add(1, Ordering::SeqCst) + 1;
            let candidate = lock_step_copy_name(existing.name(), n);
            if self.registry.get(&candidate).is_none() {
                break candidate;
            }
        };

        let tracker = TaskTracker::new(
            name.clone(),
            schedule.with_task_name(name),
            task,
            existing.booking().clone(),
            pool,
            self.ctx.clone(),
            self.done.clone(),
            Arc::downgrade(&self.registry),
        );
        Ok(self.register(tracker))
    }

    fn register(&self, tracker: Arc<TaskTracker>) -> TaskHandle {
        self.registry.insert(tracker.clone());
        self.ctx.events.task_added(tracker.name());
        info!(
            task.name = %tracker.name(),
            booking = %tracker.booking_name(),
            task_group = %tracker.task_group(),
            "Task scheduled"
        );
        tracker.start();
        self.handle(tracker)
    }

    fn handle(&self, tracker: Arc<TaskTracker>) -> TaskHandle {
        TaskHandle::new(
            tracker,
            self.ctx.clone(),
            Arc::downgrade(&self.registry),
            self.cancellations.clone(),
        )
    }

    /// Endpoint of the node currently holding the claim for `task_name`.
    /// `None` when nobody holds it, the name is unknown, or the store cannot
    /// be read.
    pub async fn get_current_task_owner(&self, task_name: &str) -> Option<NodeEndpoint> {
        if task_name.is_empty() || task_name.contains('/') {
            return None;
        }
        let booking = match self.registry.get(task_name) {
            Some(tracker) => tracker.booking().clone(),
            // An unknown copy name has no booking of its own.
            None if task_name.contains(LOCK_STEP_SEPARATOR) => return None,
            None => self.registry.bookings().get_or_create(&self.ctx, task_name),
        };
        match booking.current_owner(&self.ctx).await {
            Ok(owner) => owner,
            Err(err) => {
                debug!(task.name = task_name, error = %err, "Owner lookup failed");
                None
            }
        }
    }

    /// Whether nodes of an older version still elect an owner for `task_name`.
    pub async fn is_rolling_upgrade_in_progress(&self, task_name: &str) -> bool {
        self.ctx.is_rolling_upgrade_in_progress(task_name).await
    }

    /// Creates a fixed-capacity group. Group names are permanent.
    pub fn add_task_group(&self, group: TaskGroup) -> SchedulerResult<()> {
        if self.lifecycle() == Lifecycle::Closed {
            return Err(SchedulerError::illegal_state("scheduler is closed"));
        }
        group.validate()?;
        let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
        if pools.contains_key(&group.name) {
            return Err(SchedulerError::TaskGroupExists(group.name));
        }
        pools.insert(
            group.name.clone(),
            Arc::new(BoundedTaskPool::new(&group, self.ctx.runtime.clone())?),
        );
        info!(task_group = %group.name, capacity = group.capacity, "Task group added");
        Ok(())
    }

    /// Resizes an existing group in place.
    pub fn modify_task_group(&self, name: &str, capacity: usize) -> SchedulerResult<()> {
        let pool = self
            .pool(name)
            .ok_or_else(|| SchedulerError::UnknownTaskGroup(name.to_string()))?;
        pool.resize(capacity)
    }

    pub fn task_group_capacity(&self, name: &str) -> Option<usize> {
        self.pool(name).map(|pool| pool.capacity())
    }

    /// Stops every component and releases held claims. Idempotent.
    pub async fn close(&self) -> SchedulerResult<()> {
        let previous = {
            let mut lifecycle = self.lock_lifecycle();
            std::mem::replace(&mut *lifecycle, Lifecycle::Closed)
        };
        if previous == Lifecycle::Closed {
            return Ok(());
        }

        let _ = self.shutdown.send(());
        let handles = std::mem::take(&mut *self.lock_background());
        for handle in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(1), handle).await.is_err() {
                abort.abort();
            }
        }

        let trackers = self.registry.all();
        join_all(trackers.iter().map(|tracker| tracker.shutdown())).await;
        for tracker in &trackers {
            if self.registry.remove_if_same(tracker.name(), tracker) {
                self.ctx.events.task_removed(tracker.name());
            }
        }

        for pool in self.pools.read().unwrap_or_else(|e| e.into_inner()).values() {
            pool.close();
        }
        if previous == Lifecycle::Started {
            self.load.deregister().await;
        }
        info!(node.id = %self.ctx.node_id, "Singleton scheduler closed");
        Ok(())
    }

    fn pool(&self, name: &str) -> Option<Arc<BoundedTaskPool>> {
        self.pools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    fn ensure_started(&self) -> SchedulerResult<()> {
        match self.lifecycle() {
            Lifecycle::Started => Ok(()),
            Lifecycle::Created => Err(SchedulerError::illegal_state("scheduler not started")),
            Lifecycle::Closed => Err(SchedulerError::illegal_state("scheduler is closed")),
        }
    }

    fn lifecycle(&self) -> Lifecycle {
        *self.lock_lifecycle()
    }

    fn lock_lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_background(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.background.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for SingletonScheduler {
    fn drop(&mut self) {
        if self.lifecycle() == Lifecycle::Started {
            warn!(node.id = %self.ctx.node_id, "Scheduler dropped without close()");
            let _ = self.shutdown.send(());
        }
    }
}
