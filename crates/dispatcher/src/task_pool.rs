//! Fixed-capacity execution pools, one per task group.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use singleton_core::{SchedulerError, SchedulerResult, TaskGroup};

/// 任务执行池接口
pub trait TaskPool: Send + Sync {
    fn name(&self) -> &str;

    fn capacity(&self) -> usize;

    /// Queues `job`; it starts once a slot is free. The returned handle can
    /// abort the job whether it is still queued or already running.
    fn submit(&self, job: BoxFuture<'static, ()>) -> SchedulerResult<JoinHandle<()>>;

    /// Changes the number of slots. Running jobs are never interrupted; a
    /// shrink takes effect as they finish.
    fn resize(&self, capacity: usize) -> SchedulerResult<()>;

    /// Rejects new jobs and drops queued ones.
    fn close(&self);
}

/// Semaphore-backed pool running jobs on the tokio runtime.
pub struct BoundedTaskPool {
    name: String,
    capacity: Mutex<usize>,
    semaphore: Arc<Semaphore>,
    // Slots still to be retired by a shrink that found them busy.
    debt: Arc<AtomicUsize>,
    closed: AtomicBool,
    runtime: Handle,
}

impl BoundedTaskPool {
    pub fn new(group: &TaskGroup, runtime: Handle) -> SchedulerResult<Self> {
        group.validate()?;
        Ok(Self {
            name: group.name.clone(),
            capacity: Mutex::new(group.capacity),
            semaphore: Arc::new(Semaphore::new(group.capacity)),
            debt: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            runtime,
        })
    }

    /// Slots free right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl TaskPool for BoundedTaskPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> usize {
        *self.capacity.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn submit(&self, job: BoxFuture<'static, ()>) -> SchedulerResult<JoinHandle<()>> {
        if self.is_closed() {
            return Err(SchedulerError::illegal_state(format!(
                "task group {} is closed",
                self.name
            )));
        }

        let semaphore = Arc::clone(&self.semaphore);
        let debt = Arc::clone(&self.debt);
        let pool_name = self.name.clone();
        Ok(self.runtime.spawn(async move {
            let permit = match semaphore.acquire_owned().await {
                Ok(permit) => PoolPermit::new(permit, debt),
                Err(_) => {
                    debug!(task_group = %pool_name, "Pool closed before job started");
                    return;
                }
            };
            job.await;
            drop(permit);
        }))
    }

    fn resize(&self, capacity: usize) -> SchedulerResult<()> {
        if capacity == 0 {
            return Err(SchedulerError::invalid_argument(format!(
                "capacity of task group {} must be greater than 0",
                self.name
            )));
        }

        let mut current = self.capacity.lock().unwrap_or_else(|e| e.into_inner());
        if capacity > *current {
            let delta = capacity - *current;
            let previous_debt = self
                .debt
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| {
                    Some(d.saturating_sub(delta))
                })
                .unwrap_or(0);
            self.semaphore.add_permits(delta - previous_debt.min(delta));
        } else if capacity < *current {
            let delta = *current - capacity;
            let forgotten = self.semaphore.forget_permits(delta);
            self.debt.fetch_add(delta - forgotten, Ordering::SeqCst);
        }

        info!(
            task_group = %self.name,
            old_capacity = *current,
            new_capacity = capacity,
            "Task group resized"
        );
        *current = capacity;
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.semaphore.close();
            info!(task_group = %self.name, "Task group closed");
        }
    }
}

/// Returns its slot on drop unless a pending shrink claims it.
struct PoolPermit {
    permit: Option<OwnedSemaphorePermit>,
    debt: Arc<AtomicUsize>,
}

impl PoolPermit {
    fn new(permit: OwnedSemaphorePermit, debt: Arc<AtomicUsize>) -> Self {
        Self {
            permit: Some(permit),
            debt,
        }
    }
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            let owes = self
                .debt
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1))
                .is_ok();
            if owes {
                permit.forget();
            }
        }
    }
}
