//! Done and steal markers
//!
//! Done markers are persistent and scoped by service version; a one-shot
//! task whose marker exists never runs again on that version. Steal markers
//! are ephemeral entries under the steal set created by an overloaded owner
//! just before it gives a task up.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use singleton_core::{CreateMode, DoneRecord, SchedulerResult, StoreError};

use crate::context::SchedulerContext;

pub struct DoneCoordinator {
    ctx: Arc<SchedulerContext>,
}

impl DoneCoordinator {
    pub fn new(ctx: Arc<SchedulerContext>) -> Self {
        Self { ctx }
    }

    /// Creates the done and steal-set paths for this version.
    pub async fn start(&self) -> SchedulerResult<()> {
        for path in self.ctx.paths.base_paths() {
            self.ctx.store.ensure_path(&path).await?;
        }
        info!(
            service_version = %self.ctx.paths.service_version(),
            "Done coordinator started"
        );
        Ok(())
    }

    /// Records a completed run, overwriting the previous marker.
    pub async fn publish_done(&self, task_name: &str, completed_runs: u64) -> SchedulerResult<()> {
        let record = DoneRecord {
            endpoint: self.ctx.endpoint.clone(),
            service_version: self.ctx.paths.service_version().to_string(),
            completed_runs,
            completed_at: Utc::now(),
        }
        .to_bytes()?;
        let path = self.ctx.paths.done_marker_path(task_name);

        match self.ctx.store.set_data(&path, &record).await {
            Ok(()) => Ok(()),
            Err(StoreError::NoNode(_)) => {
                match self
                    .ctx
                    .store
                    .create(&path, &record, CreateMode::Persistent)
                    .await
                {
                    // Raced with another writer; its marker is equally valid.
                    Ok(()) | Err(StoreError::PathExists(_)) => Ok(()),
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn is_done(&self, task_name: &str) -> SchedulerResult<bool> {
        Ok(self
            .ctx
            .store
            .exists(&self.ctx.paths.done_marker_path(task_name))
            .await?)
    }

    /// Offers `task_name` to lighter nodes. `offered_weight` is the owner's
    /// weight at the time of the offer.
    pub async fn mark_stealable(&self, task_name: &str, offered_weight: u64) -> SchedulerResult<()> {
        let path = self.ctx.paths.steal_marker_path(task_name);
        match self
            .ctx
            .store
            .create(&path, offered_weight.to_string().as_bytes(), CreateMode::Ephemeral)
            .await
        {
            Ok(()) | Err(StoreError::PathExists(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Weight offered with the steal marker, `None` if the task is not stealable.
    pub async fn steal_offer(&self, task_name: &str) -> SchedulerResult<Option<u64>> {
        let data = self
            .ctx
            .store
            .get_data(&self.ctx.paths.steal_marker_path(task_name))
            .await?;
        Ok(data.map(|bytes| {
            std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(u64::MAX)
        }))
    }

    pub async fn clear_steal(&self, task_name: &str) -> SchedulerResult<()> {
        self.ctx
            .store
            .delete_if_exists(&self.ctx.paths.steal_marker_path(task_name))
            .await?;
        debug!(task.name = task_name, "Steal marker cleared");
        Ok(())
    }
}
