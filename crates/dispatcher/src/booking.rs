//! Ownership claims
//!
//! A booking is the persistent path `/clustered_singleton/<task>`; whoever
//! holds the ephemeral `booking` entry below it owns the task. One
//! [`Booking`] object exists per booking path and node. Lock-step trackers
//! attach to the same object, and the claim is released only when the last
//! of them detaches.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use tracing::debug;

use singleton_core::{
    ClaimRecord, CreateMode, NodeEndpoint, SchedulerResult, SessionId, StoreError,
};
use singleton_infrastructure::StructuredLogger;

use crate::context::SchedulerContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This node now owns the booking.
    Acquired,
    /// This node already owned it.
    AlreadyOwned,
    /// Another session holds the claim.
    Contended,
}

impl ClaimOutcome {
    pub fn is_owner(self) -> bool {
        !matches!(self, ClaimOutcome::Contended)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClaimState {
    Unclaimed,
    Owned(SessionId),
}

pub struct Booking {
    task_name: String,
    booking_path: String,
    claim_path: String,
    state: Mutex<ClaimState>,
    holders: Mutex<HashSet<String>>,
}

impl Booking {
    fn new(ctx: &SchedulerContext, task_name: &str) -> Self {
        Self {
            task_name: task_name.to_string(),
            booking_path: ctx.paths.booking_path(task_name),
            claim_path: ctx.paths.claim_path(task_name),
            state: Mutex::new(ClaimState::Unclaimed),
            holders: Mutex::new(HashSet::new()),
        }
    }

    /// Cluster-wide task name the booking is keyed by.
    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.state(), ClaimState::Owned(_))
    }

    pub fn holder_count(&self) -> usize {
        self.lock_holders().len()
    }

    pub fn attach(&self, holder: &str) {
        self.lock_holders().insert(holder.to_string());
    }

    /// Detaches `holder`; the last holder to leave releases the claim.
    /// Safe to retry after an error.
    pub async fn detach(&self, ctx: &SchedulerContext, holder: &str) -> SchedulerResult<()> {
        let last = {
            let mut holders = self.lock_holders();
            holders.remove(holder);
            holders.is_empty()
        };
        if last {
            self.release(ctx, "no remaining holders").await?;
        }
        Ok(())
    }

    /// Creates the persistent booking path if needed.
    pub async fn ensure_booking_path(&self, ctx: &SchedulerContext) -> SchedulerResult<()> {
        ctx.store.ensure_path(&self.booking_path).await?;
        Ok(())
    }

    pub async fn try_claim(&self, ctx: &SchedulerContext) -> SchedulerResult<ClaimOutcome> {
        if self.is_owned() {
            return Ok(ClaimOutcome::AlreadyOwned);
        }

        self.ensure_booking_path(ctx).await?;
        let session = ctx.store.session_id();
        let record = ClaimRecord {
            endpoint: ctx.endpoint.clone(),
            service_version: ctx.paths.service_version().to_string(),
            session,
            claimed_at: Utc::now(),
        };

        match ctx
            .store
            .create(&self.claim_path, &record.to_bytes()?, CreateMode::Ephemeral)
            .await
        {
            Ok(()) => {
                self.set_state(ClaimState::Owned(session));
                StructuredLogger::log_claim_acquired(
                    &self.task_name,
                    &ctx.node_id,
                    &session.to_string(),
                );
                Ok(ClaimOutcome::Acquired)
            }
            Err(StoreError::PathExists(_)) => {
                // A holder sharing this booking may have won the race, or our
                // claim survived a reconnect after local state was dropped.
                let owner = ctx.store.ephemeral_owner(&self.claim_path).await?;
                if owner == Some(session) {
                    self.set_state(ClaimState::Owned(session));
                    Ok(ClaimOutcome::AlreadyOwned)
                } else {
                    StructuredLogger::log_claim_contended(&self.task_name, &ctx.node_id);
                    Ok(ClaimOutcome::Contended)
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Deletes the claim if it is still ours.
    pub async fn release(&self, ctx: &SchedulerContext, reason: &str) -> SchedulerResult<()> {
        let ClaimState::Owned(session) = self.state() else {
            return Ok(());
        };

        if ctx.store.ephemeral_owner(&self.claim_path).await? == Some(session) {
            ctx.store.delete_if_exists(&self.claim_path).await?;
            StructuredLogger::log_claim_released(&self.task_name, &ctx.node_id, reason);
        } else {
            debug!(task.name = %self.task_name, "Claim already gone, nothing to release");
        }
        self.set_state(ClaimState::Unclaimed);
        Ok(())
    }

    /// Checks that the claim still belongs to the current session. A lost
    /// claim is forgotten locally.
    pub async fn verify(&self, ctx: &SchedulerContext) -> SchedulerResult<bool> {
        let ClaimState::Owned(session) = self.state() else {
            return Ok(false);
        };

        let valid = ctx.store.session_id() == session
            && ctx.store.ephemeral_owner(&self.claim_path).await? == Some(session);
        if !valid {
            self.set_state(ClaimState::Unclaimed);
        }
        Ok(valid)
    }

    /// Forgets local ownership without touching the store.
    pub fn drop_claim(&self) {
        self.set_state(ClaimState::Unclaimed);
    }

    pub async fn is_free(&self, ctx: &SchedulerContext) -> SchedulerResult<bool> {
        Ok(!ctx.store.exists(&self.claim_path).await?)
    }

    /// Endpoint named in the current claim, `None` when unclaimed or unreadable.
    pub async fn current_owner(
        &self,
        ctx: &SchedulerContext,
    ) -> SchedulerResult<Option<NodeEndpoint>> {
        let data = ctx.store.get_data(&self.claim_path).await?;
        Ok(data.and_then(|bytes| match ClaimRecord::from_bytes(&bytes) {
            Ok(record) => Some(record.endpoint),
            Err(err) => {
                debug!(task.name = %self.task_name, error = %err, "Unreadable claim record");
                None
            }
        }))
    }

    fn state(&self) -> ClaimState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ClaimState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn lock_holders(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.holders.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Node-wide map from task name to its live [`Booking`].
#[derive(Default)]
pub struct BookingRegistry {
    bookings: Mutex<HashMap<String, Weak<Booking>>>,
}

impl BookingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, ctx: &SchedulerContext, task_name: &str) -> Arc<Booking> {
        let mut bookings = self.bookings.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(booking) = bookings.get(task_name).and_then(Weak::upgrade) {
            return booking;
        }
        bookings.retain(|_, weak| weak.strong_count() > 0);
        let booking = Arc::new(Booking::new(ctx, task_name));
        bookings.insert(task_name.to_string(), Arc::downgrade(&booking));
        booking
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::{test_context, test_context_on};
    use singleton_core::SchedulerConfig;
    use singleton_infrastructure::InMemoryCoordinationStore;

    #[tokio::test]
    async fn test_claim_is_exclusive_across_nodes() {
        let cluster = InMemoryCoordinationStore::default();
        let (ctx_a, _a, _) = test_context_on(&cluster, SchedulerConfig::default(), 1).await;
        let (ctx_b, _b, _) = test_context_on(&cluster, SchedulerConfig::default(), 2).await;
        let booking_a = BookingRegistry::new().get_or_create(&ctx_a, "refresh");
        let booking_b = BookingRegistry::new().get_or_create(&ctx_b, "refresh");

        assert_eq!(booking_a.try_claim(&ctx_a).await.unwrap(), ClaimOutcome::Acquired);
        assert_eq!(booking_b.try_claim(&ctx_b).await.unwrap(), ClaimOutcome::Contended);
        assert_eq!(booking_a.try_claim(&ctx_a).await.unwrap(), ClaimOutcome::AlreadyOwned);

        assert_eq!(
            booking_b.current_owner(&ctx_b).await.unwrap(),
            Some(ctx_a.endpoint.clone())
        );

        booking_a.release(&ctx_a, "test").await.unwrap();
        assert!(!booking_a.is_owned());
        assert!(booking_b.is_free(&ctx_b).await.unwrap());
        assert_eq!(booking_b.try_claim(&ctx_b).await.unwrap(), ClaimOutcome::Acquired);
        // The persistent booking path outlives every claim.
        assert!(cluster.node_exists("/clustered_singleton/refresh"));
    }

    #[tokio::test]
    async fn test_last_holder_releases() {
        let cluster = InMemoryCoordinationStore::default();
        let (ctx, _session, _) = test_context_on(&cluster, SchedulerConfig::default(), 1).await;
        let registry = BookingRegistry::new();
        let booking = registry.get_or_create(&ctx, "refresh");
        assert!(Arc::ptr_eq(&booking, &registry.get_or_create(&ctx, "refresh")));

        booking.attach("refresh");
        booking.attach("refresh_1");
        booking.try_claim(&ctx).await.unwrap();

        booking.detach(&ctx, "refresh").await.unwrap();
        assert!(booking.is_owned());
        assert!(cluster.node_exists("/clustered_singleton/refresh/booking"));

        booking.detach(&ctx, "refresh_1").await.unwrap();
        assert!(!booking.is_owned());
        assert!(!cluster.node_exists("/clustered_singleton/refresh/booking"));
    }

    #[tokio::test]
    async fn test_verify_detects_expired_session() {
        let (ctx, session, _) = test_context(SchedulerConfig::default()).await;
        let booking = BookingRegistry::new().get_or_create(&ctx, "refresh");
        booking.try_claim(&ctx).await.unwrap();
        assert!(booking.verify(&ctx).await.unwrap());

        session.expire_session();
        assert!(!booking.verify(&ctx).await.unwrap());
        assert!(!booking.is_owned());
        assert_eq!(booking.try_claim(&ctx).await.unwrap(), ClaimOutcome::Acquired);
    }

    #[tokio::test]
    async fn test_dropped_claim_is_recognised_on_reclaim() {
        let (ctx, _session, _) = test_context(SchedulerConfig::default()).await;
        let booking = BookingRegistry::new().get_or_create(&ctx, "refresh");
        booking.try_claim(&ctx).await.unwrap();

        booking.drop_claim();
        assert_eq!(booking.try_claim(&ctx).await.unwrap(), ClaimOutcome::AlreadyOwned);
    }

    #[tokio::test]
    async fn test_claim_propagates_store_failure() {
        let (ctx, session, _) = test_context(SchedulerConfig::default()).await;
        let booking = BookingRegistry::new().get_or_create(&ctx, "refresh");
        session.set_unavailable(true);
        assert!(booking.try_claim(&ctx).await.is_err());
        assert!(!booking.is_owned());
    }
}
