//! Session recovery and ownership reconciliation
//!
//! Connection events are consumed by a single dispatcher task:
//!
//! * `Lost` marks every active tracker suspect.
//! * `RegainedAfterLost` queues an expiry check that runs once the session
//!   timeout plus a safety margin has passed. Only the most recent check
//!   still acts; earlier ones are superseded by an incarnation counter.
//!
//! Checks run one at a time on their own task. A separate loop reconciles
//! ownership every `expiry_check_interval`, validating held claims and
//! reporting membership changes.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use singleton_core::{paths::WEIGHT_PATH, ConnectionEvent, SchedulerResult};
use singleton_infrastructure::StructuredLogger;

use crate::context::SchedulerContext;
use crate::load_controller::LoadController;
use crate::registry::TaskRegistry;
use crate::stats_collector::SchedulerEvents;

#[derive(Debug, Clone, Copy)]
struct ExpiryCheck {
    incarnation: u64,
    run_at: Instant,
}

/// 会话恢复监视器
pub struct RecoveryMonitor {
    ctx: Arc<SchedulerContext>,
    registry: Arc<TaskRegistry>,
    load: Arc<LoadController>,
    incarnation: AtomicU64,
    members: Mutex<BTreeSet<String>>,
    run_set: Mutex<BTreeSet<String>>,
}

impl RecoveryMonitor {
    pub fn new(
        ctx: Arc<SchedulerContext>,
        registry: Arc<TaskRegistry>,
        load: Arc<LoadController>,
    ) -> Self {
        Self {
            ctx,
            registry,
            load,
            incarnation: AtomicU64::new(0),
            members: Mutex::new(BTreeSet::new()),
            run_set: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation.load(Ordering::SeqCst)
    }

    /// Spawns the event dispatcher, the expiry checker and the reconcile loop.
    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let events = self.ctx.store.subscribe_connection_events();
        let (check_tx, check_rx) = mpsc::unbounded_channel();

        let dispatcher = {
            let monitor = Arc::clone(self);
            let shutdown = shutdown.subscribe();
            let check_tx = check_tx.clone();
            self.ctx
                .runtime
                .spawn(async move { monitor.dispatch_events(events, check_tx, shutdown).await })
        };
        let checker = {
            let monitor = Arc::clone(self);
            let shutdown = shutdown.subscribe();
            self.ctx
                .runtime
                .spawn(async move { monitor.run_expiry_checks(check_rx, check_tx, shutdown).await })
        };
        let reconciler = {
            let monitor = Arc::clone(self);
            let shutdown = shutdown.subscribe();
            self.ctx
                .runtime
                .spawn(async move { monitor.reconcile_loop(shutdown).await })
        };

        info!(node.id = %self.ctx.node_id, "Recovery monitor started");
        vec![dispatcher, checker, reconciler]
    }

    async fn dispatch_events(
        &self,
        mut events: broadcast::Receiver<ConnectionEvent>,
        checks: mpsc::UnboundedSender<ExpiryCheck>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(ConnectionEvent::Lost) => self.on_connection_lost(),
                    Ok(ConnectionEvent::RegainedAfterLost) => self.on_connection_regained(&checks),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed connection events, re-verifying session");
                        self.on_connection_lost();
                        self.on_connection_regained(&checks);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Connection event stream closed");
                        break;
                    }
                },
                _ = shutdown.recv() => break,
            }
        }
    }

    /// Marks every active tracker suspect.
    pub fn on_connection_lost(&self) {
        self.incarnation.fetch_add(1, Ordering::SeqCst);
        let trackers = self.registry.active();
        for tracker in &trackers {
            tracker.handle_potential_session_loss();
        }
        StructuredLogger::log_session_suspect(&self.ctx.node_id, trackers.len());
    }

    fn on_connection_regained(&self, checks: &mpsc::UnboundedSender<ExpiryCheck>) {
        let incarnation = self.incarnation.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.expiry_check_delay();
        info!(
            incarnation,
            delay_ms = delay.as_millis() as u64,
            "Store connection regained, scheduling session check"
        );
        let _ = checks.send(ExpiryCheck {
            incarnation,
            run_at: Instant::now() + delay,
        });
    }

    /// Session timeout plus margin; the configured default stands in when
    /// the store cannot report its timeout.
    pub fn expiry_check_delay(&self) -> Duration {
        self.ctx
            .store
            .session_timeout()
            .unwrap_or_else(|| self.ctx.config.default_session_timeout())
            + self.ctx.config.session_defer_margin()
    }

    async fn run_expiry_checks(
        &self,
        mut checks: mpsc::UnboundedReceiver<ExpiryCheck>,
        retry: mpsc::UnboundedSender<ExpiryCheck>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            let check = tokio::select! {
                check = checks.recv() => match check {
                    Some(check) => check,
                    None => break,
                },
                _ = shutdown.recv() => break,
            };

            tokio::select! {
                _ = tokio::time::sleep_until(check.run_at) => {}
                _ = shutdown.recv() => break,
            }
            if check.incarnation != self.incarnation() {
                debug!(incarnation = check.incarnation, "Superseded session check skipped");
                continue;
            }

            match self.verify_session().await {
                Ok(()) => {}
                Err(err) => {
                    warn!(error = %err, "Session check failed, retrying");
                    let _ = retry.send(ExpiryCheck {
                        incarnation: check.incarnation,
                        run_at: Instant::now() + self.ctx.config.expiry_check_interval(),
                    });
                }
            }
        }
    }

    /// Asks every tracker whether its claim survived. Any loss is treated as
    /// a confirmed expiry.
    pub async fn verify_session(&self) -> SchedulerResult<()> {
        let mut expired = !self.load.membership_record_is_ours().await?;
        for tracker in self.registry.active() {
            if !tracker.try_recover_session().await? {
                expired = true;
            }
        }

        if expired {
            self.on_confirmed_expiry().await;
        } else {
            info!(node.id = %self.ctx.node_id, "Session survived reconnect");
        }
        Ok(())
    }

    async fn on_confirmed_expiry(&self) {
        warn!(node.id = %self.ctx.node_id, "Session expired, dropping all claims");
        if self.ctx.config.halt_on_store_lost {
            self.ctx.halt("coordination store session expired");
        }

        let trackers = self.registry.active();
        let dropped = trackers.iter().filter(|t| t.is_owner()).count();
        for tracker in &trackers {
            tracker.refresh_after_expiry();
        }
        if let Err(err) = self.load.register_membership().await {
            error!(error = %err, "Could not re-register membership");
        }
        if dropped > 0 {
            self.ctx.events.tasks_removed_from_membership(dropped);
        }
    }

    async fn reconcile_loop(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.ctx.config.expiry_check_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.reconcile().await {
                        debug!(error = %err, "Ownership reconcile skipped");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    /// One reconcile pass: validate held claims, wake watchers whose booking
    /// is free, report membership and run-set changes.
    pub async fn reconcile(&self) -> SchedulerResult<()> {
        let trackers = self.registry.active();
        if trackers.iter().any(|t| t.is_session_suspect()) {
            return Ok(());
        }

        for tracker in &trackers {
            if tracker.is_owner() {
                if !tracker.booking().verify(&self.ctx).await? {
                    warn!(task.name = %tracker.name(), "Claim vanished, re-claiming");
                    tracker.wake();
                }
            } else if tracker.booking().is_free(&self.ctx).await? {
                tracker.wake();
            }
        }

        let members: BTreeSet<String> = self
            .ctx
            .store
            .get_children(WEIGHT_PATH)
            .await?
            .into_iter()
            .collect();
        let run_set: BTreeSet<String> = trackers
            .iter()
            .filter(|t| t.is_owner())
            .map(|t| t.name().to_string())
            .collect();

        let membership_changed = {
            let mut previous = lock(&self.members);
            let changed = *previous != members;
            *previous = members.clone();
            changed
        };
        let (gained, lost) = {
            let mut previous = lock(&self.run_set);
            let gained = run_set.difference(&previous).count();
            let lost = previous.difference(&run_set).count();
            *previous = run_set.clone();
            (gained, lost)
        };

        if membership_changed {
            info!(members = members.len(), "Cluster membership changed");
            self.ctx.events.membership_changed(members.len());
            if gained > 0 {
                self.ctx.events.tasks_added_from_membership(gained);
            }
            if lost > 0 {
                self.ctx.events.tasks_removed_from_membership(lost);
            }
        }
        self.ctx.events.run_set_size(run_set.len());
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
