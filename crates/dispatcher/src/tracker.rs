//! Per-task ownership state machine
//!
//! ```text
//! UNCLAIMED -> CLAIMING -> OWNER_IDLE <-> OWNER_RUNNING
//!                  |            |
//!                  v            v
//!          NOT_OWNER_WATCHING  (released: steal / release after run)
//!
//! any -> CANCELLING -> RETIRED      one-shot done -> RETIRED
//! ```
//!
//! Each tracker is driven by one tokio task. The driver only releases the
//! claim between runs, so ownership never changes hands mid-run.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{oneshot, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use singleton_core::{Recurrence, Schedule, SchedulerResult};
use singleton_infrastructure::StructuredLogger;

use crate::booking::Booking;
use crate::context::SchedulerContext;
use crate::done_coordinator::DoneCoordinator;
use crate::registry::TaskRegistry;
use crate::stats_collector::SchedulerEvents;
use crate::task::SingletonTask;
use crate::task_pool::TaskPool;

/// 任务跟踪器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Unclaimed,
    Claiming,
    OwnerIdle,
    OwnerRunning,
    NotOwnerWatching,
    Cancelling,
    Retired,
}

enum RunResult {
    Succeeded,
    Failed(String),
    Panicked(String),
    Interrupted,
    NotStarted(String),
}

enum Step {
    Continue,
    Wait(Instant),
    Retire,
}

pub struct TaskTracker {
    name: String,
    booking: Arc<Booking>,
    schedule: RwLock<Schedule>,
    task: Arc<dyn SingletonTask>,
    pool: Arc<dyn TaskPool>,
    ctx: Arc<SchedulerContext>,
    done: Arc<DoneCoordinator>,
    registry: Weak<TaskRegistry>,
    state: Mutex<TrackerState>,
    completed_runs: AtomicU64,
    session_suspect: AtomicBool,
    // Offered weight of a pending steal request.
    steal_requested: Mutex<Option<u64>>,
    released_for_steal_at: Mutex<Option<Instant>>,
    rescheduled: AtomicBool,
    cancelled: AtomicBool,
    may_interrupt: AtomicBool,
    closing: AtomicBool,
    driver_exited: AtomicBool,
    wake: Notify,
    running: Mutex<Option<AbortHandle>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl TaskTracker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        schedule: Schedule,
        task: Arc<dyn SingletonTask>,
        booking: Arc<Booking>,
        pool: Arc<dyn TaskPool>,
        ctx: Arc<SchedulerContext>,
        done: Arc<DoneCoordinator>,
        registry: Weak<TaskRegistry>,
    ) -> Arc<Self> {
        let name = name.into();
        booking.attach(&name);
        Arc::new(Self {
            name,
            booking,
            schedule: RwLock::new(schedule),
            task,
            pool,
            ctx,
            done,
            registry,
            state: Mutex::new(TrackerState::Unclaimed),
            completed_runs: AtomicU64::new(0),
            session_suspect: AtomicBool::new(false),
            steal_requested: Mutex::new(None),
            released_for_steal_at: Mutex::new(None),
            rescheduled: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            may_interrupt: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            driver_exited: AtomicBool::new(false),
            wake: Notify::new(),
            running: Mutex::new(None),
            driver: Mutex::new(None),
        })
    }

    /// Spawns the driver; it attempts the claim immediately.
    pub fn start(self: &Arc<Self>) {
        let handle = self.ctx.runtime.spawn(Arc::clone(self).drive());
        *lock(&self.driver) = Some(handle);
    }

    /// Execution identity; differs from the booking name for lock-step copies.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn booking(&self) -> &Arc<Booking> {
        &self.booking
    }

    pub fn booking_name(&self) -> &str {
        self.booking.task_name()
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn task_group(&self) -> &str {
        self.pool.name()
    }

    /// Replaces the schedule; the next run is re-timed from now.
    pub fn update_schedule(&self, schedule: Schedule) {
        *self.schedule.write().unwrap_or_else(|e| e.into_inner()) = schedule;
        self.rescheduled.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn state(&self) -> TrackerState {
        *lock(&self.state)
    }

    pub fn completed_runs(&self) -> u64 {
        self.completed_runs.load(Ordering::SeqCst)
    }

    pub fn weight(&self) -> u32 {
        self.schedule().weight()
    }

    pub fn is_owner(&self) -> bool {
        self.booking.is_owned()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_retired(&self) -> bool {
        self.state() == TrackerState::Retired
    }

    pub fn is_active(&self) -> bool {
        !self.is_cancelled() && !self.closing.load(Ordering::SeqCst) && !self.is_retired()
    }

    pub fn is_session_suspect(&self) -> bool {
        self.session_suspect.load(Ordering::SeqCst)
    }

    /// Re-evaluates ownership without waiting for the next poll.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Marks the tracker cancelled. Returns false if it already was or has retired.
    pub fn mark_cancelled(&self, may_interrupt_if_running: bool) -> bool {
        if self.is_retired() || self.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.may_interrupt
            .store(may_interrupt_if_running, Ordering::SeqCst);
        if may_interrupt_if_running {
            self.abort_running();
        }
        self.wake.notify_one();
        true
    }

    /// Releases the booking once the driver has stopped. Returns false while
    /// a run is still draining.
    pub async fn try_release_after_cancel(&self) -> SchedulerResult<bool> {
        if self.is_retired() {
            return Ok(true);
        }
        if !self.driver_exited.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.booking.detach(&self.ctx, &self.name).await?;
        self.set_state(TrackerState::Retired);
        Ok(true)
    }

    /// Stops the driver for scheduler shutdown and makes a best-effort release.
    pub async fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.abort_running();
        self.wake.notify_one();

        let driver = lock(&self.driver).take();
        if let Some(driver) = driver {
            if tokio::time::timeout(self.ctx.config.max_wait_time_post_cancel(), driver)
                .await
                .is_err()
            {
                warn!(task.name = %self.name, "Driver did not stop in time");
            }
        }
        if let Err(err) = self.booking.detach(&self.ctx, &self.name).await {
            debug!(task.name = %self.name, error = %err, "Booking not released on shutdown");
        }
        self.set_state(TrackerState::Retired);
    }

    /// Connection lost: hold new runs until the session is verified.
    pub fn handle_potential_session_loss(&self) {
        if self.is_active() {
            self.session_suspect.store(true, Ordering::SeqCst);
        }
    }

    /// Checks whether the claim survived a reconnect. The suspect flag is
    /// cleared only when it did.
    pub async fn try_recover_session(&self) -> SchedulerResult<bool> {
        if !self.is_session_suspect() {
            return Ok(true);
        }
        let survived = if self.booking.is_owned() {
            self.booking.verify(&self.ctx).await?
        } else {
            true
        };
        if self.booking.is_owned() || !survived {
            StructuredLogger::log_session_verified(&self.name, survived);
        }
        if survived {
            self.clear_suspect();
        }
        Ok(survived)
    }

    /// Confirmed expiry: forget the claim and start over.
    pub fn refresh_after_expiry(&self) {
        self.booking.drop_claim();
        *lock(&self.released_for_steal_at) = None;
        self.clear_suspect();
    }

    /// Asks the owner to give the task up between runs. Lock-step tasks and
    /// bookings shared by several trackers are never offered.
    pub fn request_steal(&self, offered_weight: u64) -> bool {
        if !self.is_active()
            || !self.booking.is_owned()
            || self.schedule().is_in_lock_step()
            || self.booking.holder_count() > 1
        {
            return false;
        }
        *lock(&self.steal_requested) = Some(offered_weight);
        self.wake.notify_one();
        true
    }

    fn clear_suspect(&self) {
        self.session_suspect.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    fn should_stop(&self) -> bool {
        self.is_cancelled() || self.closing.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: TrackerState) {
        *lock(&self.state) = state;
    }

    fn abort_running(&self) {
        if let Some(handle) = lock(&self.running).as_ref() {
            handle.abort();
        }
    }

    fn poll_deadline(&self) -> Instant {
        let interval = self.ctx.config.expiry_check_interval();
        let jitter_ms = (interval.as_millis() as u64) / 10;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::random_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        Instant::now() + interval + jitter
    }

    async fn wait(&self, deadline: Instant) {
        tokio::select! {
            _ = self.wake.notified() => {}
            _ = tokio::time::sleep_until(deadline) => {}
        }
    }

    async fn drive(self: Arc<Self>) {
        let mut next_due = Instant::now()
            + self
                .schedule()
                .recurrence()
                .next_delay(0)
                .unwrap_or_default();

        while !self.should_stop() {
            if self.rescheduled.swap(false, Ordering::SeqCst) {
                match self.schedule().recurrence().next_delay(self.completed_runs()) {
                    Some(delay) => next_due = Instant::now() + delay,
                    None => {
                        self.retire().await;
                        break;
                    }
                }
            }

            let step = if self.booking.is_owned() {
                self.owner_step(&mut next_due).await
            } else {
                self.watcher_step(next_due).await
            };

            match step {
                Step::Continue => {}
                Step::Wait(deadline) => self.wait(deadline).await,
                Step::Retire => {
                    self.retire().await;
                    break;
                }
            }
        }

        if self.is_cancelled() && !self.is_retired() {
            self.set_state(TrackerState::Cancelling);
        }
        self.driver_exited.store(true, Ordering::SeqCst);
        debug!(task.name = %self.name, "Tracker driver stopped");
    }

    async fn watcher_step(&self, next_due: Instant) -> Step {
        if self.is_session_suspect() {
            return Step::Wait(self.poll_deadline());
        }

        let schedule = self.schedule();
        let booking_name = self.booking_name();

        if self.ctx.is_rolling_upgrade_in_progress(booking_name).await {
            debug!(task.name = %self.name, "Legacy nodes still elect this task, not claiming");
            return Step::Wait(self.poll_deadline());
        }

        if schedule.recurrence().is_one_shot() && self.completed_runs() == 0 {
            match self.done.is_done(booking_name).await {
                Ok(true) => {
                    info!(task.name = %self.name, "One-shot task already ran on this version");
                    return Step::Retire;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(task.name = %self.name, error = %err, "Could not read done marker");
                    return Step::Wait(self.poll_deadline());
                }
            }
        }

        // Tasks that give ownership up after each run only claim when due.
        if schedule.release_ownership_after_run() && Instant::now() < next_due {
            self.set_state(TrackerState::Unclaimed);
            return Step::Wait(next_due);
        }

        let mut stealing = false;
        if self.ctx.config.weight_balance_period().is_some() {
            match self.steal_gate(&schedule).await {
                Ok(StealGate::Open) => {}
                Ok(StealGate::Steal) => stealing = true,
                Ok(StealGate::Hold(deadline)) => return Step::Wait(deadline),
                Err(err) => {
                    debug!(task.name = %self.name, error = %err, "Steal marker check failed");
                    return Step::Wait(self.poll_deadline());
                }
            }
        }

        self.set_state(TrackerState::Claiming);
        match self.booking.try_claim(&self.ctx).await {
            Ok(outcome) if outcome.is_owner() => {
                if stealing {
                    if let Err(err) = self.done.clear_steal(booking_name).await {
                        warn!(task.name = %self.name, error = %err, "Could not clear steal marker");
                    }
                    StructuredLogger::log_task_stolen(booking_name, &self.ctx.node_id);
                }
                self.set_state(TrackerState::OwnerIdle);
                Step::Continue
            }
            Ok(_) => {
                self.set_state(TrackerState::NotOwnerWatching);
                Step::Wait(self.poll_deadline())
            }
            Err(err) => {
                warn!(task.name = %self.name, error = %err, "Claim attempt failed");
                self.set_state(TrackerState::Unclaimed);
                Step::Wait(self.poll_deadline())
            }
        }
    }

    async fn steal_gate(&self, schedule: &Schedule) -> SchedulerResult<StealGate> {
        let booking_name = self.booking_name();
        let released_at = *lock(&self.released_for_steal_at);

        if let Some(released_at) = released_at {
            let grace_end = released_at + self.ctx.config.steal_grace();
            if Instant::now() < grace_end && self.done.steal_offer(booking_name).await?.is_some() {
                return Ok(StealGate::Hold(grace_end.min(self.poll_deadline())));
            }
            // Nobody took it; withdraw the offer and compete normally.
            *lock(&self.released_for_steal_at) = None;
            self.done.clear_steal(booking_name).await?;
            return Ok(StealGate::Open);
        }

        match self.done.steal_offer(booking_name).await? {
            None => Ok(StealGate::Open),
            Some(offered) => {
                let ours = self.ctx.last_computed_weight() + u64::from(schedule.weight());
                if ours < offered {
                    Ok(StealGate::Steal)
                } else {
                    Ok(StealGate::Hold(self.poll_deadline()))
                }
            }
        }
    }

    async fn owner_step(&self, next_due: &mut Instant) -> Step {
        if self.is_session_suspect() {
            return Step::Wait(self.poll_deadline());
        }

        let steal = lock(&self.steal_requested).take();
        if let Some(offered_weight) = steal {
            self.give_up_for_steal(offered_weight).await;
            return Step::Continue;
        }

        self.set_state(TrackerState::OwnerIdle);
        if Instant::now() < *next_due {
            return Step::Wait(*next_due);
        }

        let schedule = self.schedule();
        if schedule.recurrence().is_one_shot() && self.completed_runs() == 0 {
            match self.done.is_done(self.booking_name()).await {
                Ok(true) => return Step::Retire,
                Ok(false) => {}
                Err(err) => {
                    warn!(task.name = %self.name, error = %err, "Could not read done marker");
                    return Step::Wait(self.poll_deadline());
                }
            }
        }

        let started = Instant::now();
        let run_number = self.completed_runs() + 1;
        self.set_state(TrackerState::OwnerRunning);
        StructuredLogger::log_run_started(&self.name, &self.ctx.node_id, run_number);

        let result = self.run_once().await;
        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            RunResult::Succeeded => {
                StructuredLogger::log_run_finished(&self.name, &self.ctx.node_id, true, duration_ms, None);
            }
            RunResult::Failed(message) => {
                StructuredLogger::log_run_finished(
                    &self.name,
                    &self.ctx.node_id,
                    false,
                    duration_ms,
                    Some(message.as_str()),
                );
                self.ctx.events.unexpected_error(&self.name, "task_error");
            }
            RunResult::Panicked(message) => {
                StructuredLogger::log_run_finished(
                    &self.name,
                    &self.ctx.node_id,
                    false,
                    duration_ms,
                    Some(message.as_str()),
                );
                self.ctx.events.unexpected_error(&self.name, "panic");
            }
            RunResult::Interrupted => {
                info!(task.name = %self.name, "Run interrupted");
                return Step::Continue;
            }
            RunResult::NotStarted(message) => {
                warn!(task.name = %self.name, error = %message, "Run could not be submitted");
                return Step::Wait(self.poll_deadline());
            }
        }

        // A failed round still counts; the task is re-armed as usual.
        let completed = self.completed_runs.fetch_add(1, Ordering::SeqCst) + 1;
        if let Err(err) = self.done.publish_done(self.booking_name(), completed).await {
            warn!(task.name = %self.name, error = %err, "Could not publish done marker");
        }
        self.ctx.events.task_done(&self.name);

        let schedule = self.schedule();
        let Some(delay) = schedule.recurrence().next_delay(completed) else {
            return Step::Retire;
        };
        *next_due = match schedule.recurrence() {
            Recurrence::Periodic { .. } => (started + delay).max(Instant::now()),
            Recurrence::Once { .. } => Instant::now() + delay,
        };

        if schedule.release_ownership_after_run() && self.booking.holder_count() == 1 {
            if let Err(err) = self.booking.release(&self.ctx, "release after run").await {
                warn!(task.name = %self.name, error = %err, "Could not release after run");
            }
            self.set_state(TrackerState::Unclaimed);
        }
        Step::Continue
    }

    async fn give_up_for_steal(&self, offered_weight: u64) {
        let booking_name = self.booking_name();
        if self.booking.holder_count() > 1 {
            return;
        }
        if let Err(err) = self.done.mark_stealable(booking_name, offered_weight).await {
            warn!(task.name = %self.name, error = %err, "Could not mark task stealable");
            return;
        }
        match self.booking.release(&self.ctx, "rebalance").await {
            Ok(()) => {
                *lock(&self.released_for_steal_at) = Some(Instant::now());
                self.set_state(TrackerState::NotOwnerWatching);
            }
            Err(err) => {
                warn!(task.name = %self.name, error = %err, "Could not release for rebalance");
                if let Err(err) = self.done.clear_steal(booking_name).await {
                    debug!(task.name = %self.name, error = %err, "Steal marker left behind");
                }
            }
        }
    }

    async fn run_once(&self) -> RunResult {
        let task = Arc::clone(&self.task);
        let (tx, rx) = oneshot::channel();
        let job: BoxFuture<'static, ()> = Box::pin(async move {
            let outcome = AssertUnwindSafe(task.run()).catch_unwind().await;
            let _ = tx.send(outcome);
        });

        let handle = match self.pool.submit(job) {
            Ok(handle) => handle,
            Err(err) => return RunResult::NotStarted(err.to_string()),
        };
        *lock(&self.running) = Some(handle.abort_handle());
        if self.closing.load(Ordering::SeqCst)
            || (self.is_cancelled() && self.may_interrupt.load(Ordering::SeqCst))
        {
            handle.abort();
        }

        let outcome = rx.await;
        *lock(&self.running) = None;
        match outcome {
            Ok(Ok(Ok(()))) => RunResult::Succeeded,
            Ok(Ok(Err(err))) => RunResult::Failed(format!("{err:#}")),
            Ok(Err(payload)) => RunResult::Panicked(panic_message(payload.as_ref())),
            Err(_) => RunResult::Interrupted,
        }
    }

    async fn retire(&self) {
        loop {
            match self.booking.detach(&self.ctx, &self.name).await {
                Ok(()) => break,
                Err(err) if !self.closing.load(Ordering::SeqCst) => {
                    warn!(task.name = %self.name, error = %err, "Could not release retired booking, retrying");
                    tokio::time::sleep(self.ctx.config.cancel_check_interval()).await;
                }
                Err(_) => break,
            }
        }
        self.set_state(TrackerState::Retired);
        info!(task.name = %self.name, runs = self.completed_runs(), "Task retired");

        if let Some(registry) = self.registry.upgrade() {
            if registry.remove_if_same(&self.name, self) {
                self.ctx.events.task_removed(&self.name);
            }
        }
    }
}

enum StealGate {
    Open,
    Steal,
    Hold(Instant),
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "task panicked".to_string())
}
