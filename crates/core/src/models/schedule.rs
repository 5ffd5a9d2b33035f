use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::SchedulerError;

/// Separates a lock-step base name from the copy counter. Caller task names
/// may not contain it, so copies never share a name with a scheduled task.
pub const LOCK_STEP_SEPARATOR: char = '#';

/// Name of the `n`th lock-step copy of `base`.
pub fn lock_step_copy_name(base: &str, n: u64) -> String {
    format!("{base}{LOCK_STEP_SEPARATOR}{n}")
}

/// Computes the current load contributed by one task on its owner.
pub type WeightProvider = Arc<dyn Fn() -> u32 + Send + Sync>;

/// How often a task body should run on its owning node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurrence {
    /// Run once after `delay`, then retire.
    Once { delay: Duration },
    /// Run after `initial_delay`, then every `period`.
    Periodic {
        initial_delay: Duration,
        period: Duration,
    },
}

impl Recurrence {
    /// Delay before the next run, `None` once a one-shot has run.
    pub fn next_delay(&self, completed_runs: u64) -> Option<Duration> {
        match *self {
            Recurrence::Once { delay } => (completed_runs == 0).then_some(delay),
            Recurrence::Periodic {
                initial_delay,
                period,
            } => Some(if completed_runs == 0 {
                initial_delay
            } else {
                period
            }),
        }
    }

    pub fn is_one_shot(&self) -> bool {
        matches!(self, Recurrence::Once { .. })
    }
}

/// Desired cadence for one cluster-wide task name.
#[derive(Clone)]
pub struct Schedule {
    task_name: String,
    recurrence: Recurrence,
    task_group_name: Option<String>,
    in_lock_step: bool,
    release_ownership_after_run: bool,
    weight_provider: Option<WeightProvider>,
}

impl Schedule {
    pub fn builder(task_name: impl Into<String>) -> ScheduleBuilder {
        ScheduleBuilder::new(task_name)
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn recurrence(&self) -> Recurrence {
        self.recurrence
    }

    /// Explicit task group, `None` means the configured default group.
    pub fn task_group_name(&self) -> Option<&str> {
        self.task_group_name.as_deref()
    }

    pub fn is_in_lock_step(&self) -> bool {
        self.in_lock_step
    }

    pub fn release_ownership_after_run(&self) -> bool {
        self.release_ownership_after_run
    }

    /// Weight of this task on its owner; tasks without a provider weigh 1.
    pub fn weight(&self) -> u32 {
        self.weight_provider.as_ref().map(|provider| provider()).unwrap_or(1)
    }

    /// Resolves the group this schedule runs in.
    pub fn resolved_group<'a>(&'a self, default_group: &'a str) -> &'a str {
        self.task_group_name.as_deref().unwrap_or(default_group)
    }

    /// Copy of this schedule under a different execution identity.
    pub fn with_task_name(&self, task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.task_name.trim().is_empty() {
            return Err(SchedulerError::invalid_argument("task name must not be empty"));
        }
        if self.task_name.contains('/') {
            return Err(SchedulerError::invalid_argument(format!(
                "task name must not contain '/': {}",
                self.task_name
            )));
        }
        if self.task_name.contains(LOCK_STEP_SEPARATOR) {
            return Err(SchedulerError::invalid_argument(format!(
                "task name must not contain '{LOCK_STEP_SEPARATOR}': {}",
                self.task_name
            )));
        }
        if let Recurrence::Periodic { period, .. } = self.recurrence {
            if period.is_zero() {
                return Err(SchedulerError::invalid_argument(format!(
                    "period of task {} must be positive",
                    self.task_name
                )));
            }
        }
        if let Some(group) = &self.task_group_name {
            if group.trim().is_empty() {
                return Err(SchedulerError::invalid_argument("task group name must not be empty"));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schedule")
            .field("task_name", &self.task_name)
            .field("recurrence", &self.recurrence)
            .field("task_group_name", &self.task_group_name)
            .field("in_lock_step", &self.in_lock_step)
            .field("release_ownership_after_run", &self.release_ownership_after_run)
            .field("weight_provider", &self.weight_provider.is_some())
            .finish()
    }
}

pub struct ScheduleBuilder {
    task_name: String,
    recurrence: Recurrence,
    task_group_name: Option<String>,
    in_lock_step: bool,
    release_ownership_after_run: bool,
    weight_provider: Option<WeightProvider>,
}

impl ScheduleBuilder {
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            recurrence: Recurrence::Once {
                delay: Duration::ZERO,
            },
            task_group_name: None,
            in_lock_step: false,
            release_ownership_after_run: false,
            weight_provider: None,
        }
    }

    pub fn run_once(mut self) -> Self {
        self.recurrence = Recurrence::Once {
            delay: Duration::ZERO,
        };
        self
    }

    pub fn run_once_after(mut self, delay: Duration) -> Self {
        self.recurrence = Recurrence::Once { delay };
        self
    }

    pub fn every(mut self, period: Duration) -> Self {
        self.recurrence = Recurrence::Periodic {
            initial_delay: Duration::ZERO,
            period,
        };
        self
    }

    /// Only meaningful after `every`.
    pub fn starting_after(mut self, initial_delay: Duration) -> Self {
        if let Recurrence::Periodic { period, .. } = self.recurrence {
            self.recurrence = Recurrence::Periodic {
                initial_delay,
                period,
            };
        }
        self
    }

    pub fn task_group(mut self, group_name: impl Into<String>) -> Self {
        self.task_group_name = Some(group_name.into());
        self
    }

    pub fn in_lock_step(mut self) -> Self {
        self.in_lock_step = true;
        self
    }

    pub fn release_ownership_after_run(mut self) -> Self {
        self.release_ownership_after_run = true;
        self
    }

    pub fn weight_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> u32 + Send + Sync + 'static,
    {
        self.weight_provider = Some(Arc::new(provider));
        self
    }

    pub fn build(self) -> Schedule {
        Schedule {
            task_name: self.task_name,
            recurrence: self.recurrence,
            task_group_name: self.task_group_name,
            in_lock_step: self.in_lock_step,
            release_ownership_after_run: self.release_ownership_after_run,
            weight_provider: self.weight_provider,
        }
    }
}
