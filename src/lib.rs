//! Clustered singleton task scheduler
//!
//! Nodes sharing a coordination store each schedule the same named tasks;
//! the store decides which node runs each one.

pub mod demo;
pub mod shutdown;

pub use singleton_core::{
    init_logging, ClaimRecord, CoordinationStore, DoneRecord, LogConfig, LogLevel, NodeEndpoint,
    OutputFormat, Recurrence, Schedule, SchedulerConfig, SchedulerError, SchedulerResult,
    StoreError, TaskGroup,
};
pub use singleton_dispatcher::{
    exit_process_halt_handler, task_fn, Cancellable, HaltHandler, SchedulerBuilder,
    SchedulerEvents, SingletonScheduler, SingletonTask, StatsSnapshot, TaskHandle,
};
pub use singleton_infrastructure::{InMemoryCoordinationStore, InMemorySession};
