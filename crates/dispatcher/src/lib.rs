//! Clustered singleton task dispatching
//!
//! Wires ownership tracking, session recovery, load balancing and
//! cancellation into [`SingletonScheduler`].

pub mod booking;
pub mod cancellation;
pub mod context;
pub mod done_coordinator;
pub mod load_controller;
pub mod recovery_monitor;
pub mod registry;
pub mod scheduler;
pub mod stats_collector;
pub mod task;
pub mod task_pool;
pub mod tracker;
pub mod weight_balancer;

pub use cancellation::TaskHandle;
pub use context::{exit_process_halt_handler, HaltHandler};
pub use scheduler::{SchedulerBuilder, SingletonScheduler};
pub use stats_collector::{SchedulerEvents, StatsCollector, StatsSnapshot};
pub use task::{task_fn, Cancellable, SingletonTask};
pub use task_pool::{BoundedTaskPool, TaskPool};
pub use tracker::TrackerState;
