//! # Data model
//!
//! Values shared by every layer of the clustered singleton scheduler.
//!
//! - [`Schedule`]: what a caller submits for one task name (cadence, task
//!   group, lock-step flag, optional weight provider).
//! - [`TaskGroup`]: a named capacity unit backing one worker pool.
//! - [`NodeEndpoint`]: identity of a node, written into claim records and
//!   weight records.
//! - [`ClaimRecord`] / [`DoneRecord`]: JSON payloads stored under the
//!   coordination store paths.
//!
//! Scheduling state flows like this:
//!
//! ```text
//! UNCLAIMED → CLAIMING → OWNER-RUNNING ⇄ OWNER-IDLE → CANCELLING → RETIRED
//!                ↓
//!        NOT-OWNER-WATCHING ──(booking free / steal marker)──→ CLAIMING
//! ```

pub mod endpoint;
pub mod records;
pub mod schedule;
pub mod task_group;

pub use endpoint::*;
pub use records::*;
pub use schedule::*;
pub use task_group::*;
