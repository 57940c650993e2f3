//! Cooperative, frame-driven task manager.
//!
//! Work is registered as a [`TaskBody`] (usually a closure) and driven one
//! cycle at a time by a [`TaskManager`], either from a host loop via
//! [`TaskManager::tick`] or on a dedicated thread via [`TaskManager::run_loop`].
//! What a body reports back as its [`Disposition`] decides whether it is
//! removed, queued for the next cycle, or retried straight away.

pub mod manager;
pub mod metrics;
pub mod task;
pub mod types;

pub use manager::{Deferred, LoopHandle, TaskManager};
pub use metrics::{DispositionCounts, ManagerMetrics};
pub use task::{Task, TaskBody, TaskContext, TaskError, TaskHandle};
pub use types::{CycleReport, Disposition, FirstRun, ManagerConfig, RetryState, RunOutcome, Tick};
