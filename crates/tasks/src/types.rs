use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Outcome a task body reports after running. Drives the task's future scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Disposition {
    /// Finished. The task is removed and destroyed.
    Done = 0,
    /// Succeeded this cycle; run again next cycle, subject to the delay.
    Continue = 1,
    /// Retry on the very next cycle, bypassing the delay once.
    Again = 2,
}

impl Disposition {
    /// Map a raw result code onto a disposition.
    ///
    /// Anything outside `0..=2` is treated as [`Disposition::Done`] so a
    /// misbehaving body gets removed instead of running forever.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Disposition::Done,
            1 => Disposition::Continue,
            2 => Disposition::Again,
            other => {
                warn!(code = other, "Unrecognised task disposition, treating as Done");
                Disposition::Done
            }
        }
    }

    /// Raw result code for this disposition.
    pub fn code(self) -> i64 {
        self as i64
    }
}

/// What happened when a task was asked to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The delay has not elapsed. The body was not invoked and the
    /// last-run timestamp was left untouched.
    Throttled,
    /// The body ran and reported a disposition.
    Ran(Disposition),
}

/// Delay gate applied on the next run of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RetryState {
    /// Enforce the configured delay.
    #[default]
    Normal,
    /// Run unconditionally on the next opportunity, then fall back to `Normal`.
    ImmediateRetryPending,
}

/// When a freshly registered task is first allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstRun {
    /// No last-run timestamp yet, so the first cycle always executes the body.
    #[default]
    Immediate,
    /// The delay is measured from registration time.
    AfterDelay,
}

/// Task manager configuration, typically parsed from TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Sleep between cycles in milliseconds. 0 = busy-cycle.
    #[serde(default)]
    pub idle_sleep_ms: u64,
    /// Name given to the background driver thread.
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
    /// Whether the first run of a new task honours its delay.
    #[serde(default)]
    pub first_run: FirstRun,
}

fn default_thread_name() -> String {
    "frameloop-tasks".to_string()
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            idle_sleep_ms: 0,
            thread_name: default_thread_name(),
            first_run: FirstRun::default(),
        }
    }
}

impl ManagerConfig {
    /// Idle sleep between cycles, if any.
    pub fn idle_sleep(&self) -> Option<Duration> {
        (self.idle_sleep_ms > 0).then(|| Duration::from_millis(self.idle_sleep_ms))
    }
}

/// Summary of a single scheduling cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// 1-based cycle number over the manager's lifetime.
    pub cycle: u64,
    /// Tasks moved from waiting into running at cycle start.
    pub promoted: usize,
    /// Bodies actually invoked.
    pub executed: usize,
    /// Tasks checked but held back by their delay.
    pub throttled: usize,
    /// Tasks removed after reporting `Done`.
    pub removed: usize,
    /// Tasks queued for the next cycle after reporting `Continue`.
    pub requeued: usize,
    /// Tasks armed for an immediate retry after reporting `Again`.
    pub retried: usize,
}

/// Result of driving the manager from a host loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// A cycle ran.
    Ran(CycleReport),
    /// Shutdown was requested; both pools have been torn down.
    Stopped,
}
