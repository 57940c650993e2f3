use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::task::{Task, TaskError, TaskHandle};
use crate::types::{CycleReport, Disposition, RunOutcome, Tick};

use super::TaskManager;

/// Exclusive right to execute tasks of one manager. Released on drop.
pub(super) struct CycleGuard<'a> {
    _lock: MutexGuard<'a, ()>,
    owner: &'a Mutex<Option<ThreadId>>,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut owner) = self.owner.lock() {
            *owner = None;
        }
    }
}

impl TaskManager {
    /// Drive one cycle from a host loop.
    ///
    /// Once shutdown has been requested this tears down both pools and
    /// returns [`Tick::Stopped`] without running anything. Fails with
    /// `CycleInProgress` when another cycle is already running, which
    /// includes calling it from inside a task body.
    pub fn tick(&self) -> Result<Tick, TaskError> {
        let _cycle = self.enter_cycle()?;

        if self.is_shutdown() {
            self.teardown()?;
            return Ok(Tick::Stopped);
        }
        self.run_cycle().map(Tick::Ran)
    }

    pub(super) fn enter_cycle(&self) -> Result<CycleGuard<'_>, TaskError> {
        let lock = match self.inner.cycle_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(TaskError::CycleInProgress),
            Err(TryLockError::Poisoned(e)) => {
                return Err(TaskError::LockPoisoned(format!("cycle lock: {}", e)));
            }
        };
        let owner = &self.inner.cycle_owner;
        *owner
            .lock()
            .map_err(|e| TaskError::LockPoisoned(format!("cycle owner: {}", e)))? = Some(thread::current().id());
        Ok(CycleGuard { _lock: lock, owner })
    }

    /// Whether the calling thread is inside one of this manager's cycles,
    /// i.e. it is running a task body.
    pub(super) fn in_cycle_on_current_thread(&self) -> bool {
        self.inner
            .cycle_owner
            .lock()
            .map(|owner| *owner == Some(thread::current().id()))
            .unwrap_or(false)
    }

    /// Run a registered task outside the loop and apply what it reports.
    pub(crate) fn run_task(&self, task: &Task) -> Result<RunOutcome, TaskError> {
        let _cycle = self.enter_cycle()?;
        let started = Instant::now();
        let outcome = task.execute_unguarded()?;
        self.record_outcome(task.name(), outcome, started.elapsed());

        let registered = {
            let mut pools = self.pools()?;
            if outcome == RunOutcome::Ran(Disposition::Done) {
                pools.remove(task.name());
                false
            } else {
                pools.contains(task.name())
            }
        };
        if !registered {
            self.destroy(task);
        } else if outcome == RunOutcome::Ran(Disposition::Again) {
            task.arm_immediate_retry();
        }
        Ok(outcome)
    }

    /// Execute a task body between cycles without touching the pools.
    pub(crate) fn execute_task(&self, task: &Task) -> Result<RunOutcome, TaskError> {
        let _cycle = self.enter_cycle()?;
        task.execute_unguarded()
    }

    /// Promote every waiting task, then run each running task once.
    /// Callers hold the cycle guard.
    fn run_cycle(&self) -> Result<CycleReport, TaskError> {
        let mut report = CycleReport::default();
        let snapshot: Vec<TaskHandle> = {
            let mut pools = self.pools()?;
            report.promoted = pools.promote();
            pools.running.values().cloned().collect()
        };

        let mut reported = HashMap::with_capacity(snapshot.len());
        for task in snapshot {
            // Unregistered by a body that ran earlier in this cycle.
            if !task.is_active() {
                continue;
            }

            let started = Instant::now();
            let outcome = match task.run_scheduled() {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(task = %task.name(), error = %e, "Skipping task this cycle");
                    continue;
                }
            };
            self.record_outcome(task.name(), outcome, started.elapsed());

            match outcome {
                RunOutcome::Throttled => report.throttled += 1,
                RunOutcome::Ran(disposition) => {
                    report.executed += 1;
                    reported.insert(task.name().to_string(), (task, disposition));
                }
            }
        }

        self.settle(reported, &mut report)?;

        self.record(|m| {
            m.record_cycle();
            report.cycle = m.cycles;
        });
        debug!(
            cycle = report.cycle,
            promoted = report.promoted,
            executed = report.executed,
            throttled = report.throttled,
            removed = report.removed,
            "Cycle complete"
        );
        Ok(report)
    }

    /// Apply every disposition reported this cycle in a single ordered pass
    /// over the running pool.
    fn settle(
        &self,
        mut reported: HashMap<String, (TaskHandle, Disposition)>,
        report: &mut CycleReport,
    ) -> Result<(), TaskError> {
        let mut finished = Vec::new();
        let mut retried = Vec::new();
        {
            let mut guard = self.pools()?;
            let pools = &mut *guard;
            for (name, task) in std::mem::take(&mut pools.running) {
                match reported.remove(&name).map(|(_, disposition)| disposition) {
                    Some(Disposition::Done) => {
                        report.removed += 1;
                        finished.push(task);
                    }
                    Some(Disposition::Continue) => {
                        report.requeued += 1;
                        pools.waiting.insert(name, task);
                    }
                    Some(Disposition::Again) => {
                        report.retried += 1;
                        retried.push(task.clone());
                        pools.running.insert(name, task);
                    }
                    None => {
                        pools.running.insert(name, task);
                    }
                }
            }
        }

        // Anything left was unregistered while its body was executing.
        finished.extend(reported.into_values().map(|(task, _)| task));
        for task in &finished {
            self.destroy(task);
        }
        for task in &retried {
            task.arm_immediate_retry();
        }
        Ok(())
    }

    fn record_outcome(&self, name: &str, outcome: RunOutcome, elapsed: Duration) {
        match outcome {
            RunOutcome::Throttled => self.record(|m| m.record_throttled(name)),
            RunOutcome::Ran(disposition) => self.record(|m| m.record_execution(name, elapsed, disposition)),
        }
    }

    fn destroy(&self, task: &Task) {
        task.destroy();
        self.record(|m| m.forget(task.name()));
    }

    /// Empty both pools, destroying every task. Returns how many were removed.
    fn teardown(&self) -> Result<usize, TaskError> {
        let drained: Vec<TaskHandle> = {
            let mut guard = self.pools()?;
            let pools = &mut *guard;
            pools
                .waiting
                .drain(..)
                .chain(pools.running.drain(..))
                .map(|(_, task)| task)
                .collect()
        };

        for task in &drained {
            self.destroy(task);
        }

        if !drained.is_empty() {
            info!(count = drained.len(), "Tore down tasks");
        }
        Ok(drained.len())
    }
}
