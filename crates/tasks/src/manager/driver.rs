use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::task::TaskError;
use crate::types::Tick;

use super::TaskManager;

/// Handle to a manager loop running on its own thread.
pub struct LoopHandle {
    manager: TaskManager,
    join: JoinHandle<Result<u64, TaskError>>,
}

impl LoopHandle {
    pub fn manager(&self) -> &TaskManager {
        &self.manager
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the loop to stop. Returns the number of cycles it ran.
    pub fn join(self) -> Result<u64, TaskError> {
        self.join.join().map_err(|_| TaskError::LoopPanicked)?
    }

    /// Request shutdown and wait for teardown to finish.
    pub fn shutdown_and_join(self) -> Result<u64, TaskError> {
        self.manager.request_shutdown();
        self.join()
    }
}

impl TaskManager {
    /// Start the cycle loop.
    ///
    /// With `threaded` the loop runs on a background thread and a handle is
    /// returned straight away. Otherwise this blocks until shutdown and the
    /// pools have been torn down.
    pub fn run_loop(&self, threaded: bool) -> Result<Option<LoopHandle>, TaskError> {
        if threaded {
            self.spawn().map(Some)
        } else {
            self.run_blocking().map(|_| None)
        }
    }

    /// Run the loop on a dedicated thread.
    pub fn spawn(&self) -> Result<LoopHandle, TaskError> {
        let manager = self.clone();
        let join = thread::Builder::new()
            .name(self.inner.config.thread_name.clone())
            .spawn(move || manager.mainloop())?;

        Ok(LoopHandle {
            manager: self.clone(),
            join,
        })
    }

    /// Run the loop on the calling thread. Blocks until shutdown is requested.
    ///
    /// Fails with `CycleInProgress` when called from one of this manager's
    /// own task bodies.
    pub fn run_blocking(&self) -> Result<u64, TaskError> {
        self.mainloop()
    }

    fn mainloop(&self) -> Result<u64, TaskError> {
        if self.in_cycle_on_current_thread() {
            return Err(TaskError::CycleInProgress);
        }

        let idle = self.inner.config.idle_sleep();
        info!(
            tasks = self.len(),
            idle_sleep_ms = self.inner.config.idle_sleep_ms,
            "Task loop starting"
        );

        let mut cycles = 0u64;
        loop {
            match self.tick() {
                Ok(Tick::Ran(_)) => cycles += 1,
                Ok(Tick::Stopped) => break,
                Err(TaskError::CycleInProgress) => {
                    if self.is_shutdown() {
                        debug!("Another driver owns the cycle and will tear down");
                        break;
                    }
                    debug!("Another driver is mid-cycle, yielding");
                    thread::yield_now();
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Task loop failed, shutting down");
                    self.request_shutdown();
                    // Best effort: the pools may be the thing that failed.
                    if let Err(teardown) = self.tick() {
                        warn!(error = %teardown, "Teardown after loop failure did not complete");
                    }
                    return Err(e);
                }
            }

            if let Some(idle) = idle {
                thread::sleep(idle);
            }
        }

        info!(cycles, "Task loop stopped");
        Ok(cycles)
    }
}
