use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError, Weak};
use std::time::{Duration, Instant};

use crate::manager::{ManagerInner, TaskManager};
use crate::types::{Disposition, FirstRun, RetryState, RunOutcome};

/// Error type for task and task manager operations.
///
/// Every variant is a contract violation reported at the call that made it.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Invalid task {name}: {reason}")]
    InvalidTask { name: String, reason: &'static str },
    #[error("Task {0} is already registered")]
    DuplicateTask(String),
    #[error("Task {0} is not registered")]
    UnknownTask(String),
    #[error("A cycle is already in progress on this manager")]
    CycleInProgress,
    #[error("Task manager is shut down")]
    ShutDown,
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
    #[error("Failed to spawn task loop: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Task loop thread panicked")]
    LoopPanicked,
}

/// A unit of work the manager invokes once per cycle.
///
/// Closures of the form `FnMut(&TaskContext<'_>) -> Disposition` implement
/// this automatically.
pub trait TaskBody: Send {
    fn execute(&mut self, ctx: &TaskContext<'_>) -> Disposition;
}

impl<F> TaskBody for F
where
    F: FnMut(&TaskContext<'_>) -> Disposition + Send,
{
    fn execute(&mut self, ctx: &TaskContext<'_>) -> Disposition {
        self(ctx)
    }
}

/// View of the running task handed to its body.
pub struct TaskContext<'a> {
    task: &'a Task,
    previous_run: Option<Instant>,
    runs: u64,
    manager: Option<TaskManager>,
}

impl TaskContext<'_> {
    pub fn id(&self) -> u64 {
        self.task.id
    }

    pub fn name(&self) -> &str {
        &self.task.name
    }

    pub fn delay(&self) -> Duration {
        self.task.delay
    }

    /// Number of times the body has run, including this one.
    pub fn runs(&self) -> u64 {
        self.runs
    }

    /// Time since the previous actual execution. `None` on the first run.
    pub fn since_last_run(&self) -> Option<Duration> {
        self.previous_run.map(|at| at.elapsed())
    }

    /// The manager that owns this task, while it is still alive.
    pub fn manager(&self) -> Option<&TaskManager> {
        self.manager.as_ref()
    }
}

struct TaskState {
    body: Option<Box<dyn TaskBody>>,
    timestamp: Option<Instant>,
    retry: RetryState,
}

/// A schedulable unit. Only ever created by a [`TaskManager`].
pub struct Task {
    id: u64,
    name: String,
    delay: Duration,
    active: AtomicBool,
    runs: AtomicU64,
    state: Mutex<TaskState>,
    manager: Weak<ManagerInner>,
}

impl Task {
    pub(crate) fn new(
        id: u64,
        delay: Duration,
        body: Box<dyn TaskBody>,
        first_run: FirstRun,
        manager: Weak<ManagerInner>,
    ) -> Self {
        let timestamp = match first_run {
            FirstRun::Immediate => None,
            FirstRun::AfterDelay => Some(Instant::now()),
        };
        Self {
            id,
            name: format!("Task-{}", id),
            delay,
            active: AtomicBool::new(false),
            runs: AtomicU64::new(0),
            state: Mutex::new(TaskState {
                body: Some(body),
                timestamp,
                retry: RetryState::Normal,
            }),
            manager,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Whether the task currently sits in the waiting or running pool.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Number of times the body has actually executed.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Delay gate for the next run. `None` while the body is executing.
    pub fn retry_state(&self) -> Option<RetryState> {
        self.peek_state(|state| state.retry)
    }

    /// Whether the task has been torn down and can no longer execute.
    /// Reports `false` while the body is executing.
    pub fn is_destroyed(&self) -> bool {
        self.peek_state(|state| state.body.is_none()).unwrap_or(false)
    }

    /// Run the task on behalf of a caller. Fails unless the task is registered.
    ///
    /// Serialised with the manager's cycles, and the reported disposition is
    /// applied the same way a cycle would apply it.
    pub fn run(&self) -> Result<RunOutcome, TaskError> {
        self.ensure_active()?;
        match self.manager.upgrade() {
            Some(inner) => TaskManager::from_inner(inner).run_task(self),
            None => self.execute_unguarded(),
        }
    }

    /// Execute the body, honouring the delay gate. The disposition is only
    /// returned, never applied.
    ///
    /// Fails with `CycleInProgress` while the owning manager is mid-cycle, so
    /// no two tasks of one manager ever execute at once.
    pub fn execute(&self) -> Result<RunOutcome, TaskError> {
        match self.manager.upgrade() {
            Some(inner) => TaskManager::from_inner(inner).execute_task(self),
            None => self.execute_unguarded(),
        }
    }

    /// Fails instead of blocking if the task is executing elsewhere, so a
    /// body can never re-enter itself.
    pub(crate) fn execute_unguarded(&self) -> Result<RunOutcome, TaskError> {
        let mut state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::WouldBlock) => {
                return Err(self.invalid("already executing"));
            }
            Err(TryLockError::Poisoned(e)) => {
                return Err(TaskError::LockPoisoned(format!("task {}: {}", self.name, e)));
            }
        };
        self.execute_locked(&mut state)
    }

    /// Scheduler-side run: waits for the state lock instead of failing.
    pub(crate) fn run_scheduled(&self) -> Result<RunOutcome, TaskError> {
        self.ensure_active()?;
        let mut state = self
            .state
            .lock()
            .map_err(|e| TaskError::LockPoisoned(format!("task {}: {}", self.name, e)))?;
        self.execute_locked(&mut state)
    }

    fn execute_locked(&self, state: &mut TaskState) -> Result<RunOutcome, TaskError> {
        let Some(body) = state.body.as_mut() else {
            return Err(self.invalid("no callable bound"));
        };

        let now = Instant::now();
        if state.retry == RetryState::Normal {
            if let Some(last) = state.timestamp {
                if now.duration_since(last) < self.delay {
                    return Ok(RunOutcome::Throttled);
                }
            }
        }

        let previous_run = state.timestamp.replace(now);
        let runs = self.runs.fetch_add(1, Ordering::Relaxed) + 1;
        let ctx = TaskContext {
            task: self,
            previous_run,
            runs,
            manager: self.manager.upgrade().map(TaskManager::from_inner),
        };
        let disposition = body.execute(&ctx);

        // The bypass is spent as soon as the body has been called.
        state.retry = RetryState::Normal;
        Ok(RunOutcome::Ran(disposition))
    }

    pub(crate) fn arm_immediate_retry(&self) {
        self.lock_state().retry = RetryState::ImmediateRetryPending;
    }

    /// Clear the body, its bound arguments and timing state.
    pub(crate) fn destroy(&self) {
        self.set_active(false);
        Self::clear(&mut self.lock_state());
    }

    /// Like [`Task::destroy`], but gives up if the body is mid-execution.
    /// Returns `false` when teardown has to wait for the body to return.
    pub(crate) fn try_destroy(&self) -> bool {
        self.set_active(false);
        match self.state.try_lock() {
            Ok(mut state) => {
                Self::clear(&mut state);
                true
            }
            Err(TryLockError::Poisoned(e)) => {
                Self::clear(&mut e.into_inner());
                true
            }
            Err(TryLockError::WouldBlock) => false,
        }
    }

    fn clear(state: &mut TaskState) {
        state.body = None;
        state.timestamp = None;
        state.retry = RetryState::Normal;
    }

    fn ensure_active(&self) -> Result<(), TaskError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(self.invalid("not registered with a manager"))
        }
    }

    fn invalid(&self, reason: &'static str) -> TaskError {
        TaskError::InvalidTask {
            name: self.name.clone(),
            reason,
        }
    }

    // Read-only access survives a panicked body.
    fn lock_state(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn peek_state<T>(&self, f: impl FnOnce(&TaskState) -> T) -> Option<T> {
        match self.state.try_lock() {
            Ok(state) => Some(f(&*state)),
            Err(TryLockError::Poisoned(e)) => Some(f(&*e.into_inner())),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("delay", &self.delay)
            .field("active", &self.is_active())
            .field("runs", &self.runs())
            .finish()
    }
}

/// Shared reference to a registered task, returned by registration and used
/// to unregister it later.
#[derive(Clone)]
pub struct TaskHandle(Arc<Task>);

impl TaskHandle {
    pub(crate) fn new(task: Task) -> Self {
        Self(Arc::new(task))
    }
}

impl Deref for TaskHandle {
    type Target = Task;

    fn deref(&self) -> &Task {
        &self.0
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TaskHandle {}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use super::*;

    fn counting_task(delay: Duration, first_run: FirstRun) -> (TaskHandle, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let body = move |_: &TaskContext<'_>| {
            seen.fetch_add(1, Ordering::SeqCst);
            Disposition::Continue
        };
        let task = TaskHandle::new(Task::new(7, delay, Box::new(body), first_run, Weak::new()));
        (task, count)
    }

    #[test]
    fn name_derives_from_id() {
        let (task, _) = counting_task(Duration::ZERO, FirstRun::Immediate);
        assert_eq!(task.id(), 7);
        assert_eq!(task.name(), "Task-7");
    }

    #[test]
    fn run_requires_activation() {
        let (task, count) = counting_task(Duration::ZERO, FirstRun::Immediate);
        let err = task.run().unwrap_err();
        assert!(matches!(err, TaskError::InvalidTask { .. }));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        task.set_active(true);
        assert_eq!(task.run().unwrap(), RunOutcome::Ran(Disposition::Continue));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn execute_after_destroy_fails() {
        let (task, _) = counting_task(Duration::ZERO, FirstRun::Immediate);
        task.destroy();
        assert!(task.is_destroyed());
        let err = task.execute().unwrap_err();
        assert!(matches!(err, TaskError::InvalidTask { reason: "no callable bound", .. }));
    }

    #[test]
    fn delay_throttles_without_touching_timestamp() {
        let (task, count) = counting_task(Duration::from_millis(150), FirstRun::Immediate);
        assert_eq!(task.execute().unwrap(), RunOutcome::Ran(Disposition::Continue));

        thread::sleep(Duration::from_millis(100));
        assert_eq!(task.execute().unwrap(), RunOutcome::Throttled);

        // 160ms since the real run, but only 60ms since the throttled check.
        thread::sleep(Duration::from_millis(60));
        assert_eq!(task.execute().unwrap(), RunOutcome::Ran(Disposition::Continue));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(task.runs(), 2);
    }

    #[test]
    fn after_delay_first_run_waits() {
        let (task, count) = counting_task(Duration::from_secs(60), FirstRun::AfterDelay);
        assert_eq!(task.execute().unwrap(), RunOutcome::Throttled);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn immediate_retry_bypasses_delay_once() {
        let (task, count) = counting_task(Duration::from_secs(60), FirstRun::Immediate);
        assert_eq!(task.execute().unwrap(), RunOutcome::Ran(Disposition::Continue));

        task.arm_immediate_retry();
        assert_eq!(task.retry_state(), Some(RetryState::ImmediateRetryPending));
        assert_eq!(task.execute().unwrap(), RunOutcome::Ran(Disposition::Continue));
        assert_eq!(task.retry_state(), Some(RetryState::Normal));

        assert_eq!(task.execute().unwrap(), RunOutcome::Throttled);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn context_reports_runs_and_previous_run() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let body = move |ctx: &TaskContext<'_>| {
            log.lock().unwrap().push((ctx.runs(), ctx.since_last_run().is_some(), ctx.name().to_string()));
            Disposition::Continue
        };
        let task = Task::new(3, Duration::ZERO, Box::new(body), FirstRun::Immediate, Weak::new());
        task.execute().unwrap();
        task.execute().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], (1, false, "Task-3".to_string()));
        assert_eq!(seen[1], (2, true, "Task-3".to_string()));
    }

    #[test]
    fn try_destroy_defers_while_executing() {
        let slot: Arc<Mutex<Option<TaskHandle>>> = Arc::new(Mutex::new(None));
        let inner_slot = Arc::clone(&slot);
        let destroyed_inside = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&destroyed_inside);
        let body = move |_: &TaskContext<'_>| {
            let me = inner_slot.lock().unwrap().clone().unwrap();
            flag.store(me.try_destroy(), Ordering::SeqCst);
            Disposition::Continue
        };
        let task = TaskHandle::new(Task::new(1, Duration::ZERO, Box::new(body), FirstRun::Immediate, Weak::new()));
        *slot.lock().unwrap() = Some(task.clone());

        task.execute().unwrap();
        assert!(!destroyed_inside.load(Ordering::SeqCst));
        assert!(!task.is_active());
        assert!(!task.is_destroyed());

        slot.lock().unwrap().take();
        assert!(task.try_destroy());
        assert!(task.is_destroyed());
    }

    #[test]
    fn state_accessors_do_not_block_inside_body() {
        let slot: Arc<Mutex<Option<TaskHandle>>> = Arc::new(Mutex::new(None));
        let inner_slot = Arc::clone(&slot);
        let seen = Arc::new(Mutex::new(None));
        let out = Arc::clone(&seen);
        let body = move |_: &TaskContext<'_>| {
            let me = inner_slot.lock().unwrap().clone().unwrap();
            *out.lock().unwrap() = Some((me.is_destroyed(), me.retry_state()));
            Disposition::Continue
        };
        let task = TaskHandle::new(Task::new(2, Duration::ZERO, Box::new(body), FirstRun::Immediate, Weak::new()));
        *slot.lock().unwrap() = Some(task.clone());

        task.execute().unwrap();
        assert_eq!(*seen.lock().unwrap(), Some((false, None)));
        assert_eq!(task.retry_state(), Some(RetryState::Normal));
        slot.lock().unwrap().take();
    }
}
