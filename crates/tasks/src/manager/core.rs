use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::ThreadId;
use std::time::Duration;

use indexmap::IndexMap;
use tracing::{debug, info};

use crate::metrics::ManagerMetrics;
use crate::task::{Task, TaskBody, TaskContext, TaskError, TaskHandle};
use crate::types::{Disposition, ManagerConfig};

/// The two disjoint task pools, keyed by task name in insertion order.
#[derive(Default)]
pub(crate) struct Pools {
    /// Tasks eligible to run in the next cycle.
    pub(crate) waiting: IndexMap<String, TaskHandle>,
    /// Tasks being executed in the current cycle.
    pub(crate) running: IndexMap<String, TaskHandle>,
}

impl Pools {
    pub(crate) fn contains(&self, name: &str) -> bool {
        self.waiting.contains_key(name) || self.running.contains_key(name)
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<TaskHandle> {
        self.waiting
            .shift_remove(name)
            .or_else(|| self.running.shift_remove(name))
    }

    /// Move every waiting task to the back of the running pool.
    pub(crate) fn promote(&mut self) -> usize {
        let promoted = self.waiting.len();
        self.running.extend(self.waiting.drain(..));
        promoted
    }
}

pub(crate) struct ManagerInner {
    pub(super) config: ManagerConfig,
    /// Single exclusion boundary for every pool mutation.
    pub(super) pools: Mutex<Pools>,
    /// Held for the whole of a cycle; cycles never overlap.
    pub(super) cycle_lock: Mutex<()>,
    /// Thread currently holding `cycle_lock`.
    pub(super) cycle_owner: Mutex<Option<ThreadId>>,
    pub(super) next_id: AtomicU64,
    pub(super) shutdown: AtomicBool,
    pub(super) metrics: RwLock<ManagerMetrics>,
}

/// Cooperative task manager. Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct TaskManager {
    pub(super) inner: Arc<ManagerInner>,
}

impl TaskManager {
    /// Create a new manager with empty pools.
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                pools: Mutex::new(Pools::default()),
                cycle_lock: Mutex::new(()),
                cycle_owner: Mutex::new(None),
                next_id: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
                metrics: RwLock::new(ManagerMetrics::default()),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ManagerInner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Ids start at 1 and are never reused.
    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(super) fn pools(&self) -> Result<MutexGuard<'_, Pools>, TaskError> {
        self.inner
            .pools
            .lock()
            .map_err(|e| TaskError::LockPoisoned(format!("task pools: {}", e)))
    }

    pub(super) fn record(&self, f: impl FnOnce(&mut ManagerMetrics)) {
        if let Ok(mut metrics) = self.inner.metrics.write() {
            f(&mut *metrics);
        }
    }

    /// Register a closure to run every cycle, at most once per `delay`.
    pub fn register<F>(&self, delay: Duration, body: F) -> Result<TaskHandle, TaskError>
    where
        F: FnMut(&TaskContext<'_>) -> Disposition + Send + 'static,
    {
        self.register_boxed(delay, Box::new(body))
    }

    /// Register a closure together with arguments it receives on every run.
    ///
    /// The arguments live as long as the task and are dropped when it is destroyed.
    pub fn register_with_args<A, F>(&self, delay: Duration, mut args: A, mut body: F) -> Result<TaskHandle, TaskError>
    where
        A: Send + 'static,
        F: FnMut(&TaskContext<'_>, &mut A) -> Disposition + Send + 'static,
    {
        self.register(delay, move |ctx: &TaskContext<'_>| body(ctx, &mut args))
    }

    /// Register any [`TaskBody`] implementation.
    pub fn register_task_body<B>(&self, delay: Duration, body: B) -> Result<TaskHandle, TaskError>
    where
        B: TaskBody + 'static,
    {
        self.register_boxed(delay, Box::new(body))
    }

    /// Register a closure with no delay.
    pub fn add<F>(&self, body: F) -> Result<TaskHandle, TaskError>
    where
        F: FnMut(&TaskContext<'_>) -> Disposition + Send + 'static,
    {
        self.register(Duration::ZERO, body)
    }

    /// Fails with `ShutDown` once shutdown has been requested.
    fn register_boxed(&self, delay: Duration, body: Box<dyn TaskBody>) -> Result<TaskHandle, TaskError> {
        // Checked under the pools lock so teardown cannot miss a late task.
        let task = {
            let mut pools = self.pools()?;
            if self.is_shutdown() {
                return Err(TaskError::ShutDown);
            }
            let task = TaskHandle::new(Task::new(
                self.next_id(),
                delay,
                body,
                self.inner.config.first_run,
                Arc::downgrade(&self.inner),
            ));
            self.activate(&mut pools, &task)?;
            task
        };
        self.record(|m| m.record_registration());

        info!(task = %task.name(), id = task.id(), delay_ms = delay.as_millis() as u64, "Registered task");
        Ok(task)
    }

    /// Put a task into the waiting pool and mark it active.
    pub(super) fn activate(&self, pools: &mut Pools, task: &TaskHandle) -> Result<(), TaskError> {
        if pools.contains(task.name()) {
            return Err(TaskError::DuplicateTask(task.name().to_string()));
        }
        task.set_active(true);
        pools.waiting.insert(task.name().to_string(), task.clone());
        Ok(())
    }

    /// Take a task out of whichever pool holds it and mark it inactive.
    pub(super) fn deactivate(&self, pools: &mut Pools, task: &Task) -> Result<(), TaskError> {
        if pools.remove(task.name()).is_none() {
            return Err(TaskError::UnknownTask(task.name().to_string()));
        }
        task.set_active(false);
        Ok(())
    }

    /// Remove a task and destroy it.
    ///
    /// A task may unregister itself (or be unregistered from another thread)
    /// while its body runs; it is destroyed as soon as the body returns.
    pub fn unregister(&self, task: &TaskHandle) -> Result<(), TaskError> {
        {
            let mut pools = self.pools()?;
            self.deactivate(&mut pools, task)?;
        }

        if task.try_destroy() {
            self.record(|m| m.forget(task.name()));
        } else {
            debug!(task = %task.name(), "Task is executing, teardown deferred until it returns");
        }

        info!(task = %task.name(), "Unregistered task");
        Ok(())
    }

    /// Wrap `body` so that each call registers it as a new zero-delay task
    /// with the given arguments.
    pub fn deferred<A, F>(&self, body: F) -> Deferred<A, F>
    where
        A: Send + 'static,
        F: FnMut(&TaskContext<'_>, &mut A) -> Disposition + Clone + Send + 'static,
    {
        Deferred {
            manager: self.clone(),
            body,
            _args: PhantomData,
        }
    }

    /// Ask the driver to stop. Takes effect at the next cycle boundary.
    pub fn request_shutdown(&self) {
        if !self.inner.shutdown.swap(true, Ordering::SeqCst) {
            info!("Task manager shutdown requested");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Look up a live task by name.
    pub fn get(&self, name: &str) -> Option<TaskHandle> {
        let pools = self.pools().ok()?;
        pools
            .waiting
            .get(name)
            .or_else(|| pools.running.get(name))
            .cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.pools().map(|p| p.contains(name)).unwrap_or(false)
    }

    pub fn is_waiting(&self, name: &str) -> bool {
        self.pools().map(|p| p.waiting.contains_key(name)).unwrap_or(false)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.pools().map(|p| p.running.contains_key(name)).unwrap_or(false)
    }

    /// Number of live tasks across both pools.
    pub fn len(&self) -> usize {
        self.pools()
            .map(|p| p.waiting.len() + p.running.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a snapshot of the current manager metrics.
    pub fn metrics(&self) -> ManagerMetrics {
        let mut snapshot = self
            .inner
            .metrics
            .read()
            .map(|m| m.clone())
            .unwrap_or_default();
        if let Ok(pools) = self.pools() {
            snapshot.waiting = pools.waiting.len();
            snapshot.running = pools.running.len();
        }
        snapshot
    }
}

/// A body that becomes a fresh one-shot task each time it is called.
/// Built by [`TaskManager::deferred`].
pub struct Deferred<A, F> {
    manager: TaskManager,
    body: F,
    _args: PhantomData<fn(A)>,
}

impl<A, F> Deferred<A, F>
where
    A: Send + 'static,
    F: FnMut(&TaskContext<'_>, &mut A) -> Disposition + Clone + Send + 'static,
{
    /// Register a copy of the body with `args`; it runs from the next cycle on.
    pub fn call(&self, args: A) -> Result<TaskHandle, TaskError> {
        self.manager
            .register_with_args(Duration::ZERO, args, self.body.clone())
    }
}
