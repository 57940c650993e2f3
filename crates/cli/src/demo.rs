//! Demo collaborators registered with the task manager.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use frameloop_tasks::{Disposition, TaskBody, TaskContext, TaskHandle, TaskManager};
use tracing::info;

use crate::config::CliConfig;

/// Per-frame update, registered the way an object manager hooks into the
/// loop: zero delay, every cycle, forever.
struct FrameCounter {
    frames: Arc<AtomicU64>,
}

impl TaskBody for FrameCounter {
    fn execute(&mut self, _ctx: &TaskContext<'_>) -> Disposition {
        self.frames.fetch_add(1, Ordering::Relaxed);
        Disposition::Continue
    }
}

/// When to stop the loop on our own.
#[derive(Debug, Clone, Copy)]
struct RunLimit {
    started: Instant,
    max_cycles: Option<u64>,
    max_duration: Option<Duration>,
}

impl RunLimit {
    fn reached(&self, cycles: u64) -> bool {
        self.max_cycles.is_some_and(|max| cycles >= max)
            || self.max_duration.is_some_and(|max| self.started.elapsed() >= max)
    }
}

pub struct Demo {
    frames: Arc<AtomicU64>,
    pub frame_task: TaskHandle,
    pub heartbeat_task: TaskHandle,
}

impl Demo {
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

/// Register the demo tasks on `manager`.
pub fn install(manager: &TaskManager, config: &CliConfig) -> Result<Demo> {
    let frames = Arc::new(AtomicU64::new(0));

    let frame_task = manager.register_task_body(
        Duration::ZERO,
        FrameCounter {
            frames: Arc::clone(&frames),
        },
    )?;

    let heartbeat_task = manager.register_with_args(
        config.heartbeat()?,
        Arc::clone(&frames),
        |ctx: &TaskContext<'_>, frames: &mut Arc<AtomicU64>| {
            info!(
                task = %ctx.name(),
                beat = ctx.runs(),
                frames = frames.load(Ordering::Relaxed),
                "Heartbeat"
            );
            Disposition::Continue
        },
    )?;

    let limit = RunLimit {
        started: Instant::now(),
        max_cycles: config.max_cycles,
        max_duration: config.max_duration()?,
    };
    if limit.max_cycles.is_some() || limit.max_duration.is_some() {
        manager.register_with_args(Duration::ZERO, limit, |ctx: &TaskContext<'_>, limit: &mut RunLimit| {
            if !limit.reached(ctx.runs()) {
                return Disposition::Continue;
            }
            info!(cycles = ctx.runs(), "Run limit reached");
            if let Some(manager) = ctx.manager() {
                manager.request_shutdown();
            }
            Disposition::Done
        })?;
    }

    let announce = manager.deferred(|ctx: &TaskContext<'_>, message: &mut String| {
        info!(task = %ctx.name(), "{}", message);
        Disposition::Done
    });
    announce.call(format!("{} tasks registered, loop is live", manager.len() + 1))?;

    Ok(Demo {
        frames,
        frame_task,
        heartbeat_task,
    })
}

#[cfg(test)]
mod tests {
    use frameloop_tasks::{ManagerConfig, Tick};

    use super::*;

    #[test]
    fn cycle_limit_stops_the_loop() {
        let manager = TaskManager::new(ManagerConfig::default());
        let config = CliConfig {
            max_cycles: Some(3),
            ..CliConfig::default()
        };
        let demo = install(&manager, &config).unwrap();
        assert_eq!(manager.len(), 4);

        let cycles = manager.run_blocking().unwrap();
        assert_eq!(cycles, 3);
        assert_eq!(demo.frames(), 3);
        assert_eq!(demo.heartbeat_task.runs(), 1);
        assert!(manager.is_empty());
        assert!(demo.frame_task.is_destroyed());
    }

    #[test]
    fn without_limit_tasks_keep_running() {
        let manager = TaskManager::new(ManagerConfig::default());
        let demo = install(&manager, &CliConfig::default()).unwrap();

        for _ in 0..5 {
            assert!(matches!(manager.tick().unwrap(), Tick::Ran(_)));
        }
        assert_eq!(demo.frames(), 5);
        // Frame counter and heartbeat remain; the announcement was one-shot.
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn run_limit_checks_cycles_and_time() {
        let limit = RunLimit {
            started: Instant::now(),
            max_cycles: Some(2),
            max_duration: None,
        };
        assert!(!limit.reached(1));
        assert!(limit.reached(2));

        let timed = RunLimit {
            started: Instant::now() - Duration::from_secs(5),
            max_cycles: None,
            max_duration: Some(Duration::from_secs(1)),
        };
        assert!(timed.reached(0));
    }
}
