use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::Disposition;

/// Counts of dispositions reported by task bodies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispositionCounts {
    pub done: u64,
    pub cont: u64,
    pub again: u64,
}

/// Task manager operational metrics.
///
/// Per-task entries are dropped once a task is destroyed; the totals are kept
/// for the manager's lifetime.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ManagerMetrics {
    /// Cycles completed.
    pub cycles: u64,
    /// Tasks ever registered.
    pub tasks_registered: u64,
    /// Body executions across all tasks.
    pub executions_total: u64,
    /// Delay checks that held a task back, across all tasks.
    pub throttled_total: u64,
    /// Dispositions reported so far.
    pub dispositions: DispositionCounts,
    /// Executions by live task name.
    pub tasks_executed: HashMap<String, u64>,
    /// Throttled checks by live task name.
    pub tasks_throttled: HashMap<String, u64>,
    /// Average execution time by live task name.
    pub avg_task_duration: HashMap<String, Duration>,
    /// Last execution time by live task name.
    pub last_run: HashMap<String, DateTime<Utc>>,
    /// Tasks waiting for the next cycle (filled in on snapshot).
    pub waiting: usize,
    /// Tasks in the running pool (filled in on snapshot).
    pub running: usize,
}

impl ManagerMetrics {
    /// Record a body execution and the disposition it reported.
    pub fn record_execution(&mut self, task_name: &str, duration: Duration, disposition: Disposition) {
        self.executions_total += 1;
        match disposition {
            Disposition::Done => self.dispositions.done += 1,
            Disposition::Continue => self.dispositions.cont += 1,
            Disposition::Again => self.dispositions.again += 1,
        }

        let count = {
            let count = self.tasks_executed.entry(task_name.to_string()).or_default();
            *count += 1;
            *count
        };
        self.last_run.insert(task_name.to_string(), Utc::now());

        let prev_avg = self
            .avg_task_duration
            .get(task_name)
            .copied()
            .unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };

        self.avg_task_duration.insert(task_name.to_string(), new_avg);
    }

    pub fn record_throttled(&mut self, task_name: &str) {
        self.throttled_total += 1;
        *self.tasks_throttled.entry(task_name.to_string()).or_default() += 1;
    }

    pub fn record_cycle(&mut self) {
        self.cycles += 1;
    }

    pub fn record_registration(&mut self) {
        self.tasks_registered += 1;
    }

    /// Drop per-task entries for a destroyed task.
    pub fn forget(&mut self, task_name: &str) {
        self.tasks_executed.remove(task_name);
        self.tasks_throttled.remove(task_name);
        self.avg_task_duration.remove(task_name);
        self.last_run.remove(task_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_single_execution() {
        let mut m = ManagerMetrics::default();
        m.record_execution("Task-1", Duration::from_millis(100), Disposition::Continue);

        assert_eq!(m.tasks_executed["Task-1"], 1);
        assert!(m.last_run.contains_key("Task-1"));
        assert_eq!(m.avg_task_duration["Task-1"], Duration::from_millis(100));
        assert_eq!(m.dispositions.cont, 1);
        assert_eq!(m.executions_total, 1);
    }

    #[test]
    fn record_multiple_executions_averages() {
        let mut m = ManagerMetrics::default();
        m.record_execution("Task-1", Duration::from_millis(100), Disposition::Again);
        m.record_execution("Task-1", Duration::from_millis(200), Disposition::Done);

        assert_eq!(m.tasks_executed["Task-1"], 2);
        // Average of 100ms and 200ms = 150ms
        let avg = m.avg_task_duration["Task-1"].as_millis();
        assert!((140..=160).contains(&avg), "expected ~150ms, got {}ms", avg);
        assert_eq!(m.dispositions, DispositionCounts { done: 1, cont: 0, again: 1 });
    }

    #[test]
    fn forget_keeps_totals() {
        let mut m = ManagerMetrics::default();
        m.record_execution("Task-1", Duration::from_millis(5), Disposition::Done);
        m.record_throttled("Task-1");
        m.forget("Task-1");

        assert!(m.tasks_executed.is_empty());
        assert!(m.tasks_throttled.is_empty());
        assert!(m.last_run.is_empty());
        assert_eq!(m.executions_total, 1);
        assert_eq!(m.throttled_total, 1);
    }

    #[test]
    fn default_metrics() {
        let m = ManagerMetrics::default();
        assert_eq!(m.cycles, 0);
        assert_eq!(m.waiting, 0);
        assert_eq!(m.running, 0);
        assert!(m.tasks_executed.is_empty());
    }
}
