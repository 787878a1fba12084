//! Task reporting for long-running operations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;

pub type TaskId = u64;

/// Sink for progress of long-running operations.
pub trait TaskReporter: Send + Sync {
    fn start(&self, name: &str, description: &str, cancellable: bool) -> TaskId;
    fn update(&self, id: TaskId, percent: f64, message: &str);
    fn finish(&self, id: TaskId, failed: bool, message: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPhase {
    Running,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub id: TaskId,
    pub name: String,
    pub description: String,
    pub cancellable: bool,
    pub percent: f64,
    pub message: String,
    pub phase: TaskPhase,
    #[serde(skip)]
    pub started: Instant,
}

/// In-memory `TaskReporter`. Every call is also logged.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<DashMap<TaskId, TaskStatus>>,
    next_id: Arc<AtomicU64>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: TaskId) -> Option<TaskStatus> {
        self.tasks.get(&id).map(|t| t.value().clone())
    }

    pub fn tasks(&self) -> Vec<TaskStatus> {
        let mut tasks: Vec<_> = self.tasks.iter().map(|t| t.value().clone()).collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }
}

impl TaskReporter for TaskRegistry {
    fn start(&self, name: &str, description: &str, cancellable: bool) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.tasks.insert(
            id,
            TaskStatus {
                id,
                name: name.to_string(),
                description: description.to_string(),
                cancellable,
                percent: 0.0,
                message: String::new(),
                phase: TaskPhase::Running,
                started: Instant::now(),
            },
        );
        tracing::info!(task = id, name, description, "task started");
        id
    }

    fn update(&self, id: TaskId, percent: f64, message: &str) {
        if let Some(mut task) = self.tasks.get_mut(&id) {
            task.percent = percent;
            task.message = message.to_string();
        }
        tracing::info!(task = id, percent = format_args!("{percent:.1}"), message, "task progress");
    }

    fn finish(&self, id: TaskId, failed: bool, message: &str) {
        let elapsed = self.tasks.get_mut(&id).map(|mut task| {
            task.phase = if failed {
                TaskPhase::Failed
            } else {
                TaskPhase::Finished
            };
            task.message = message.to_string();
            task.started.elapsed()
        });
        if failed {
            tracing::warn!(task = id, ?elapsed, message, "task failed");
        } else {
            tracing::info!(task = id, ?elapsed, message, "task finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_lifecycle_is_recorded() {
        let reg = TaskRegistry::new();
        let a = reg.start("download", "shard-1", true);
        let b = reg.start("download", "shard-2", false);
        assert_ne!(a, b);

        reg.update(a, 45.0, "9 of 20 chunks");
        let task = reg.get(a).unwrap();
        assert_eq!(task.percent, 45.0);
        assert_eq!(task.phase, TaskPhase::Running);

        reg.finish(a, false, "done");
        reg.finish(b, true, "no peers");
        assert_eq!(reg.get(a).unwrap().phase, TaskPhase::Finished);
        assert_eq!(reg.get(b).unwrap().phase, TaskPhase::Failed);
        assert_eq!(reg.tasks().len(), 2);
    }
}
