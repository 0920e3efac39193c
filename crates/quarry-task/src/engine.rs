//! Owner of active tasks: id assignment, ticking and event reporting.

use std::collections::BTreeMap;
use std::time::Instant;

use quarry_protocol::{ChunkPos, Parameter};

use crate::error::TaskError;
use crate::task::{Task, TaskContext, TaskId};

/// Lifecycle notifications for an attached operator session.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Added {
        task_id: TaskId,
        name: String,
        params: Vec<Parameter>,
    },
    Removed {
        task_id: TaskId,
    },
    Updated {
        task_id: TaskId,
        progress: Option<f32>,
        elapsed_ms: i64,
        position: Option<ChunkPos>,
    },
    Result {
        task_id: TaskId,
        result: String,
    },
}

/// Read-only view of one active task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub name: String,
    pub params: Vec<Parameter>,
    pub progress: Option<f32>,
    pub elapsed_ms: i64,
    pub position: Option<ChunkPos>,
    pub results: Vec<String>,
}

struct ActiveTask {
    task: Box<dyn Task>,
    started: Instant,
    /// Results already reported. Only reset by removal.
    results_sent: usize,
}

impl ActiveTask {
    fn elapsed_ms(&self, now: Instant) -> i64 {
        now.saturating_duration_since(self.started).as_millis() as i64
    }
}

/// Active tasks keyed by the smallest free id.
#[derive(Default)]
pub struct TaskEngine {
    tasks: BTreeMap<TaskId, ActiveTask>,
    attached: bool,
    events: Vec<TaskEvent>,
}

impl TaskEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start recording events for an operator session.
    pub fn attach(&mut self) {
        self.attached = true;
    }

    /// Stop recording events and drop any not yet taken.
    pub fn detach(&mut self) {
        self.attached = false;
        self.events.clear();
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Take the events recorded since the last call.
    pub fn drain_events(&mut self) -> Vec<TaskEvent> {
        std::mem::take(&mut self.events)
    }

    fn emit(&mut self, event: TaskEvent) {
        if self.attached {
            self.events.push(event);
        }
    }

    fn free_id(&self) -> TaskId {
        let mut id = 0;
        for existing in self.tasks.keys() {
            if *existing != id {
                break;
            }
            id += 1;
        }
        id
    }

    /// Take ownership of a task and give it the smallest unused id.
    pub fn add_task(&mut self, task: Box<dyn Task>, now: Instant) -> TaskId {
        let id = self.free_id();
        tracing::info!(task_id = id, name = task.name(), "task added");
        self.emit(TaskEvent::Added {
            task_id: id,
            name: task.name().to_owned(),
            params: task.parameters(),
        });
        self.tasks.insert(
            id,
            ActiveTask {
                task,
                started: now,
                results_sent: 0,
            },
        );
        id
    }

    /// Finish and drop a task. The removal event is emitted even when the id
    /// is unknown, so a remote view never keeps a stale entry.
    pub fn remove_task(&mut self, task_id: TaskId) -> Result<(), TaskError> {
        let removed = self.tasks.remove(&task_id);
        self.emit(TaskEvent::Removed { task_id });
        let mut active = removed.ok_or(TaskError::NoSuchTask(task_id))?;
        active.task.finish();
        tracing::info!(task_id, name = active.task.name(), "task removed");
        Ok(())
    }

    /// Tick every task, report progress and new results, and drop finished
    /// tasks.
    pub fn tick(&mut self, ctx: &mut TaskContext<'_>) {
        let mut finished = Vec::new();
        let mut events = Vec::new();
        for (&task_id, active) in &mut self.tasks {
            active.task.tick(ctx);

            events.push(TaskEvent::Updated {
                task_id,
                progress: active.task.progress(),
                elapsed_ms: active.elapsed_ms(ctx.now),
                position: active.task.position(),
            });
            let results = active.task.results();
            for result in &results[active.results_sent.min(results.len())..] {
                events.push(TaskEvent::Result {
                    task_id,
                    result: result.clone(),
                });
            }
            active.results_sent = results.len();

            if active.task.is_finished() {
                finished.push(task_id);
            }
        }
        for event in events {
            self.emit(event);
        }
        for task_id in finished {
            tracing::info!(task_id, "task completed");
            // Known id, cannot fail.
            let _ = self.remove_task(task_id);
        }
    }

    /// Finish every task, e.g. on shutdown.
    pub fn finish_all(&mut self) {
        let ids: Vec<_> = self.tasks.keys().copied().collect();
        for task_id in ids {
            let _ = self.remove_task(task_id);
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.tasks.contains_key(&task_id)
    }

    /// Every active task, in id order.
    pub fn infos(&self, now: Instant) -> Vec<TaskInfo> {
        self.tasks
            .iter()
            .map(|(&task_id, active)| TaskInfo {
                task_id,
                name: active.task.name().to_owned(),
                params: active.task.parameters(),
                progress: active.task.progress(),
                elapsed_ms: active.elapsed_ms(now),
                position: active.task.position(),
                results: active.task.results().to_vec(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use quarry_query::{Scheduler, SchedulerSettings};

    use crate::task::ChunkObservation;

    /// Appends one result per tick until `total` results exist.
    struct Counter {
        results: Vec<String>,
        total: usize,
        finished: Arc<AtomicBool>,
    }

    impl Counter {
        fn new(total: usize) -> (Self, Arc<AtomicBool>) {
            let finished = Arc::new(AtomicBool::new(false));
            let task = Self {
                results: Vec::new(),
                total,
                finished: Arc::clone(&finished),
            };
            (task, finished)
        }
    }

    impl Task for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn parameters(&self) -> Vec<Parameter> {
            Vec::new()
        }

        fn tick(&mut self, _ctx: &mut TaskContext<'_>) {
            if self.results.len() < self.total {
                self.results.push(format!("result {}", self.results.len()));
            }
        }

        fn progress(&self) -> Option<f32> {
            Some(self.results.len() as f32 * 100.0 / self.total as f32)
        }

        fn results(&self) -> &[String] {
            &self.results
        }

        fn is_finished(&self) -> bool {
            self.results.len() >= self.total
        }

        fn finish(&mut self) {
            self.finished.store(true, Ordering::SeqCst);
        }
    }

    fn tick(engine: &mut TaskEngine, scheduler: &mut Scheduler) {
        let mut observations: Vec<ChunkObservation> = Vec::new();
        let mut ctx = TaskContext {
            scheduler,
            observations: &mut observations,
            now: Instant::now(),
        };
        engine.tick(&mut ctx);
    }

    #[test]
    fn test_smallest_free_id() {
        let mut engine = TaskEngine::new();
        let now = Instant::now();
        assert_eq!(engine.add_task(Box::new(Counter::new(9).0), now), 0);
        assert_eq!(engine.add_task(Box::new(Counter::new(9).0), now), 1);
        assert_eq!(engine.add_task(Box::new(Counter::new(9).0), now), 2);
        engine.remove_task(1).unwrap();
        assert_eq!(engine.add_task(Box::new(Counter::new(9).0), now), 1);
        assert_eq!(engine.add_task(Box::new(Counter::new(9).0), now), 3);
    }

    #[test]
    fn test_results_sent_once() {
        let mut engine = TaskEngine::new();
        let mut scheduler = Scheduler::new(SchedulerSettings::default());
        engine.attach();
        let id = engine.add_task(Box::new(Counter::new(5).0), Instant::now());
        engine.drain_events();

        tick(&mut engine, &mut scheduler);
        tick(&mut engine, &mut scheduler);
        let results: Vec<_> = engine
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                TaskEvent::Result { task_id, result } if task_id == id => Some(result),
                _ => None,
            })
            .collect();
        assert_eq!(results, ["result 0", "result 1"]);
    }

    #[test]
    fn test_finished_task_is_removed() {
        let mut engine = TaskEngine::new();
        let mut scheduler = Scheduler::new(SchedulerSettings::default());
        engine.attach();
        let (task, finished) = Counter::new(1);
        let id = engine.add_task(Box::new(task), Instant::now());

        tick(&mut engine, &mut scheduler);
        assert!(engine.is_empty());
        assert!(finished.load(Ordering::SeqCst));
        let events = engine.drain_events();
        assert!(matches!(events.last(), Some(TaskEvent::Removed { task_id }) if *task_id == id));
        assert!(events.iter().any(|e| matches!(e, TaskEvent::Result { .. })));
    }

    #[test]
    fn test_remove_unknown_still_notifies() {
        let mut engine = TaskEngine::new();
        engine.attach();
        assert!(matches!(engine.remove_task(42), Err(TaskError::NoSuchTask(42))));
        assert_eq!(engine.drain_events(), [TaskEvent::Removed { task_id: 42 }]);
    }

    #[test]
    fn test_detached_engine_records_nothing() {
        let mut engine = TaskEngine::new();
        engine.add_task(Box::new(Counter::new(3).0), Instant::now());
        assert!(engine.drain_events().is_empty());
    }

    #[test]
    fn test_finish_all() {
        let mut engine = TaskEngine::new();
        let (a, a_done) = Counter::new(10);
        let (b, b_done) = Counter::new(10);
        engine.add_task(Box::new(a), Instant::now());
        engine.add_task(Box::new(b), Instant::now());
        engine.finish_all();
        assert!(engine.is_empty());
        assert!(a_done.load(Ordering::SeqCst));
        assert!(b_done.load(Ordering::SeqCst));
    }
}
