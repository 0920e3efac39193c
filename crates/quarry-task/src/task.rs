//! Long-running tasks that feed queries to the scheduler.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use quarry_protocol::{ChunkPos, Dimension, Parameter};
use quarry_query::Scheduler;

/// Identifier assigned by the [`TaskEngine`](crate::TaskEngine).
pub type TaskId = i32;

/// A chunk whose load state a task just learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkObservation {
    pub pos: ChunkPos,
    pub dimension: Dimension,
    pub loaded: bool,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

/// Per-query settings a task applies to the queries it creates.
#[derive(Debug, Clone)]
pub struct TaskSettings {
    pub digging_timeout: Duration,
    pub digging_max_throughput: f32,
    /// Queries one task keeps outstanding at most.
    pub max_outstanding: usize,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            digging_timeout: Duration::from_secs(2),
            digging_max_throughput: 20.0,
            max_outstanding: 64,
        }
    }
}

impl TaskSettings {
    pub fn from_config(config: &quarry_config::Config) -> Self {
        Self {
            digging_timeout: Duration::from_millis(config.scheduler.digging_timeout_ms),
            digging_max_throughput: config.scheduler.digging_max_throughput,
            ..Self::default()
        }
    }
}

/// What a task may touch while ticking.
pub struct TaskContext<'a> {
    pub scheduler: &'a mut Scheduler,
    pub observations: &'a mut Vec<ChunkObservation>,
    pub now: Instant,
}

/// A running unit of work.
pub trait Task: Send {
    /// Registered name, e.g. `highway_scan`.
    fn name(&self) -> &'static str;

    /// Parameters the task was started with, for remote sync.
    fn parameters(&self) -> Vec<Parameter>;

    fn tick(&mut self, ctx: &mut TaskContext<'_>);

    /// Percent complete, or `None` when progress is not measurable.
    fn progress(&self) -> Option<f32>;

    /// Where the task is currently working.
    fn position(&self) -> Option<ChunkPos> {
        None
    }

    /// Every result so far. Only ever appended to.
    fn results(&self) -> &[String];

    fn is_finished(&self) -> bool;

    /// Cancel outstanding queries. Does not wait for them to leave the
    /// scheduler.
    fn finish(&mut self);
}
