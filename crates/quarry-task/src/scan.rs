//! Chunk scanning tasks built on digging probes.

use std::collections::VecDeque;

use crossbeam_channel::{Receiver, Sender};
use quarry_protocol::{ChunkPos, Dimension, NamedEnum, Parameter, Priority};
use quarry_query::{DigOutcome, DiggingQuery, QueryHandle, QueryState};

use crate::error::TaskError;
use crate::task::{ChunkObservation, Task, TaskContext, TaskSettings, unix_millis};

/// Largest number of chunks one scan may cover.
const MAX_SCAN_CHUNKS: usize = 1 << 22;

/// Chunk distance of the world border from the origin.
const WORLD_BORDER_CHUNKS: i32 = 30_000_000 / 16;

/// Unit vectors of the four axis and four diagonal highways.
const HIGHWAYS: [(i32, i32); 8] = [
    (1, 0),
    (-1, 0),
    (0, 1),
    (0, -1),
    (1, 1),
    (1, -1),
    (-1, 1),
    (-1, -1),
];

/// Probes a fixed list of chunks, keeping a bounded number in flight.
struct ChunkSweep {
    pending: VecDeque<ChunkPos>,
    total: usize,
    resolved: usize,
    outstanding: Vec<QueryHandle>,
    dimension: Dimension,
    priority: Priority,
    settings: TaskSettings,
    outcomes_tx: Sender<DigOutcome>,
    outcomes: Receiver<DigOutcome>,
    position: Option<ChunkPos>,
    results: Vec<String>,
    finished: bool,
}

impl ChunkSweep {
    fn new(
        chunks: Vec<ChunkPos>,
        dimension: Dimension,
        priority: Priority,
        settings: &TaskSettings,
    ) -> Self {
        let (outcomes_tx, outcomes) = crossbeam_channel::unbounded();
        Self {
            total: chunks.len(),
            pending: chunks.into(),
            resolved: 0,
            outstanding: Vec::new(),
            dimension,
            priority,
            settings: settings.clone(),
            outcomes_tx,
            outcomes,
            position: None,
            results: Vec::new(),
            finished: false,
        }
    }

    fn tick(&mut self, ctx: &mut TaskContext<'_>) {
        if self.finished {
            return;
        }

        for outcome in self.outcomes.try_iter() {
            let chunk = outcome.pos.chunk();
            self.resolved += 1;
            self.position = Some(chunk);
            ctx.observations.push(ChunkObservation {
                pos: chunk,
                dimension: outcome.dimension,
                loaded: outcome.loaded,
                timestamp: unix_millis(),
            });
            if outcome.loaded {
                self.results
                    .push(format!("loaded chunk at {chunk} in {}", outcome.dimension.as_name()));
            }
        }

        // Queries dropped without an outcome still count as resolved.
        let resolved = &mut self.resolved;
        self.outstanding.retain(|handle| match handle.state() {
            QueryState::Finished => false,
            QueryState::Removed | QueryState::Cancelled => {
                *resolved += 1;
                false
            }
            QueryState::Waiting | QueryState::Ticking => true,
        });

        while self.outstanding.len() < self.settings.max_outstanding {
            let Some(chunk) = self.pending.pop_front() else {
                break;
            };
            let query = DiggingQuery::new(
                chunk.block(8, 0, 8),
                self.dimension,
                self.priority,
                self.outcomes_tx.clone(),
            )
            .with_timeout(self.settings.digging_timeout)
            .with_max_throughput(self.settings.digging_max_throughput);
            self.outstanding.push(ctx.scheduler.add(Box::new(query)));
        }

        if self.pending.is_empty() && self.outstanding.is_empty() {
            self.finished = true;
        }
    }

    fn progress(&self) -> Option<f32> {
        if self.total == 0 {
            return Some(100.0);
        }
        Some((self.resolved.min(self.total) as f32 * 100.0) / self.total as f32)
    }

    fn finish(&mut self) {
        for handle in self.outstanding.drain(..) {
            handle.cancel();
        }
        self.pending.clear();
        self.finished = true;
    }
}

// ---------------------------------------------------------------------------
// Highway scan
// ---------------------------------------------------------------------------

/// Probes along the eight highways out from the origin.
pub struct HighwayScan {
    params: Vec<Parameter>,
    sweep: ChunkSweep,
}

impl HighwayScan {
    pub const NAME: &'static str = "highway_scan";

    /// Distances are in chunks from the origin, every `skip` chunks.
    pub fn new(
        params: Vec<Parameter>,
        min_dist: i64,
        max_dist: i64,
        skip: i64,
        dimension: Dimension,
        priority: Priority,
        settings: &TaskSettings,
    ) -> Result<Self, TaskError> {
        let chunks = highway_chunks(min_dist, max_dist, skip)?;
        tracing::debug!(chunks = chunks.len(), ?dimension, "highway scan planned");
        Ok(Self {
            params,
            sweep: ChunkSweep::new(chunks, dimension, priority, settings),
        })
    }
}

fn invalid(task: &str, reason: impl Into<String>) -> TaskError {
    TaskError::InvalidArgument {
        task: task.to_owned(),
        reason: reason.into(),
    }
}

fn highway_chunks(min_dist: i64, max_dist: i64, skip: i64) -> Result<Vec<ChunkPos>, TaskError> {
    let task = HighwayScan::NAME;
    if skip < 1 {
        return Err(invalid(task, "skip must be at least 1"));
    }
    if min_dist < 0 || min_dist > max_dist {
        return Err(invalid(task, "distances must satisfy 0 <= minDist <= maxDist"));
    }
    if max_dist > i64::from(WORLD_BORDER_CHUNKS) {
        return Err(invalid(task, "maxDist is beyond the world border"));
    }
    let steps = ((max_dist - min_dist) / skip + 1) as usize;
    if steps.saturating_mul(HIGHWAYS.len()) > MAX_SCAN_CHUNKS {
        return Err(invalid(task, "scan covers too many chunks"));
    }

    let mut chunks = Vec::with_capacity(steps * HIGHWAYS.len());
    let mut dist = min_dist;
    while dist <= max_dist {
        let d = dist as i32;
        if d == 0 {
            chunks.push(ChunkPos::new(0, 0));
        } else {
            chunks.extend(HIGHWAYS.iter().map(|&(dx, dz)| ChunkPos::new(dx * d, dz * d)));
        }
        dist = match dist.checked_add(skip) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(chunks)
}

impl Task for HighwayScan {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn parameters(&self) -> Vec<Parameter> {
        self.params.clone()
    }

    fn tick(&mut self, ctx: &mut TaskContext<'_>) {
        self.sweep.tick(ctx);
    }

    fn progress(&self) -> Option<f32> {
        self.sweep.progress()
    }

    fn position(&self) -> Option<ChunkPos> {
        self.sweep.position
    }

    fn results(&self) -> &[String] {
        &self.sweep.results
    }

    fn is_finished(&self) -> bool {
        self.sweep.finished
    }

    fn finish(&mut self) {
        self.sweep.finish();
    }
}

// ---------------------------------------------------------------------------
// Basic scan
// ---------------------------------------------------------------------------

/// Probes every `skip`-th chunk of a rectangle, row by row.
pub struct BasicScan {
    params: Vec<Parameter>,
    sweep: ChunkSweep,
}

impl BasicScan {
    pub const NAME: &'static str = "basic_scan";

    pub fn new(
        params: Vec<Parameter>,
        start: ChunkPos,
        end: ChunkPos,
        skip: i64,
        dimension: Dimension,
        priority: Priority,
        settings: &TaskSettings,
    ) -> Result<Self, TaskError> {
        let chunks = rectangle_chunks(start, end, skip)?;
        tracing::debug!(chunks = chunks.len(), ?dimension, "basic scan planned");
        Ok(Self {
            params,
            sweep: ChunkSweep::new(chunks, dimension, priority, settings),
        })
    }
}

fn rectangle_chunks(start: ChunkPos, end: ChunkPos, skip: i64) -> Result<Vec<ChunkPos>, TaskError> {
    let task = BasicScan::NAME;
    if !(1..=i64::from(i32::MAX)).contains(&skip) {
        return Err(invalid(task, "skip must be at least 1"));
    }
    let border = -WORLD_BORDER_CHUNKS..=WORLD_BORDER_CHUNKS;
    if [start.x, start.z, end.x, end.z].iter().any(|c| !border.contains(c)) {
        return Err(invalid(task, "scan area is beyond the world border"));
    }
    let (min_x, max_x) = (start.x.min(end.x), start.x.max(end.x));
    let (min_z, max_z) = (start.z.min(end.z), start.z.max(end.z));
    let columns = (i64::from(max_x) - i64::from(min_x)) / skip + 1;
    let rows = (i64::from(max_z) - i64::from(min_z)) / skip + 1;
    if columns.saturating_mul(rows) > MAX_SCAN_CHUNKS as i64 {
        return Err(invalid(task, "scan covers too many chunks"));
    }

    let step = skip as usize;
    let mut chunks = Vec::with_capacity((columns * rows) as usize);
    for z in (i64::from(min_z)..=i64::from(max_z)).step_by(step) {
        for x in (i64::from(min_x)..=i64::from(max_x)).step_by(step) {
            chunks.push(ChunkPos::new(x as i32, z as i32));
        }
    }
    Ok(chunks)
}

impl Task for BasicScan {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn parameters(&self) -> Vec<Parameter> {
        self.params.clone()
    }

    fn tick(&mut self, ctx: &mut TaskContext<'_>) {
        self.sweep.tick(ctx);
    }

    fn progress(&self) -> Option<f32> {
        self.sweep.progress()
    }

    fn position(&self) -> Option<ChunkPos> {
        self.sweep.position
    }

    fn results(&self) -> &[String] {
        &self.sweep.results
    }

    fn is_finished(&self) -> bool {
        self.sweep.finished
    }

    fn finish(&mut self) {
        self.sweep.finish();
    }
}
