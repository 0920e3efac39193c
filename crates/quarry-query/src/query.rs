//! The query abstraction: one correlated probe with a two-phase lifecycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Instant;

use quarry_protocol::{Dimension, Priority};

use crate::account::AccountPool;
use crate::listener::ListenerRegistry;

/// Outcome of [`Query::handle`] while waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleResult {
    /// Not ready yet, ask again next cycle.
    Await,
    /// Started; move to the ticking set.
    Start,
    /// Drop without ever ticking.
    Remove,
}

/// Outcome of [`Query::tick`] while ticking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickResult {
    Continue,
    /// Finished; drop from the ticking set.
    Remove,
    /// Go back to the front of the waiting list.
    Reschedule,
}

/// Where a query is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueryState {
    Waiting = 0,
    Ticking = 1,
    Finished = 2,
    /// Dropped from the waiting list without starting.
    Removed = 3,
    /// Cancelled after it started.
    Cancelled = 4,
}

impl QueryState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => QueryState::Waiting,
            1 => QueryState::Ticking,
            2 => QueryState::Finished,
            3 => QueryState::Removed,
            _ => QueryState::Cancelled,
        }
    }

    /// Whether the scheduler is done with the query.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            QueryState::Finished | QueryState::Removed | QueryState::Cancelled
        )
    }
}

#[derive(Debug)]
struct HandleInner {
    state: AtomicU8,
    cancelled: AtomicBool,
}

/// Shared view of a scheduled query. Cheap to clone and safe to hold on
/// any thread.
#[derive(Debug, Clone)]
pub struct QueryHandle {
    inner: Arc<HandleInner>,
}

impl QueryHandle {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(HandleInner {
                state: AtomicU8::new(QueryState::Waiting as u8),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> QueryState {
        QueryState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: QueryState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    /// Ask the scheduler to drop the query. Takes effect on its next cycle.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }
}

/// What a query may touch during one scheduler call.
pub struct QueryContext<'a> {
    pub accounts: &'a mut AccountPool,
    pub listeners: &'a mut ListenerRegistry,
    pub now: Instant,
}

/// A probe the [`Scheduler`](crate::Scheduler) admits and advances.
pub trait Query: Send {
    /// Class name used for throughput accounting.
    fn class(&self) -> &'static str;

    fn priority(&self) -> Priority;

    fn dimension(&self) -> Dimension;

    /// Cost charged to the class budget when the query starts.
    fn weight(&self, ctx: &QueryContext<'_>) -> f32;

    /// Advertised queries per second for this class in this dimension.
    fn max_throughput(&self) -> f32;

    /// Called each cycle while waiting and the class budget allows.
    fn handle(&mut self, ctx: &mut QueryContext<'_>) -> HandleResult;

    /// Called each cycle while ticking.
    fn tick(&mut self, ctx: &mut QueryContext<'_>) -> TickResult;

    /// Called exactly once each time the query leaves the ticking set,
    /// whether it finished, rescheduled or was cancelled. Listeners and
    /// account slots must be released here.
    fn release(&mut self, _ctx: &mut QueryContext<'_>) {}
}
