//! Weighted, priority-ordered admission and ticking of queries.
//!
//! Each cycle runs in four phases:
//!
//! 1. **Admit**: walk the waiting list in order. Skip any query whose
//!    (class, dimension) budget is already at 1.0 or more, otherwise call
//!    `handle()`. A started query charges its weight to the budget.
//! 2. **Tick**: advance every query that was ticking before this cycle.
//!    Queries started in phase 1 tick from the next cycle on.
//! 3. **Requeue**: rescheduled queries go back to the front of the waiting
//!    list, keeping their relative order.
//! 4. **Decay**: every budget drops by 1.0, floored at 0.
//!
//! Max throughput is reported alongside the budget but never derived from
//! the weight; the two are separate knobs.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use quarry_protocol::{Dimension, GamePacket, NamedEnum, WireEnum};

use crate::account::{AccountId, AccountPool};
use crate::listener::ListenerRegistry;
use crate::query::{HandleResult, Query, QueryContext, QueryHandle, QueryState, TickResult};
use crate::rate::RateSampler;

/// Scheduler tunables.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Queries one account may carry at once. Default: 4.
    pub account_capacity: usize,
    /// Samples kept per rate window. Default: 10.
    pub rate_samples: usize,
    /// Bucket length of the processed rate. Default: 250 ms.
    pub processed_interval: Duration,
    /// Bucket length of the rescheduled rate. Default: 500 ms.
    pub rescheduled_interval: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            account_capacity: 4,
            rate_samples: 10,
            processed_interval: Duration::from_millis(250),
            rescheduled_interval: Duration::from_millis(500),
        }
    }
}

impl SchedulerSettings {
    pub fn from_config(config: &quarry_config::Config) -> Self {
        let s = &config.scheduler;
        Self {
            account_capacity: s.account_capacity,
            rate_samples: s.rate_samples,
            processed_interval: Duration::from_millis(s.processed_sample_ms),
            rescheduled_interval: Duration::from_millis(s.rescheduled_sample_ms),
        }
    }
}

/// Throughput of one query class in one dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassUtilisation {
    pub class: &'static str,
    pub dimension: Dimension,
    /// Admissions per second.
    pub rate: f32,
    pub max_throughput: f32,
}

/// Snapshot of scheduler load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerStats {
    pub waiting: usize,
    pub ticking: usize,
    pub processed_per_second: f32,
    pub rescheduled_per_second: f32,
    /// Queries dropped before they started.
    pub dropped: u64,
    pub utilisation: Vec<ClassUtilisation>,
}

struct Entry {
    query: Box<dyn Query>,
    handle: QueryHandle,
}

struct ClassBudget {
    accumulator: f32,
    max_throughput: f32,
    admissions: RateSampler,
}

type BudgetKey = (&'static str, Dimension);

/// Owns every outstanding query plus the accounts and listeners they use.
pub struct Scheduler {
    settings: SchedulerSettings,
    accounts: AccountPool,
    listeners: ListenerRegistry,
    waiting: Vec<Entry>,
    ticking: Vec<Entry>,
    budgets: HashMap<BudgetKey, ClassBudget>,
    processed: RateSampler,
    rescheduled: RateSampler,
    dropped: u64,
}

impl Scheduler {
    pub fn new(settings: SchedulerSettings) -> Self {
        let now = Instant::now();
        Self {
            accounts: AccountPool::new(settings.account_capacity),
            listeners: ListenerRegistry::new(),
            waiting: Vec::new(),
            ticking: Vec::new(),
            budgets: HashMap::new(),
            processed: RateSampler::new(settings.processed_interval, settings.rate_samples, now),
            rescheduled: RateSampler::new(
                settings.rescheduled_interval,
                settings.rate_samples,
                now,
            ),
            dropped: 0,
            settings,
        }
    }

    /// Enqueue a query behind every waiting query of equal or higher
    /// priority.
    pub fn add(&mut self, query: Box<dyn Query>) -> QueryHandle {
        let handle = QueryHandle::new();
        let priority = query.priority();
        let index = self
            .waiting
            .iter()
            .position(|e| e.query.priority() < priority)
            .unwrap_or(self.waiting.len());
        self.waiting.insert(
            index,
            Entry {
                query,
                handle: handle.clone(),
            },
        );
        handle
    }

    /// Run one admit/tick/decay cycle.
    pub fn cycle(&mut self, now: Instant) {
        let Self {
            settings,
            accounts,
            listeners,
            waiting,
            ticking,
            budgets,
            processed,
            rescheduled,
            dropped,
        } = self;
        let mut ctx = QueryContext {
            accounts,
            listeners,
            now,
        };

        let mut still_waiting = Vec::with_capacity(waiting.len());
        let mut started = Vec::new();
        for mut entry in waiting.drain(..) {
            if entry.handle.is_cancelled() {
                entry.handle.set_state(QueryState::Removed);
                *dropped += 1;
                continue;
            }
            let key = (entry.query.class(), entry.query.dimension());
            if budgets.get(&key).is_some_and(|b| b.accumulator >= 1.0) {
                still_waiting.push(entry);
                continue;
            }
            // Weighed against the pool as it was before this query's lease.
            let weight = entry.query.weight(&ctx).max(0.0);
            match entry.query.handle(&mut ctx) {
                HandleResult::Await => still_waiting.push(entry),
                HandleResult::Start => {
                    let budget = budgets.entry(key).or_insert_with(|| ClassBudget {
                        accumulator: 0.0,
                        max_throughput: 0.0,
                        admissions: RateSampler::new(
                            settings.processed_interval,
                            settings.rate_samples,
                            now,
                        ),
                    });
                    budget.accumulator += weight;
                    budget.max_throughput = entry.query.max_throughput();
                    budget.admissions.record(1, now);
                    entry.handle.set_state(QueryState::Ticking);
                    started.push(entry);
                }
                HandleResult::Remove => {
                    entry.handle.set_state(QueryState::Removed);
                    *dropped += 1;
                }
            }
        }

        let mut requeued = Vec::new();
        let mut still_ticking = Vec::with_capacity(ticking.len() + started.len());
        for mut entry in ticking.drain(..) {
            if entry.handle.is_cancelled() {
                entry.query.release(&mut ctx);
                entry.handle.set_state(QueryState::Cancelled);
                continue;
            }
            match entry.query.tick(&mut ctx) {
                TickResult::Continue => still_ticking.push(entry),
                TickResult::Remove => {
                    entry.query.release(&mut ctx);
                    entry.handle.set_state(QueryState::Finished);
                    processed.record(1, now);
                }
                TickResult::Reschedule => {
                    entry.query.release(&mut ctx);
                    entry.handle.set_state(QueryState::Waiting);
                    rescheduled.record(1, now);
                    requeued.push(entry);
                }
            }
        }
        still_ticking.append(&mut started);
        *ticking = still_ticking;

        if !requeued.is_empty() {
            tracing::debug!(count = requeued.len(), "queries rescheduled");
        }
        requeued.append(&mut still_waiting);
        *waiting = requeued;

        for budget in budgets.values_mut() {
            budget.accumulator = (budget.accumulator - 1.0).max(0.0);
        }
    }

    /// Cancel every outstanding query. They leave on the next cycle.
    pub fn cancel_all(&mut self) {
        for entry in self.waiting.iter().chain(self.ticking.iter()) {
            entry.handle.cancel();
        }
    }

    /// Hand an inbound game packet to the listeners on `account`.
    pub fn dispatch(&mut self, account: AccountId, packet: &GamePacket) -> usize {
        self.listeners.dispatch(account, packet)
    }

    /// Remove an account and every listener registered on it.
    pub fn remove_account(&mut self, account: AccountId) {
        self.accounts.remove(account);
        let dropped = self.listeners.remove_account(account);
        if dropped > 0 {
            tracing::debug!(?account, dropped, "listeners dropped with account");
        }
    }

    pub fn accounts(&self) -> &AccountPool {
        &self.accounts
    }

    pub fn accounts_mut(&mut self) -> &mut AccountPool {
        &mut self.accounts
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn ticking_len(&self) -> usize {
        self.ticking.len()
    }

    pub fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.ticking.is_empty()
    }

    /// Current budget use of a class in a dimension.
    pub fn accumulator(&self, class: &str, dimension: Dimension) -> f32 {
        self.budgets
            .iter()
            .find(|((c, d), _)| *c == class && *d == dimension)
            .map_or(0.0, |(_, b)| b.accumulator)
    }

    pub fn stats(&mut self, now: Instant) -> SchedulerStats {
        let mut utilisation: Vec<_> = self
            .budgets
            .iter_mut()
            .map(|(&(class, dimension), budget)| ClassUtilisation {
                class,
                dimension,
                rate: budget.admissions.per_second(now),
                max_throughput: budget.max_throughput,
            })
            .collect();
        utilisation.sort_by(|a, b| {
            a.class
                .cmp(b.class)
                .then(a.dimension.ordinal().cmp(&b.dimension.ordinal()))
        });

        SchedulerStats {
            waiting: self.waiting.len(),
            ticking: self.ticking.len(),
            processed_per_second: self.processed.per_second(now),
            rescheduled_per_second: self.rescheduled.per_second(now),
            dropped: self.dropped,
            utilisation,
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("waiting", &self.waiting.len())
            .field("ticking", &self.ticking.len())
            .field("accounts", &self.accounts.len())
            .field("dropped", &self.dropped)
            .finish()
    }
}

impl std::fmt::Display for ClassUtilisation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}: {:.1}/{:.1} per second",
            self.class,
            self.dimension.as_name(),
            self.rate,
            self.max_throughput
        )
    }
}
