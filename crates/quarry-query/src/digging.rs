//! Chunk-load probe built on block digging.
//!
//! The account starts and immediately cancels digging at a block. The game
//! server answers with a block change only when the chunk holding that block
//! is loaded, so silence until the timeout is read as "unloaded". That is an
//! approximation, not a negative acknowledgement.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use quarry_protocol::game::{DiggingStatus, PlayerDigging};
use quarry_protocol::{BlockPos, Dimension, GamePacket, Priority};

use crate::account::AccountLease;
use crate::listener::ListenerId;
use crate::query::{HandleResult, Query, QueryContext, TickResult};

/// Class name of [`DiggingQuery`] in scheduler accounting.
pub const DIGGING_CLASS: &str = "digging";

/// Result of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigOutcome {
    pub pos: BlockPos,
    pub dimension: Dimension,
    pub loaded: bool,
    /// Block state from the server's answer, when there was one.
    pub block_state: Option<i32>,
}

struct InFlight {
    lease: AccountLease,
    listener: ListenerId,
    answers: Receiver<i32>,
    started: Instant,
}

/// Probes whether the chunk holding `pos` is loaded.
pub struct DiggingQuery {
    pos: BlockPos,
    dimension: Dimension,
    priority: Priority,
    timeout: Duration,
    max_throughput: f32,
    report: Sender<DigOutcome>,
    in_flight: Option<InFlight>,
}

impl DiggingQuery {
    pub fn new(
        pos: BlockPos,
        dimension: Dimension,
        priority: Priority,
        report: Sender<DigOutcome>,
    ) -> Self {
        Self {
            pos,
            dimension,
            priority,
            timeout: Duration::from_secs(2),
            max_throughput: 20.0,
            report,
            in_flight: None,
        }
    }

    /// How long to wait for an answer before reporting unloaded.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_throughput(mut self, max_throughput: f32) -> Self {
        self.max_throughput = max_throughput;
        self
    }

    pub fn pos(&self) -> BlockPos {
        self.pos
    }

    fn finish(&self, block_state: Option<i32>) -> TickResult {
        let outcome = DigOutcome {
            pos: self.pos,
            dimension: self.dimension,
            loaded: block_state.is_some(),
            block_state,
        };
        tracing::trace!(pos = %self.pos, loaded = outcome.loaded, "dig resolved");
        // The owner may have gone away; the result is then simply dropped.
        let _ = self.report.send(outcome);
        TickResult::Remove
    }
}

impl Query for DiggingQuery {
    fn class(&self) -> &'static str {
        DIGGING_CLASS
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn dimension(&self) -> Dimension {
        self.dimension
    }

    /// One over the number of accounts that could carry the probe.
    fn weight(&self, ctx: &QueryContext<'_>) -> f32 {
        1.0 / ctx.accounts.available(self.dimension).max(1) as f32
    }

    fn max_throughput(&self) -> f32 {
        self.max_throughput
    }

    fn handle(&mut self, ctx: &mut QueryContext<'_>) -> HandleResult {
        let Some(lease) = ctx.accounts.acquire(self.dimension) else {
            return HandleResult::Await;
        };
        let account = lease.account();

        let dig = |status| PlayerDigging {
            status,
            pos: self.pos,
            face: 0,
        };
        let sent = ctx
            .accounts
            .send(account, dig(DiggingStatus::Started))
            .and_then(|()| ctx.accounts.send(account, dig(DiggingStatus::Cancelled)));
        if let Err(e) = sent {
            tracing::debug!(?account, error = %e, "dig not sent");
            ctx.accounts.release(lease);
            return HandleResult::Await;
        }

        let (tx, answers) = crossbeam_channel::bounded(1);
        let pos = self.pos;
        let listener = ctx.listeners.register(
            account,
            Box::new(move |packet: &GamePacket| {
                if let GamePacket::BlockChange(change) = packet
                    && change.pos == pos
                {
                    let _ = tx.try_send(change.block_state);
                }
            }),
        );

        self.in_flight = Some(InFlight {
            lease,
            listener,
            answers,
            started: ctx.now,
        });
        HandleResult::Start
    }

    fn tick(&mut self, ctx: &mut QueryContext<'_>) -> TickResult {
        let Some(in_flight) = &self.in_flight else {
            return TickResult::Reschedule;
        };
        if let Ok(block_state) = in_flight.answers.try_recv() {
            return self.finish(Some(block_state));
        }
        if !ctx.accounts.is_online(in_flight.lease.account()) {
            return TickResult::Reschedule;
        }
        if ctx.now.saturating_duration_since(in_flight.started) >= self.timeout {
            return self.finish(None);
        }
        TickResult::Continue
    }

    fn release(&mut self, ctx: &mut QueryContext<'_>) {
        if let Some(in_flight) = self.in_flight.take() {
            ctx.listeners.unregister(in_flight.listener);
            ctx.accounts.release(in_flight.lease);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use quarry_protocol::game::BlockChange;

    use crate::account::AccountId;
    use crate::account::tests::FakeLink;
    use crate::query::QueryState;
    use crate::scheduler::{Scheduler, SchedulerSettings};

    fn setup() -> (Scheduler, FakeLink) {
        let link = FakeLink::default();
        let mut scheduler = Scheduler::new(SchedulerSettings::default());
        scheduler
            .accounts_mut()
            .add(AccountId(1), "probe", Dimension::Overworld, Box::new(link.clone()));
        (scheduler, link)
    }

    fn block_change(pos: BlockPos) -> GamePacket {
        BlockChange {
            pos,
            block_state: 9,
        }
        .into()
    }

    #[test]
    fn test_answer_reports_loaded() {
        let (mut scheduler, link) = setup();
        let (tx, rx) = crossbeam_channel::unbounded();
        let pos = BlockPos::new(160, 64, -32);
        let handle = scheduler.add(Box::new(DiggingQuery::new(
            pos,
            Dimension::Overworld,
            Priority::Medium,
            tx,
        )));

        let now = Instant::now();
        scheduler.cycle(now);
        assert_eq!(handle.state(), QueryState::Ticking);
        {
            let sent = link.sent.lock().unwrap();
            assert_eq!(sent.len(), 2);
            assert!(matches!(
                &sent[0],
                GamePacket::PlayerDigging(d) if d.pos == pos && d.status == DiggingStatus::Started
            ));
        }

        assert_eq!(scheduler.dispatch(AccountId(1), &block_change(pos)), 1);
        scheduler.cycle(now);

        let outcome = rx.try_recv().unwrap();
        assert!(outcome.loaded);
        assert_eq!(outcome.block_state, Some(9));
        assert_eq!(handle.state(), QueryState::Finished);
        assert_eq!(scheduler.accounts().in_flight(AccountId(1)), 0);
    }

    #[test]
    fn test_timeout_reports_unloaded() {
        let (mut scheduler, _link) = setup();
        let (tx, rx) = crossbeam_channel::unbounded();
        scheduler.add(Box::new(DiggingQuery::new(
            BlockPos::new(0, 0, 0),
            Dimension::Overworld,
            Priority::Low,
            tx,
        )));

        let start = Instant::now();
        scheduler.cycle(start);
        scheduler.cycle(start + Duration::from_millis(1999));
        assert!(rx.try_recv().is_err());
        scheduler.cycle(start + Duration::from_millis(2000));

        let outcome = rx.try_recv().unwrap();
        assert!(!outcome.loaded);
        assert_eq!(outcome.block_state, None);
    }

    #[test]
    fn test_listener_removed_after_finish() {
        let (mut scheduler, _link) = setup();
        let (tx, rx) = crossbeam_channel::unbounded();
        let pos = BlockPos::new(16, 70, 16);
        scheduler.add(Box::new(DiggingQuery::new(
            pos,
            Dimension::Overworld,
            Priority::High,
            tx,
        )));
        let now = Instant::now();
        scheduler.cycle(now);
        assert_eq!(scheduler.listeners().len(), 1);

        scheduler.dispatch(AccountId(1), &block_change(pos));
        scheduler.cycle(now);
        assert_eq!(rx.try_iter().count(), 1);
        assert!(scheduler.listeners().is_empty());

        // A later packet for the same block reaches nobody.
        assert_eq!(scheduler.dispatch(AccountId(1), &block_change(pos)), 0);
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn test_listener_removed_on_cancel() {
        let (mut scheduler, _link) = setup();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let handle = scheduler.add(Box::new(DiggingQuery::new(
            BlockPos::new(1, 1, 1),
            Dimension::Overworld,
            Priority::High,
            tx,
        )));
        let now = Instant::now();
        scheduler.cycle(now);
        handle.cancel();
        scheduler.cycle(now);
        assert_eq!(handle.state(), QueryState::Cancelled);
        assert!(scheduler.listeners().is_empty());
        assert_eq!(scheduler.accounts().in_flight(AccountId(1)), 0);
    }

    #[test]
    fn test_waits_without_accounts() {
        let mut scheduler = Scheduler::new(SchedulerSettings::default());
        let (tx, _rx) = crossbeam_channel::unbounded();
        let handle = scheduler.add(Box::new(DiggingQuery::new(
            BlockPos::new(1, 1, 1),
            Dimension::Nether,
            Priority::High,
            tx,
        )));
        for _ in 0..5 {
            scheduler.cycle(Instant::now());
        }
        assert_eq!(handle.state(), QueryState::Waiting);
    }

    #[test]
    fn test_offline_account_reschedules() {
        let (mut scheduler, link) = setup();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let handle = scheduler.add(Box::new(DiggingQuery::new(
            BlockPos::new(2, 2, 2),
            Dimension::Overworld,
            Priority::High,
            tx,
        )));
        let now = Instant::now();
        scheduler.cycle(now);
        link.offline.store(true, Ordering::SeqCst);
        scheduler.cycle(now);
        assert_eq!(handle.state(), QueryState::Waiting);
        assert!(scheduler.listeners().is_empty());
        assert_eq!(scheduler.stats(now).waiting, 1);
    }

    #[test]
    fn test_weight_counts_the_account_it_leases() {
        let mut scheduler = Scheduler::new(SchedulerSettings {
            account_capacity: 1,
            ..SchedulerSettings::default()
        });
        for id in [1, 2] {
            scheduler.accounts_mut().add(
                AccountId(id),
                "probe",
                Dimension::Overworld,
                Box::new(FakeLink::default()),
            );
        }
        let (tx, _rx) = crossbeam_channel::unbounded();
        let handles: Vec<_> = [BlockPos::new(0, 60, 0), BlockPos::new(16, 60, 0)]
            .into_iter()
            .map(|pos| {
                scheduler.add(Box::new(DiggingQuery::new(
                    pos,
                    Dimension::Overworld,
                    Priority::Medium,
                    tx.clone(),
                )))
            })
            .collect();

        // Two free accounts: the first probe costs half the budget.
        scheduler.cycle(Instant::now());
        assert!(handles.iter().all(|h| h.state() == QueryState::Ticking));
        assert_eq!(scheduler.accounts().available(Dimension::Overworld), 0);
    }
}
