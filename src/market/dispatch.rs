//! Settlement dispatch: the payout side of settlement mutates the Ledger
//! inline (a user's available balance cannot wait behind a queue), but
//! writing each payout's audit row to the journal's SQLite-backed
//! `settlement_log` is deferred work. That write is routed through the
//! Task Queue so market resolution does not block on disk I/O, guarded by
//! a Circuit Breaker naming the journal as the dependency, with every
//! attempt recorded against the settlement SLO.
//!
//! Grounded on `market::coordinator`'s "don't block the caller on a side
//! effect" writer-task shape, generalized from a dedicated tokio task per
//! market to a shared `TaskQueue` job per settlement, since audit writes
//! (unlike order matching) don't need per-market serialization.

use std::sync::Arc;
use std::time::Instant;

use crate::market::journal::Journal;
use crate::market::ledger::Ledger;
use crate::market::settlement;
use crate::market::types::{Market, OutcomeIndex, UserId};
use crate::resilience::circuit_breaker::CircuitRegistry;
use crate::resilience::slo::SloMonitor;
use crate::resilience::task_queue::{Priority, RetryPolicy, TaskId, TaskQueue};

/// Circuit Breaker dependency name for the journal's settlement-log write.
pub const SETTLEMENT_JOURNAL_DEPENDENCY: &str = "settlement_journal";
/// SLO name under which settlement-dispatch attempts are recorded.
pub const SETTLEMENT_SLO: &str = "settlement_dispatch";

fn now_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Shared handle background settlement jobs use to reach the journal, the
/// breaker guarding it, and the SLO monitor, without the coordinator
/// handing its own internals to the Task Queue.
pub struct SettlementDispatcher {
    queue: Arc<TaskQueue>,
    circuits: Arc<CircuitRegistry>,
    slo: Arc<SloMonitor>,
    journal: Arc<Journal>,
}

impl SettlementDispatcher {
    pub fn new(
        queue: Arc<TaskQueue>,
        circuits: Arc<CircuitRegistry>,
        slo: Arc<SloMonitor>,
        journal: Arc<Journal>,
    ) -> Self {
        Self { queue, circuits, slo, journal }
    }

    /// Pays out `market`'s resolution against `position_holders` (mutating
    /// the ledger synchronously) and enqueues the audit-log write as
    /// deferred work. Returns the queued task id, or `None` if the
    /// resolution produced no payouts (nothing to journal).
    ///
    /// `record_settlement`'s `(market_id, user_id)` primary key makes the
    /// journal write an `INSERT OR IGNORE`, so a Task Queue retry after a
    /// transient failure is safe to re-run: it either inserts the row or
    /// finds it already there.
    pub fn settle_and_dispatch(
        &self,
        ledger: &Ledger,
        market: &Market,
        position_holders: &[(UserId, OutcomeIndex)],
    ) -> Option<TaskId> {
        let records = settlement::settle_market(ledger, market, position_holders, now_ns());
        if records.is_empty() {
            return None;
        }

        let journal = self.journal.clone();
        let circuits = self.circuits.clone();
        let slo = self.slo.clone();

        Some(self.queue.enqueue(Priority::NORMAL, RetryPolicy::default(), move || {
            let journal = journal.clone();
            let circuits = circuits.clone();
            let slo = slo.clone();
            let records = records.clone();
            async move {
                let start = Instant::now();
                let outcome = circuits
                    .call(SETTLEMENT_JOURNAL_DEPENDENCY, || async {
                        for record in &records {
                            journal.record_settlement(record.market_id, record.user_id, record.payout, record.timestamp_ns)?;
                        }
                        Ok::<(), rusqlite::Error>(())
                    })
                    .await;

                let good = matches!(outcome, Ok(Ok(())));
                slo.record(SETTLEMENT_SLO, good, start.elapsed());

                match outcome {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(format!("settlement journal write failed: {e}")),
                    Err(rejection) => Err(format!("settlement journal circuit open: {rejection}")),
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::{EngineKind, Market, MarketKind, MarketState, Resolution};
    use crate::performance::queues::QueueRegistry;
    use std::time::Duration;

    fn mk_resolved_binary() -> Market {
        let mut m = Market::new(1, MarketKind::Binary, EngineKind::OrderBook, vec!["YES".into(), "NO".into()], 1000, false, 0, 99);
        m.state = MarketState::Resolved;
        m.resolution = Some(Resolution { outcome: 0, scalar_value: None, resolved_at_ns: 100 });
        m
    }

    fn mk_dispatcher() -> (SettlementDispatcher, Arc<Ledger>, Arc<Journal>) {
        let ledger = Arc::new(Ledger::new(true));
        let journal = Arc::new(Journal::open_memory().unwrap());
        let queue = Arc::new(TaskQueue::new(2, Arc::new(QueueRegistry::new())));
        let circuits = Arc::new(CircuitRegistry::default());
        let slo = Arc::new(SloMonitor::default());
        let dispatcher = SettlementDispatcher::new(queue, circuits, slo, journal.clone());
        (dispatcher, ledger, journal)
    }

    #[tokio::test]
    async fn settlement_pays_ledger_immediately_and_journals_in_background() {
        let (dispatcher, ledger, journal) = mk_dispatcher();
        ledger.deposit(1, 10_000);
        ledger.deposit(2, 10_000);
        ledger.reserve(1, 1, 6_000).unwrap();
        ledger.reserve(2, 1, 4_000).unwrap();
        ledger.settle_trade(1, 2, 1, 0, 60, 100).unwrap();

        let market = mk_resolved_binary();
        let holders = vec![(1u64, 0u16), (2u64, 0u16)];

        let task_id = dispatcher.settle_and_dispatch(&ledger, &market, &holders);
        assert!(task_id.is_some());

        // The payout itself is synchronous: available balance reflects it
        // before the background task has had a chance to run at all.
        assert_eq!(
            ledger.snapshot(1).available,
            10_000 - 6_000 + 100 * (crate::market::types::MAX_PRICE_TICKS as crate::market::types::Amount + 1)
        );

        for _ in 0..20 {
            if journal.settlement_count(1).unwrap() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(journal.settlement_count(1).unwrap(), 2);
    }

    #[tokio::test]
    async fn second_settlement_attempt_dispatches_nothing() {
        let (dispatcher, ledger, _journal) = mk_dispatcher();
        ledger.deposit(1, 10_000);
        ledger.deposit(2, 10_000);
        ledger.reserve(1, 1, 6_000).unwrap();
        ledger.reserve(2, 1, 4_000).unwrap();
        ledger.settle_trade(1, 2, 1, 0, 60, 100).unwrap();

        let market = mk_resolved_binary();
        let holders = vec![(1u64, 0u16), (2u64, 0u16)];

        assert!(dispatcher.settle_and_dispatch(&ledger, &market, &holders).is_some());
        assert!(dispatcher.settle_and_dispatch(&ledger, &market, &holders).is_none());
    }
}
