//! Market Coordinator: single entry point for order submission,
//! cancellation, and lifecycle commands, dispatching to the order-book or
//! AMM engine configured for each market.
//!
//! Concurrency model grounded on `vault::orderflow_paper`'s
//! `Arc<Engine>` + `tokio::spawn(engine.run(rx))` + bounded `mpsc` channel
//! shape: one writer task per market serializes every command for that
//! market, generalized here from a single engine instance to one writer
//! per `MarketId` so markets never contend with each other.

use crate::market::amm::{AmmConfig, AmmError, AmmPool};
use crate::market::book::{BookConfig, MatchError, OrderBook};
use crate::market::events::{EventPublisher, MarketEvent, RejectReason};
use crate::market::journal::{Journal, JournalRecord};
use crate::market::ledger::{Ledger, LedgerError};
use crate::market::risk::{self, RiskRejection, UserSnapshot};
use crate::resilience::cache::{Cache, CacheConfig, InProcessBackend};
use crate::market::types::{
    EngineKind, Market, MarketId, MarketState, Order, OrderId, OrderKind, OutcomeIndex, PositionKey,
    Resolution, Trade, UserId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    Risk(RiskRejection),
    Ledger(LedgerError),
    Match(MatchError),
    Amm(AmmError),
    MarketBusy,
    UnknownMarket,
    /// Requested an AMM-only or book-only operation against the other kind
    /// of engine.
    WrongEngine,
    /// `resolve_and_settle` called on a coordinator with no
    /// `SettlementDispatcher` configured.
    SettlementUnavailable,
}

impl std::fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorError::Risk(r) => write!(f, "{r}"),
            CoordinatorError::Ledger(e) => write!(f, "{e}"),
            CoordinatorError::Match(e) => write!(f, "{e}"),
            CoordinatorError::Amm(e) => write!(f, "{e}"),
            CoordinatorError::MarketBusy => write!(f, "market is busy, try again"),
            CoordinatorError::UnknownMarket => write!(f, "unknown market"),
            CoordinatorError::WrongEngine => write!(f, "operation not supported by this market's engine"),
            CoordinatorError::SettlementUnavailable => write!(f, "no settlement dispatcher configured"),
        }
    }
}

impl std::error::Error for CoordinatorError {}

impl From<RiskRejection> for CoordinatorError {
    fn from(e: RiskRejection) -> Self { CoordinatorError::Risk(e) }
}
impl From<LedgerError> for CoordinatorError {
    fn from(e: LedgerError) -> Self { CoordinatorError::Ledger(e) }
}
impl From<MatchError> for CoordinatorError {
    fn from(e: MatchError) -> Self { CoordinatorError::Match(e) }
}
impl From<AmmError> for CoordinatorError {
    fn from(e: AmmError) -> Self { CoordinatorError::Amm(e) }
}

pub struct SubmitResult {
    pub order_id: OrderId,
    pub trades: Vec<Trade>,
}

pub struct CancelResult {
    pub released_amount: crate::market::types::Amount,
    pub noop: bool,
}

/// One order book per outcome: a categorical market's outcomes trade
/// independently (buying YES on outcome 2 does not cross with an order on
/// outcome 0), so each gets its own price-time-priority book.
enum Engine {
    Book(HashMap<OutcomeIndex, OrderBook>),
    Amm(AmmPool),
}

enum Command {
    Submit {
        order: Order,
        accredited: bool,
        respond: oneshot::Sender<Result<SubmitResult, CoordinatorError>>,
    },
    Cancel {
        order_id: OrderId,
        respond: oneshot::Sender<CancelResult>,
    },
    Transition {
        target: MarketState,
        resolution: Option<Resolution>,
        respond: oneshot::Sender<Result<(), CoordinatorError>>,
    },
    /// Read-only snapshot, used by tests and the settlement driver to learn
    /// which users hold a position before running settlement.
    PositionHolders {
        respond: oneshot::Sender<Vec<(UserId, OutcomeIndex)>>,
    },
    /// Read-only copy of the market's current metadata and resolution,
    /// used by the settlement driver after a `Transition` to `Resolved`.
    MarketSnapshot {
        respond: oneshot::Sender<Market>,
    },
    /// Read-only AMM quote: the input required to buy `size` shares of
    /// `outcome`, without mutating pool state. Rejected with `WrongEngine`
    /// against a `Book`-engine market.
    QuoteAmm {
        outcome: OutcomeIndex,
        size: crate::market::types::Size,
        side: crate::market::types::Side,
        respond: oneshot::Sender<Result<crate::market::amm::Quote, CoordinatorError>>,
    },
    AddLiquidity {
        provider: UserId,
        amounts: Vec<crate::market::types::Amount>,
        respond: oneshot::Sender<Result<crate::market::types::Amount, CoordinatorError>>,
    },
    RemoveLiquidity {
        provider: UserId,
        shares: crate::market::types::Amount,
        respond: oneshot::Sender<Result<Vec<crate::market::types::Amount>, CoordinatorError>>,
    },
}

struct MarketWriter {
    market: Market,
    engine: Engine,
    book_config: BookConfig,
    ledger: Arc<Ledger>,
    events: EventPublisher,
    rx: mpsc::Receiver<Command>,
    next_order_id: OrderId,
    holders: std::collections::HashSet<(UserId, OutcomeIndex)>,
    journal: Arc<Journal>,
    journal_seq: u64,
    checkpoint_interval: u64,
}

#[derive(Serialize, Deserialize)]
struct CheckpointState {
    next_order_id: OrderId,
    holders: Vec<(UserId, OutcomeIndex)>,
    engine: CheckpointEngine,
}

#[derive(Serialize, Deserialize)]
enum CheckpointEngine {
    Book(HashMap<OutcomeIndex, Vec<Order>>),
    Amm {
        reserves: Vec<crate::market::types::Amount>,
        total_shares: crate::market::types::Amount,
        provider_shares: HashMap<UserId, crate::market::types::Amount>,
        next_trade_id: crate::market::types::TradeId,
    },
}

/// A market's static definition plus the two engine configs, persisted
/// once at `create_market` time so startup recovery knows which markets
/// to rebuild and how, before any checkpoint or journal row exists for
/// them.
#[derive(Serialize, Deserialize)]
struct MarketDefinition {
    market: Market,
    book_config: BookConfig,
    amm_config: AmmConfig,
}

fn now_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

impl MarketWriter {
    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                Command::Submit { order, accredited, respond } => {
                    self.journal_append(&JournalRecord::Submit { order: order.clone(), accredited });
                    let result = self.handle_submit(order, accredited);
                    if let Ok(r) = &result {
                        for trade in &r.trades {
                            if let Err(e) = self.journal.record_trade(trade) {
                                tracing::error!(error = %e, "failed to append trade to audit log");
                            }
                        }
                    }
                    self.maybe_checkpoint();
                    let _ = respond.send(result);
                }
                Command::Cancel { order_id, respond } => {
                    self.journal_append(&JournalRecord::Cancel { order_id });
                    let result = self.handle_cancel(order_id);
                    self.maybe_checkpoint();
                    let _ = respond.send(result);
                }
                Command::Transition { target, resolution, respond } => {
                    self.journal_append(&JournalRecord::Transition { target, resolution });
                    let result = self.handle_transition(target, resolution);
                    self.maybe_checkpoint();
                    let _ = respond.send(result);
                }
                Command::PositionHolders { respond } => {
                    let _ = respond.send(self.holders.iter().copied().collect());
                }
                Command::MarketSnapshot { respond } => {
                    let _ = respond.send(self.market.clone());
                }
                Command::QuoteAmm { outcome, size, side, respond } => {
                    let _ = respond.send(self.handle_quote_amm(outcome, size, side));
                }
                Command::AddLiquidity { provider, amounts, respond } => {
                    self.journal_append(&JournalRecord::AddLiquidity { provider, amounts: amounts.clone() });
                    let result = self.handle_add_liquidity(provider, &amounts);
                    self.maybe_checkpoint();
                    let _ = respond.send(result);
                }
                Command::RemoveLiquidity { provider, shares, respond } => {
                    self.journal_append(&JournalRecord::RemoveLiquidity { provider, shares });
                    let result = self.handle_remove_liquidity(provider, shares);
                    self.maybe_checkpoint();
                    let _ = respond.send(result);
                }
            }
        }
    }

    /// Records the command before it mutates engine state: a crash between
    /// this write and the in-memory mutation just means recovery re-applies
    /// a command whose effects never happened, which is safe for every
    /// command this writer handles.
    fn journal_append(&mut self, record: &JournalRecord) {
        self.journal_seq += 1;
        if let Err(e) = self.journal.append(self.market.id, self.journal_seq, now_ns(), record) {
            tracing::error!(error = %e, market_id = self.market.id, "failed to append command journal entry");
        }
    }

    fn checkpoint_state(&self) -> CheckpointState {
        let engine = match &self.engine {
            Engine::Book(books) => CheckpointEngine::Book(
                books
                    .iter()
                    .map(|(outcome, book)| (*outcome, book.open_orders().cloned().collect()))
                    .collect(),
            ),
            Engine::Amm(pool) => CheckpointEngine::Amm {
                reserves: pool.reserves().to_vec(),
                total_shares: pool.total_shares(),
                provider_shares: pool.provider_shares().clone(),
                next_trade_id: pool.next_trade_id(),
            },
        };
        CheckpointState {
            next_order_id: self.next_order_id,
            holders: self.holders.iter().copied().collect(),
            engine,
        }
    }

    /// Takes a checkpoint every `checkpoint_interval` journaled commands.
    /// Called after the command that advanced `journal_seq` to that
    /// multiple has already been applied, so the snapshot reflects its
    /// effects and recovery can discard every journal row up to `seq`.
    fn maybe_checkpoint(&mut self) {
        if self.journal_seq == 0 || self.journal_seq % self.checkpoint_interval != 0 {
            return;
        }
        match serde_json::to_string(&self.checkpoint_state()) {
            Ok(state) => {
                if let Err(e) = self.journal.save_checkpoint(self.market.id, self.journal_seq, now_ns(), &state) {
                    tracing::error!(error = %e, market_id = self.market.id, "failed to save checkpoint");
                }
            }
            Err(e) => tracing::error!(error = %e, market_id = self.market.id, "failed to serialize checkpoint state"),
        }
    }

    fn handle_quote_amm(
        &self,
        outcome: OutcomeIndex,
        size: crate::market::types::Size,
        side: crate::market::types::Side,
    ) -> Result<crate::market::amm::Quote, CoordinatorError> {
        let Engine::Amm(pool) = &self.engine else {
            return Err(CoordinatorError::WrongEngine);
        };
        Ok(pool.quote(outcome, size, side)?)
    }

    fn handle_add_liquidity(
        &mut self,
        provider: UserId,
        amounts: &[crate::market::types::Amount],
    ) -> Result<crate::market::types::Amount, CoordinatorError> {
        let Engine::Amm(pool) = &mut self.engine else {
            return Err(CoordinatorError::WrongEngine);
        };
        let total: crate::market::types::Amount = amounts.iter().sum();
        self.ledger.transfer(provider, crate::market::types::AMM_POOL_ACCOUNT, total)?;
        Ok(pool.add_liquidity(provider, amounts))
    }

    fn handle_remove_liquidity(
        &mut self,
        provider: UserId,
        shares: crate::market::types::Amount,
    ) -> Result<Vec<crate::market::types::Amount>, CoordinatorError> {
        let Engine::Amm(pool) = &mut self.engine else {
            return Err(CoordinatorError::WrongEngine);
        };
        let Some(amounts) = pool.remove_liquidity(provider, shares) else {
            return Err(AmmError::InsufficientLiquidity.into());
        };
        let total: crate::market::types::Amount = amounts.iter().sum();
        self.ledger.transfer(crate::market::types::AMM_POOL_ACCOUNT, provider, total)?;
        Ok(amounts)
    }

    fn handle_submit(&mut self, mut order: Order, accredited: bool) -> Result<SubmitResult, CoordinatorError> {
        if !self.market.state.is_tradable() {
            self.events.publish(|seq| MarketEvent::OrderRejected {
                seq,
                market_id: self.market.id,
                order_id: order.id,
                reason: RejectReason::MarketNotTradable,
            });
            return Err(RiskRejection::MarketNotTradable.into());
        }

        order.id = self.next_order_id;
        self.next_order_id += 1;

        let balance = self.ledger.snapshot(order.user_id);
        let position = self.ledger.position(PositionKey {
            user_id: order.user_id,
            market_id: self.market.id,
            outcome: order.outcome,
        });
        let snapshot = UserSnapshot { accredited, balance, position };

        let report = risk::check_order(Some(&self.market), &snapshot, &order);
        if let Some(rejection) = report.rejection {
            self.events.publish(|seq| MarketEvent::OrderRejected {
                seq,
                market_id: self.market.id,
                order_id: order.id,
                reason: reject_reason_for(&rejection),
            });
            return Err(rejection.into());
        }

        let reservation = risk::required_reservation(&order);
        self.ledger.reserve(order.user_id, self.market.id, reservation)?;

        let market_id = self.market.id;
        let book_config = self.book_config;
        let outcome = match &mut self.engine {
            Engine::Book(books) => {
                let book = books
                    .entry(order.outcome)
                    .or_insert_with(|| OrderBook::new(market_id, order.outcome, book_config));
                submit_to_book(&self.ledger, market_id, &mut self.events, book, order.clone(), reservation)?
            }
            Engine::Amm(pool) => submit_to_amm(&self.ledger, market_id, pool, order.clone(), reservation)?,
        };

        self.events.publish(|seq| MarketEvent::OrderAccepted {
            seq,
            market_id: self.market.id,
            order_id: order.id,
        });
        for trade in &outcome.trades {
            self.events.publish(|seq| MarketEvent::Trade { seq, market_id: self.market.id, trade: *trade });
            self.holders.insert((trade.buyer_user_id, trade.outcome));
            self.holders.insert((trade.seller_user_id, trade.outcome));
        }
        self.holders.insert((order.user_id, order.outcome));

        Ok(outcome)
    }

    fn handle_cancel(&mut self, order_id: OrderId) -> CancelResult {
        match &mut self.engine {
            Engine::Book(books) => {
                // Fetch owner/price before cancelling: `cancel` removes the
                // order from its book's internal map, so it cannot be
                // looked up afterward. The order's outcome (hence which
                // book it lives in) is not known up front, so every book
                // is checked until one claims it.
                let found = books.values().find_map(|b| b.order(order_id).map(|o| (o.user_id, o.price.unwrap_or(0))));
                let Some(book) = books.values_mut().find(|b| b.order(order_id).is_some()) else {
                    return CancelResult { released_amount: 0, noop: true };
                };
                let (noop, residual_size) = book.cancel(order_id);
                let released_amount = match found {
                    Some((user, price)) if !noop => {
                        let amount = price as crate::market::types::Amount * residual_size as crate::market::types::Amount;
                        let _ = self.ledger.release(user, self.market.id, amount);
                        amount
                    }
                    _ => 0,
                };
                self.events.publish(|seq| MarketEvent::OrderCancelled {
                    seq,
                    market_id: self.market.id,
                    order_id,
                    released_amount,
                    noop,
                });
                CancelResult { released_amount, noop }
            }
            Engine::Amm(_) => CancelResult { released_amount: 0, noop: true },
        }
    }

    fn handle_transition(&mut self, target: MarketState, resolution: Option<Resolution>) -> Result<(), CoordinatorError> {
        let legal = matches!(
            (self.market.state, target),
            (MarketState::Draft, MarketState::Active)
                | (MarketState::Active, MarketState::Paused)
                | (MarketState::Paused, MarketState::Active)
                | (MarketState::Active, MarketState::Resolved)
                | (MarketState::Active, MarketState::Cancelled)
                | (MarketState::Paused, MarketState::Cancelled)
                | (MarketState::Draft, MarketState::Cancelled)
        );
        if !legal {
            return Err(RiskRejection::MarketNotTradable.into());
        }
        self.market.state = target;
        if target == MarketState::Resolved {
            self.market.resolution = resolution;
        }
        info!(market_id = self.market.id, ?target, "market lifecycle transition");
        self.events.publish(|seq| MarketEvent::MarketStateChanged { seq, market_id: self.market.id, state: target });
        if target == MarketState::Resolved {
            if let Some(res) = resolution {
                self.events.publish(|seq| MarketEvent::MarketResolved {
                    seq,
                    market_id: self.market.id,
                    outcome: res.outcome,
                    timestamp_ns: res.resolved_at_ns,
                });
            }
        }
        Ok(())
    }
}

fn submit_to_book(
    ledger: &Ledger,
    market_id: MarketId,
    events: &mut EventPublisher,
    book: &mut OrderBook,
    order: Order,
    reservation: crate::market::types::Amount,
) -> Result<SubmitResult, CoordinatorError> {
    match book.submit(order.clone()) {
        Ok(outcome) => {
            for trade in &outcome.trades {
                ledger.settle_trade(
                    trade.buyer_user_id,
                    trade.seller_user_id,
                    market_id,
                    trade.outcome,
                    trade.price,
                    trade.size,
                )?;
            }
            // Any collateral reserved beyond what the resting/filled order
            // still needs is released back to the trader: a cancelled
            // incoming order (self-trade prevention) releases everything,
            // while a resting limit order keeps exactly its residual
            // reservation.
            let still_needed = match outcome.order.kind {
                OrderKind::Limit if !outcome.order.state.is_terminal() => {
                    risk::required_reservation(&Order { size: outcome.order.residual(), ..outcome.order.clone() })
                }
                _ => 0,
            };
            let to_release = reservation - still_needed;
            if to_release > 0 {
                let _ = ledger.release(order.user_id, market_id, to_release);
            }
            Ok(SubmitResult { order_id: outcome.order.id, trades: outcome.trades })
        }
        Err(e) => {
            let _ = ledger.release(order.user_id, market_id, reservation);
            events.publish(|seq| MarketEvent::OrderRejected {
                seq,
                market_id,
                order_id: order.id,
                reason: match e {
                    MatchError::InsufficientLiquidity => RejectReason::InsufficientLiquidity,
                    MatchError::InvalidSize => RejectReason::InvalidSize,
                    MatchError::InvalidPrice => RejectReason::InvalidPrice,
                    _ => RejectReason::Unknown(e.to_string()),
                },
            });
            Err(e.into())
        }
    }
}

fn submit_to_amm(
    ledger: &Ledger,
    market_id: MarketId,
    pool: &mut AmmPool,
    order: Order,
    reservation: crate::market::types::Amount,
) -> Result<SubmitResult, CoordinatorError> {
    let quote = pool.quote(order.outcome, order.size, order.side)?;
    if quote.required_input > reservation {
        let _ = ledger.release(order.user_id, market_id, reservation);
        return Err(AmmError::InsufficientLiquidity.into());
    }
    let trade = pool.swap(order.outcome, order.size, quote.required_input, order.user_id)?;
    ledger.settle_trade(
        trade.buyer_user_id,
        trade.seller_user_id,
        market_id,
        order.outcome,
        trade.price,
        trade.size,
    )?;
    let leftover = reservation - quote.required_input;
    if leftover > 0 {
        let _ = ledger.release(order.user_id, market_id, leftover);
    }
    Ok(SubmitResult { order_id: order.id, trades: vec![trade] })
}

fn reject_reason_for(r: &RiskRejection) -> RejectReason {
    match r {
        RiskRejection::UnknownMarket => RejectReason::UnknownMarket,
        RiskRejection::MarketNotTradable => RejectReason::MarketNotTradable,
        RiskRejection::NotAccredited => RejectReason::NotAccredited,
        RiskRejection::InvalidSize => RejectReason::InvalidSize,
        RiskRejection::InvalidPrice => RejectReason::InvalidPrice,
        RiskRejection::OverPositionCap => RejectReason::OverPositionCap,
        RiskRejection::InsufficientFunds => RejectReason::InsufficientFunds,
    }
}

/// Handle held by callers (HTTP layer, CLI, tests) to talk to a market's
/// writer task. Cloning is cheap; every clone shares the same bounded
/// channel, so backpressure is shared too.
#[derive(Clone)]
pub struct MarketHandle {
    tx: mpsc::Sender<Command>,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MarketCoordinatorConfig {
    pub writer_channel_capacity: usize,
    pub event_channel_capacity: usize,
    pub send_deadline: std::time::Duration,
    /// Take an engine-state checkpoint every this many journaled commands.
    pub checkpoint_interval: u64,
}

impl Default for MarketCoordinatorConfig {
    fn default() -> Self {
        Self {
            writer_channel_capacity: 1024,
            event_channel_capacity: 1024,
            send_deadline: std::time::Duration::from_millis(50),
            checkpoint_interval: 100,
        }
    }
}

impl MarketHandle {
    pub async fn submit(&self, order: Order, accredited: bool, deadline: std::time::Duration) -> Result<SubmitResult, CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        match tokio::time::timeout(deadline, self.tx.send(Command::Submit { order, accredited, respond: tx })).await {
            Ok(Ok(())) => rx.await.unwrap_or(Err(CoordinatorError::MarketBusy)),
            _ => Err(CoordinatorError::MarketBusy),
        }
    }

    pub async fn cancel(&self, order_id: OrderId) -> CancelResult {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Cancel { order_id, respond: tx }).await.is_err() {
            return CancelResult { released_amount: 0, noop: true };
        }
        rx.await.unwrap_or(CancelResult { released_amount: 0, noop: true })
    }

    pub async fn transition(&self, target: MarketState, resolution: Option<Resolution>) -> Result<(), CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Transition { target, resolution, respond: tx }).await.is_err() {
            return Err(CoordinatorError::MarketBusy);
        }
        rx.await.unwrap_or(Err(CoordinatorError::MarketBusy))
    }

    pub async fn position_holders(&self) -> Vec<(UserId, OutcomeIndex)> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::PositionHolders { respond: tx }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn market_snapshot(&self) -> Option<Market> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::MarketSnapshot { respond: tx }).await.is_err() {
            return None;
        }
        rx.await.ok()
    }

    pub async fn quote_amm(
        &self,
        outcome: OutcomeIndex,
        size: crate::market::types::Size,
        side: crate::market::types::Side,
    ) -> Result<crate::market::amm::Quote, CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::QuoteAmm { outcome, size, side, respond: tx }).await.is_err() {
            return Err(CoordinatorError::MarketBusy);
        }
        rx.await.unwrap_or(Err(CoordinatorError::MarketBusy))
    }

    pub async fn add_liquidity(
        &self,
        provider: UserId,
        amounts: Vec<crate::market::types::Amount>,
    ) -> Result<crate::market::types::Amount, CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::AddLiquidity { provider, amounts, respond: tx }).await.is_err() {
            return Err(CoordinatorError::MarketBusy);
        }
        rx.await.unwrap_or(Err(CoordinatorError::MarketBusy))
    }

    pub async fn remove_liquidity(
        &self,
        provider: UserId,
        shares: crate::market::types::Amount,
    ) -> Result<Vec<crate::market::types::Amount>, CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::RemoveLiquidity { provider, shares, respond: tx }).await.is_err() {
            return Err(CoordinatorError::MarketBusy);
        }
        rx.await.unwrap_or(Err(CoordinatorError::MarketBusy))
    }
}

/// Top-level registry: one writer task per market, created on
/// `create_market` and kept for the market's lifetime.
pub struct MarketCoordinator {
    ledger: Arc<Ledger>,
    journal: Arc<Journal>,
    config: MarketCoordinatorConfig,
    handles: HashMap<MarketId, MarketHandle>,
    subscribers: HashMap<MarketId, tokio::sync::broadcast::Sender<MarketEvent>>,
    settlement: Option<Arc<crate::market::dispatch::SettlementDispatcher>>,
    /// Memoizes `market_snapshot` reads: market metadata rarely changes
    /// (a handful of lifecycle transitions over a market's life) but a
    /// busy read path can ask for it far more often than that, so each
    /// entry is tagged with its own key and invalidated the moment
    /// `resolve_and_settle` transitions that market.
    metadata_cache: Arc<Cache<Option<Market>>>,
}

impl MarketCoordinator {
    pub fn new(ledger: Arc<Ledger>, journal: Arc<Journal>, config: MarketCoordinatorConfig) -> Self {
        Self::with_cache_config(ledger, journal, config, CacheConfig::default())
    }

    pub fn with_cache_config(
        ledger: Arc<Ledger>,
        journal: Arc<Journal>,
        config: MarketCoordinatorConfig,
        cache_config: CacheConfig,
    ) -> Self {
        Self {
            ledger,
            journal,
            config,
            handles: HashMap::new(),
            subscribers: HashMap::new(),
            settlement: None,
            metadata_cache: Arc::new(Cache::new(cache_config, Arc::new(InProcessBackend::default()))),
        }
    }

    /// Wire a `SettlementDispatcher` so `resolve_and_settle` can defer the
    /// audit-log write to the Task Queue. Without one, resolution still
    /// works via `MarketHandle::transition` directly, but `resolve_and_settle`
    /// returns `SettlementUnavailable`.
    pub fn with_settlement_dispatcher(mut self, dispatcher: Arc<crate::market::dispatch::SettlementDispatcher>) -> Self {
        self.settlement = Some(dispatcher);
        self
    }

    /// Cached read of a market's current metadata (kind, state, resolution,
    /// ...). Goes straight to the writer task on a cache miss, same as
    /// `MarketHandle::market_snapshot`; a hit skips the round trip through
    /// the writer's command queue entirely. Cache entries are invalidated
    /// by `resolve_and_settle`; a transition applied via `MarketHandle`
    /// directly can leave this stale for up to the cache's TTL.
    pub async fn market_snapshot(&self, market_id: MarketId) -> Option<Market> {
        let handle = self.handles.get(&market_id)?.clone();
        let key = market_id.to_string();
        self.metadata_cache
            .get_or_load(&key, &[key.clone()], || async move { handle.market_snapshot().await })
            .await
    }

    /// Transitions `market_id` to `Resolved`, pays out every position
    /// holder against the ledger, and hands the audit-log write to the
    /// Task Queue. Returns the background task's id, or `None` if the
    /// resolution produced no payouts (e.g. it already ran once).
    pub async fn resolve_and_settle(
        &self,
        market_id: MarketId,
        resolution: Resolution,
    ) -> Result<Option<crate::resilience::task_queue::TaskId>, CoordinatorError> {
        let handle = self.handles.get(&market_id).ok_or(CoordinatorError::UnknownMarket)?;
        let dispatcher = self.settlement.as_ref().ok_or(CoordinatorError::SettlementUnavailable)?;

        handle.transition(MarketState::Resolved, Some(resolution)).await?;
        self.metadata_cache.invalidate(&market_id.to_string()).await;
        let market = handle.market_snapshot().await.ok_or(CoordinatorError::UnknownMarket)?;
        let holders = handle.position_holders().await;
        Ok(dispatcher.settle_and_dispatch(&self.ledger, &market, &holders))
    }

    pub fn create_market(
        &mut self,
        market: Market,
        book_config: BookConfig,
        amm_config: AmmConfig,
    ) -> MarketHandle {
        let market_id = market.id;
        let definition = MarketDefinition { market: market.clone(), book_config, amm_config };
        match serde_json::to_string(&definition) {
            Ok(json) => {
                if let Err(e) = self.journal.save_market_definition(market_id, now_ns(), &json) {
                    tracing::error!(error = %e, market_id, "failed to persist market definition");
                }
            }
            Err(e) => tracing::error!(error = %e, market_id, "failed to serialize market definition"),
        }

        let (tx, rx) = mpsc::channel(self.config.writer_channel_capacity);
        let events = EventPublisher::new(self.config.event_channel_capacity);
        self.subscribers.insert(market_id, events.sender());

        let engine = match market.engine {
            EngineKind::OrderBook => Engine::Book(HashMap::new()),
            EngineKind::Amm => Engine::Amm(AmmPool::new(market_id, market.outcome_count(), amm_config)),
        };

        let writer = MarketWriter {
            market,
            engine,
            book_config,
            ledger: self.ledger.clone(),
            events,
            rx,
            next_order_id: 1,
            holders: std::collections::HashSet::new(),
            journal: self.journal.clone(),
            journal_seq: 0,
            checkpoint_interval: self.config.checkpoint_interval,
        };
        tokio::spawn(async move {
            writer.run().await;
        });

        let handle = MarketHandle { tx };
        self.handles.insert(market_id, handle.clone());
        handle
    }

    pub fn handle(&self, market_id: MarketId) -> Option<&MarketHandle> {
        self.handles.get(&market_id)
    }

    /// Subscribe to a market's event stream without going through its
    /// writer task — safe because the broadcast sender was cloned out at
    /// `create_market` time and stays valid for the market's lifetime.
    pub fn subscribe(&self, market_id: MarketId) -> Option<tokio::sync::broadcast::Receiver<MarketEvent>> {
        self.subscribers.get(&market_id).map(|tx| tx.subscribe())
    }

    /// Rebuilds every market this journal has a persisted definition for:
    /// restores engine state from its latest checkpoint (or starts fresh if
    /// it never checkpointed), then replays the command rows journalled
    /// since that checkpoint through the same `handle_*` methods the live
    /// writer uses, so replay and normal operation can never disagree about
    /// what a command does.
    ///
    /// This reconstructs engine state (resting orders, AMM reserves, each
    /// writer's own `next_order_id`/`holders`/`journal_seq`) faithfully. It
    /// does not reconstruct Ledger balances: the Ledger keeps no journal of
    /// its own, so a replayed command that touches it (reserve, settle)
    /// only succeeds if `ledger` already holds the balances that command's
    /// history expects. A command whose ledger step fails during replay is
    /// logged and skipped rather than aborting the rest of recovery.
    pub fn recover(ledger: Arc<Ledger>, journal: Arc<Journal>, config: MarketCoordinatorConfig) -> rusqlite::Result<Self> {
        Self::recover_with_cache_config(ledger, journal, config, CacheConfig::default())
    }

    pub fn recover_with_cache_config(
        ledger: Arc<Ledger>,
        journal: Arc<Journal>,
        config: MarketCoordinatorConfig,
        cache_config: CacheConfig,
    ) -> rusqlite::Result<Self> {
        let mut coordinator = Self::with_cache_config(ledger, journal.clone(), config, cache_config);
        for market_id in journal.list_market_ids()? {
            if let Err(e) = coordinator.recover_market(market_id) {
                tracing::error!(error = %e, market_id, "failed to recover market from journal, skipping");
            }
        }
        Ok(coordinator)
    }

    fn recover_market(&mut self, market_id: MarketId) -> rusqlite::Result<()> {
        let Some(definition_json) = self.journal.load_market_definition(market_id)? else {
            return Ok(());
        };
        let MarketDefinition { market, book_config, amm_config } = serde_json::from_str(&definition_json)
            .expect("persisted market definition is always well-formed JSON");

        let checkpoint = self.journal.load_latest_checkpoint(market_id)?;
        let (next_order_id, holders, engine, start_seq) = match checkpoint {
            Some((seq, state_json)) => {
                let state: CheckpointState = serde_json::from_str(&state_json)
                    .expect("persisted checkpoint is always well-formed JSON");
                let engine = match state.engine {
                    CheckpointEngine::Book(books) => {
                        let mut rebuilt = HashMap::new();
                        for (outcome, orders) in books {
                            let mut book = OrderBook::new(market_id, outcome, book_config);
                            for order in orders {
                                book.restore_order(order);
                            }
                            rebuilt.insert(outcome, book);
                        }
                        Engine::Book(rebuilt)
                    }
                    CheckpointEngine::Amm { reserves, total_shares, provider_shares, next_trade_id } => {
                        Engine::Amm(AmmPool::restore(market_id, amm_config, reserves, total_shares, provider_shares, next_trade_id))
                    }
                };
                (state.next_order_id, state.holders.into_iter().collect(), engine, seq)
            }
            None => {
                let engine = match market.engine {
                    EngineKind::OrderBook => Engine::Book(HashMap::new()),
                    EngineKind::Amm => Engine::Amm(AmmPool::new(market_id, market.outcome_count(), amm_config)),
                };
                (1, std::collections::HashSet::new(), engine, 0)
            }
        };

        let (tx, rx) = mpsc::channel(self.config.writer_channel_capacity);
        let events = EventPublisher::new(self.config.event_channel_capacity);
        self.subscribers.insert(market_id, events.sender());

        let mut writer = MarketWriter {
            market,
            engine,
            book_config,
            ledger: self.ledger.clone(),
            events,
            rx,
            next_order_id,
            holders,
            journal: self.journal.clone(),
            journal_seq: start_seq,
            checkpoint_interval: self.config.checkpoint_interval,
        };

        for (seq, record) in self.journal.load_since(market_id, start_seq)? {
            writer.journal_seq = seq;
            match record {
                JournalRecord::Submit { order, accredited } => {
                    if let Err(e) = writer.handle_submit(order, accredited) {
                        tracing::warn!(error = %e, market_id, seq, "recovery: replayed submit did not re-apply cleanly");
                    }
                }
                JournalRecord::Cancel { order_id } => {
                    writer.handle_cancel(order_id);
                }
                JournalRecord::Transition { target, resolution } => {
                    if let Err(e) = writer.handle_transition(target, resolution) {
                        tracing::warn!(error = %e, market_id, seq, "recovery: replayed transition did not re-apply cleanly");
                    }
                }
                JournalRecord::AddLiquidity { provider, amounts } => {
                    if let Err(e) = writer.handle_add_liquidity(provider, &amounts) {
                        tracing::warn!(error = %e, market_id, seq, "recovery: replayed add_liquidity did not re-apply cleanly");
                    }
                }
                JournalRecord::RemoveLiquidity { provider, shares } => {
                    if let Err(e) = writer.handle_remove_liquidity(provider, shares) {
                        tracing::warn!(error = %e, market_id, seq, "recovery: replayed remove_liquidity did not re-apply cleanly");
                    }
                }
            }
        }

        tokio::spawn(async move {
            writer.run().await;
        });

        let handle = MarketHandle { tx };
        self.handles.insert(market_id, handle);
        Ok(())
    }
}
