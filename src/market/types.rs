//! Shared identifiers and value types for the matching/settlement core.
//!
//! All monetary and price quantities are plain integers ("ticks"). There is
//! no fixed-point scale factor layered on top: a price tick and a currency
//! tick are the same unit, so `price * size` is already the amount of
//! currency the trade moves. This keeps matching and settlement entirely
//! free of floating point.

use serde::{Deserialize, Serialize};
use std::fmt;

pub type UserId = u64;
pub type MarketId = u64;
pub type OrderId = u64;
pub type TradeId = u64;

/// Price expressed in integer ticks, `1..=MAX_PRICE_TICKS`. Represents a
/// probability: `price as f64 / (MAX_PRICE_TICKS + 1) as f64` if a caller
/// ever needs the fractional view, but the engine itself never computes it.
pub type PriceTicks = u32;

/// Default upper bound of the price grid (`book.price-ticks`).
pub const MAX_PRICE_TICKS: PriceTicks = 9999;
pub const MIN_PRICE_TICKS: PriceTicks = 1;

/// Non-negative integer share count.
pub type Size = u64;

/// Signed integer currency amount, in the same tick unit as [`PriceTicks`].
/// `i128` leaves headroom for accumulating many large positions without
/// overflow, matching how this codebase already sizes its ledger amounts.
pub type Amount = i128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Index into a market's outcome-label set. `0` is the conventional "YES"
/// or first categorical outcome.
pub type OutcomeIndex = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketKind {
    Binary,
    Categorical,
    Scalar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineKind {
    OrderBook,
    Amm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketState {
    Draft,
    Active,
    Paused,
    Resolved,
    Cancelled,
}

impl MarketState {
    pub fn is_tradable(self) -> bool {
        matches!(self, MarketState::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected
        )
    }
}

/// Market order fill policy when the book cannot fully satisfy the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketOrderPolicy {
    PartialOk,
    AllOrNone,
}

/// Self-trade prevention mode, generalized from a single on/off switch to
/// the four resolutions a mature book actually needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelfTradeMode {
    /// Self-trade is allowed; matches the same user against themselves.
    Allow,
    /// Cancel the resting order, let the incoming order continue matching.
    CancelResting,
    /// Cancel the incoming order, leave the resting order in place.
    CancelIncoming,
    /// Cancel both orders.
    CancelBoth,
    /// Consume the smaller side, cancel whichever side empties.
    DecrementAndCancel,
}

impl Default for SelfTradeMode {
    fn default() -> Self {
        SelfTradeMode::CancelIncoming
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    pub id: MarketId,
    pub kind: MarketKind,
    pub engine: EngineKind,
    pub state: MarketState,
    pub outcome_labels: Vec<String>,
    pub per_user_position_cap: Size,
    pub accredited_only: bool,
    pub close_time_ns: i64,
    pub resolver_id: UserId,
    pub resolution: Option<Resolution>,
    /// Scalar-market payoff bounds; unused for binary/categorical markets.
    pub scalar_lower_bound: i64,
    pub scalar_upper_bound: i64,
}

impl Market {
    pub fn new(
        id: MarketId,
        kind: MarketKind,
        engine: EngineKind,
        outcome_labels: Vec<String>,
        per_user_position_cap: Size,
        accredited_only: bool,
        close_time_ns: i64,
        resolver_id: UserId,
    ) -> Self {
        Self {
            id,
            kind,
            engine,
            state: MarketState::Draft,
            outcome_labels,
            per_user_position_cap,
            accredited_only,
            close_time_ns,
            resolver_id,
            resolution: None,
            scalar_lower_bound: 0,
            scalar_upper_bound: MAX_PRICE_TICKS as i64,
        }
    }

    pub fn outcome_count(&self) -> usize {
        self.outcome_labels.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub outcome: OutcomeIndex,
    /// For scalar markets: the settled value within
    /// `[scalar_lower_bound, scalar_upper_bound]`.
    pub scalar_value: Option<i64>,
    pub resolved_at_ns: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub market_id: MarketId,
    pub user_id: UserId,
    pub side: Side,
    pub outcome: OutcomeIndex,
    pub kind: OrderKind,
    pub price: Option<PriceTicks>,
    pub size: Size,
    pub filled_size: Size,
    pub state: OrderState,
    pub submit_time_ns: i64,
    pub last_update_ns: i64,
}

impl Order {
    pub fn residual(&self) -> Size {
        self.size.saturating_sub(self.filled_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub market_id: MarketId,
    pub outcome: OutcomeIndex,
    pub buyer_order_id: OrderId,
    pub seller_order_id: OrderId,
    /// Carried directly on the trade rather than requiring a later order
    /// lookup: a maker order that was fully filled is removed from the
    /// book the instant it fills, so its owner would otherwise be
    /// unrecoverable once matching returns.
    pub buyer_user_id: UserId,
    pub seller_user_id: UserId,
    pub price: PriceTicks,
    pub size: Size,
    pub timestamp_ns: i64,
}

/// AMM trades carry a sentinel seller/buyer order id since there is no
/// resting counterparty order.
pub const AMM_PSEUDO_ORDER_ID: OrderId = 0;

/// Reserved user id for the AMM pool's own ledger account: a swap settles
/// as a normal two-party trade against this pseudo-user, so
/// `Ledger::settle_trade` needs no AMM-specific code path.
pub const AMM_POOL_ACCOUNT: UserId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionKey {
    pub user_id: UserId,
    pub market_id: MarketId,
    pub outcome: OutcomeIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub key: PositionKey,
    /// May be negative: a negative count is a short position in that
    /// outcome, per the Ledger's L3 check (see `ledger.rs`).
    pub quantity: i64,
    pub cost_basis: Amount,
    pub realized_pnl: Amount,
}

impl Position {
    pub fn new(key: PositionKey) -> Self {
        Self {
            key,
            quantity: 0,
            cost_basis: 0,
            realized_pnl: 0,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity == 0
    }
}
