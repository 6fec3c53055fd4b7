//! Central limit order book: price-time priority matching, one instance per
//! (market, outcome).
//!
//! Grounded on `backtest_v2::matching`'s `LimitOrderBook`/`PriceLevel`/
//! `MatchAction` shape (bids and asks as `BTreeMap<PriceTicks, PriceLevel>`
//! of FIFO `VecDeque`s, a two-phase collect-then-apply match pass) but
//! reworked to integer `PriceTicks`/`Size` throughout and to the four
//! self-trade-prevention modes in `market::types::SelfTradeMode` instead of
//! the teacher's single on/off switch.
//!
//! Reservation and release of ledger collateral happen one layer up, in the
//! Market Coordinator: this module only matches and reports what it
//! matched. That keeps the book a pure, synchronously-testable data
//! structure with no lock or I/O dependency of its own.

use crate::market::types::{
    MarketOrderPolicy, Order, OrderId, OrderKind, OrderState, OutcomeIndex, PriceTicks, Side,
    SelfTradeMode, Size, Trade, TradeId, UserId,
};
use std::collections::{BTreeMap, HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchError {
    InvalidSize,
    InvalidPrice,
    InsufficientLiquidity,
    UnknownOrder,
    AlreadyTerminal,
}

impl std::fmt::Display for MatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchError::InvalidSize => write!(f, "order size must be positive"),
            MatchError::InvalidPrice => write!(f, "price outside the configured grid"),
            MatchError::InsufficientLiquidity => write!(f, "insufficient liquidity to fill order"),
            MatchError::UnknownOrder => write!(f, "no such order in this book"),
            MatchError::AlreadyTerminal => write!(f, "order already in a terminal state"),
        }
    }
}

impl std::error::Error for MatchError {}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BookConfig {
    pub max_price_ticks: PriceTicks,
    pub market_order_policy: MarketOrderPolicy,
    pub self_trade_mode: SelfTradeMode,
}

impl Default for BookConfig {
    fn default() -> Self {
        Self {
            max_price_ticks: crate::market::types::MAX_PRICE_TICKS,
            market_order_policy: MarketOrderPolicy::PartialOk,
            self_trade_mode: SelfTradeMode::default(),
        }
    }
}

#[derive(Debug, Default)]
struct PriceLevel {
    orders: VecDeque<OrderId>,
    total_size: Size,
}

/// Outcome of matching one incoming order, collected against immutable book
/// state before any mutation happens (mirrors `matching.rs`'s
/// `collect_match_actions` / `apply_fill` split, which exists so the match
/// loop never holds a mutable borrow of a price level while still reading
/// it).
#[derive(Debug, Clone)]
enum MatchAction {
    Fill { maker_order_id: OrderId, price: PriceTicks, size: Size },
    /// Self-trade prevention voided both sides of a would-be match without
    /// recording a trade (`DecrementAndCancel`).
    VoidSelfMatch { maker_order_id: OrderId, size: Size },
    CancelMaker { order_id: OrderId },
    CancelIncoming,
}

pub struct SubmitOutcome {
    pub trades: Vec<Trade>,
    pub cancelled_makers: Vec<OrderId>,
    pub order: Order,
}

pub struct OrderBook {
    pub market_id: crate::market::types::MarketId,
    pub outcome: OutcomeIndex,
    config: BookConfig,
    bids: BTreeMap<PriceTicks, PriceLevel>,
    asks: BTreeMap<PriceTicks, PriceLevel>,
    orders: HashMap<OrderId, Order>,
    next_trade_id: TradeId,
}

impl OrderBook {
    pub fn new(market_id: crate::market::types::MarketId, outcome: OutcomeIndex, config: BookConfig) -> Self {
        Self {
            market_id,
            outcome,
            config,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            orders: HashMap::new(),
            next_trade_id: 1,
        }
    }

    fn side_levels(&self, side: Side) -> &BTreeMap<PriceTicks, PriceLevel> {
        match side {
            Side::Buy => &self.asks,
            Side::Sell => &self.bids,
        }
    }

    fn side_levels_mut(&mut self, side: Side) -> &mut BTreeMap<PriceTicks, PriceLevel> {
        match side {
            Side::Buy => &mut self.asks,
            Side::Sell => &mut self.bids,
        }
    }

    pub fn best_bid(&self) -> Option<PriceTicks> {
        self.bids.keys().next_back().copied()
    }

    pub fn best_ask(&self) -> Option<PriceTicks> {
        self.asks.keys().next().copied()
    }

    /// Property 4: after any submit returns, the book must not be crossed.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    fn opposing_top(&self, incoming_side: Side) -> Option<PriceTicks> {
        match incoming_side {
            Side::Buy => self.best_ask(),
            Side::Sell => self.best_bid(),
        }
    }

    fn crosses(&self, incoming: &Order, top: PriceTicks) -> bool {
        if incoming.kind == OrderKind::Market {
            return true;
        }
        let limit = incoming.price.expect("limit order must carry a price");
        match incoming.side {
            Side::Buy => limit >= top,
            Side::Sell => limit <= top,
        }
    }

    /// Submit a new order. Collateral reservation is the caller's
    /// responsibility (see module docs); this only matches and books the
    /// residual.
    pub fn submit(&mut self, mut order: Order) -> Result<SubmitOutcome, MatchError> {
        if order.size == 0 {
            return Err(MatchError::InvalidSize);
        }
        if order.kind == OrderKind::Limit {
            let price = order.price.ok_or(MatchError::InvalidPrice)?;
            if price < crate::market::types::MIN_PRICE_TICKS || price > self.config.max_price_ticks {
                return Err(MatchError::InvalidPrice);
            }
        }

        if order.kind == OrderKind::Market
            && self.config.market_order_policy == MarketOrderPolicy::AllOrNone
            && !self.can_fill_fully(order.side, order.size)
        {
            return Err(MatchError::InsufficientLiquidity);
        }

        let mut trades = Vec::new();
        let mut cancelled_makers = Vec::new();

        loop {
            if order.residual() == 0 {
                break;
            }
            let Some(top) = self.opposing_top(order.side) else { break };
            if !self.crosses(&order, top) {
                break;
            }

            let actions = self.collect_match_actions(&order, top);
            if actions.is_empty() {
                break;
            }
            let mut incoming_cancelled = false;
            for action in actions {
                match action {
                    MatchAction::Fill { maker_order_id, price, size } => {
                        let trade = self.apply_fill(&mut order, maker_order_id, price, size);
                        trades.push(trade);
                    }
                    MatchAction::VoidSelfMatch { maker_order_id, size } => {
                        self.apply_void(&mut order, maker_order_id, size);
                    }
                    MatchAction::CancelMaker { order_id } => {
                        self.remove_order(order_id, OrderState::Cancelled);
                        cancelled_makers.push(order_id);
                    }
                    MatchAction::CancelIncoming => {
                        order.state = OrderState::Cancelled;
                        incoming_cancelled = true;
                    }
                }
            }
            if incoming_cancelled || order.residual() == 0 {
                break;
            }
        }

        if order.state != OrderState::Cancelled {
            if order.residual() > 0 {
                match order.kind {
                    OrderKind::Market => {
                        // All-or-none liquidity was already checked before
                        // any matching began, so reaching here means
                        // PartialOk ran out of opposing liquidity partway
                        // through. The filled portion's trades stand, but
                        // the order as a whole did not fill to size, so it
                        // is cancelled rather than reported as `Filled`
                        // (which the book reserves for orders whose
                        // residual reached zero).
                        order.state = if order.filled_size == 0 {
                            OrderState::Rejected
                        } else {
                            OrderState::Cancelled
                        };
                    }
                    OrderKind::Limit => {
                        order.state = OrderState::PartiallyFilled;
                        if order.filled_size == 0 {
                            order.state = OrderState::Open;
                        }
                        self.rest(order.clone());
                    }
                }
            } else {
                order.state = OrderState::Filled;
            }
        }

        Ok(SubmitOutcome { trades, cancelled_makers, order })
    }

    /// All-or-none market orders must be checked for total available
    /// liquidity *before* any matching starts, since the matcher itself
    /// does not roll back ledger postings. Callers submitting an
    /// all-or-none market order should call this first and reject locally
    /// on `false` rather than relying on `submit`'s post-hoc check.
    pub fn can_fill_fully(&self, side: Side, size: Size) -> bool {
        let levels = self.side_levels(side.opposite());
        let total: Size = levels.values().map(|l| l.total_size).sum();
        total >= size
    }

    fn collect_match_actions(&self, incoming: &Order, top_price: PriceTicks) -> Vec<MatchAction> {
        let mut actions = Vec::new();
        let mut residual = incoming.residual();
        let levels = self.side_levels(incoming.side.opposite());

        'outer: for (&price, level) in iter_from_top(levels, incoming.side) {
            if price != top_price && !price_still_crosses(incoming, price) {
                break;
            }
            for &maker_id in level.orders.iter() {
                if residual == 0 {
                    break 'outer;
                }
                let maker = &self.orders[&maker_id];
                if maker.user_id == incoming.user_id {
                    match self.config.self_trade_mode {
                        SelfTradeMode::Allow => {}
                        SelfTradeMode::CancelResting => {
                            actions.push(MatchAction::CancelMaker { order_id: maker_id });
                            continue;
                        }
                        SelfTradeMode::CancelIncoming => {
                            actions.push(MatchAction::CancelIncoming);
                            break 'outer;
                        }
                        SelfTradeMode::CancelBoth => {
                            actions.push(MatchAction::CancelMaker { order_id: maker_id });
                            actions.push(MatchAction::CancelIncoming);
                            break 'outer;
                        }
                        SelfTradeMode::DecrementAndCancel => {
                            let void_size = residual.min(maker.residual());
                            actions.push(MatchAction::VoidSelfMatch { maker_order_id: maker_id, size: void_size });
                            residual = residual.saturating_sub(void_size);
                            continue;
                        }
                    }
                }

                let size = residual.min(maker.residual());
                actions.push(MatchAction::Fill { maker_order_id: maker_id, price, size });
                residual = residual.saturating_sub(size);
            }
        }
        actions
    }

    fn apply_fill(&mut self, incoming: &mut Order, maker_id: OrderId, price: PriceTicks, size: Size) -> Trade {
        let maker = self.orders.get_mut(&maker_id).expect("maker order must exist");
        maker.filled_size += size;
        maker.last_update_ns = incoming.last_update_ns;
        let maker_done = maker.residual() == 0;
        let maker_user = maker.user_id;
        let maker_side = maker.side;

        incoming.filled_size += size;

        if maker_done {
            self.remove_order(maker_id, OrderState::Filled);
        } else {
            self.adjust_level_size(maker_side, price, size);
        }

        self.next_trade_id += 1;
        let (buyer_order_id, seller_order_id, buyer_user_id, seller_user_id) = match incoming.side {
            Side::Buy => (incoming.id, maker_id, incoming.user_id, maker_user),
            Side::Sell => (maker_id, incoming.id, maker_user, incoming.user_id),
        };
        Trade {
            id: self.next_trade_id,
            market_id: self.market_id,
            outcome: self.outcome,
            buyer_order_id,
            seller_order_id,
            buyer_user_id,
            seller_user_id,
            price,
            size,
            timestamp_ns: incoming.last_update_ns,
        }
    }

    fn apply_void(&mut self, incoming: &mut Order, maker_id: OrderId, size: Size) {
        let maker_side;
        let maker_done;
        {
            let maker = self.orders.get_mut(&maker_id).expect("maker order must exist");
            maker.filled_size += size; // voided quantity is removed from consideration, not filled economically
            maker_side = maker.side;
            maker_done = maker.residual() == 0;
        }
        incoming.filled_size += size;
        if maker_done {
            self.remove_order(maker_id, OrderState::Cancelled);
        } else if let Some(price) = self.orders.get(&maker_id).and_then(|o| o.price) {
            self.adjust_level_size(maker_side, price, size);
        }
    }

    fn adjust_level_size(&mut self, side: Side, price: PriceTicks, consumed: Size) {
        if let Some(level) = self.side_levels_mut(side).get_mut(&price) {
            level.total_size = level.total_size.saturating_sub(consumed);
        }
    }

    fn remove_order(&mut self, order_id: OrderId, terminal_state: OrderState) {
        if let Some(mut order) = self.orders.remove(&order_id) {
            if let Some(price) = order.price {
                let levels = self.side_levels_mut(order.side);
                if let Some(level) = levels.get_mut(&price) {
                    level.orders.retain(|&id| id != order_id);
                    if level.orders.is_empty() {
                        levels.remove(&price);
                    }
                }
            }
            order.state = terminal_state;
        }
    }

    fn rest(&mut self, order: Order) {
        let price = order.price.expect("resting order must have a price");
        let side = order.side;
        let id = order.id;
        let size = order.residual();
        self.orders.insert(id, order);
        let level = self.side_levels_mut(side).entry(price).or_default();
        level.orders.push_back(id);
        level.total_size += size;
    }

    /// Cancel a resting order. Idempotent: cancelling an order already in a
    /// terminal state (or not present) returns `noop = true`.
    pub fn cancel(&mut self, order_id: OrderId) -> (bool, Size) {
        match self.orders.get(&order_id) {
            None => (true, 0),
            Some(order) if order.state.is_terminal() => (true, 0),
            Some(order) => {
                let residual = order.residual();
                self.remove_order(order_id, OrderState::Cancelled);
                (false, residual)
            }
        }
    }

    pub fn order(&self, order_id: OrderId) -> Option<&Order> {
        self.orders.get(&order_id)
    }

    /// Every resting order in this book, in no particular order. Used by
    /// the Market Coordinator to build a recovery checkpoint; matching
    /// itself never needs an unordered view.
    pub fn open_orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values()
    }

    /// Re-admits an order straight onto the book's resting side, bypassing
    /// matching entirely. Used only to rebuild a book from a checkpoint's
    /// `open_orders` snapshot at startup, where every order was already
    /// resting (and thus already matched against whatever it could be) the
    /// moment the checkpoint was taken.
    pub fn restore_order(&mut self, order: Order) {
        self.rest(order);
    }
}

fn iter_from_top(
    levels: &BTreeMap<PriceTicks, PriceLevel>,
    incoming_side: Side,
) -> Box<dyn Iterator<Item = (&PriceTicks, &PriceLevel)> + '_> {
    // Opposing book for a buy is asks (ascending = best first); for a sell
    // it is bids (descending = best first).
    match incoming_side {
        Side::Buy => Box::new(levels.iter()),
        Side::Sell => Box::new(levels.iter().rev()),
    }
}

fn price_still_crosses(incoming: &Order, price: PriceTicks) -> bool {
    if incoming.kind == OrderKind::Market {
        return true;
    }
    let limit = incoming.price.expect("limit order must carry a price");
    match incoming.side {
        Side::Buy => limit >= price,
        Side::Sell => limit <= price,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_order(id: OrderId, user: UserId, side: Side, price: PriceTicks, size: Size) -> Order {
        Order {
            id,
            market_id: 1,
            user_id: user,
            side,
            outcome: 0,
            kind: OrderKind::Limit,
            price: Some(price),
            size,
            filled_size: 0,
            state: OrderState::Open,
            submit_time_ns: id as i64,
            last_update_ns: id as i64,
        }
    }

    #[test]
    fn resting_limit_order_joins_book() {
        let mut book = OrderBook::new(1, 0, BookConfig::default());
        let outcome = book.submit(mk_order(1, 1, Side::Buy, 60, 100)).unwrap();
        assert!(outcome.trades.is_empty());
        assert_eq!(book.best_bid(), Some(60));
    }

    #[test]
    fn crossing_orders_produce_one_trade_at_maker_price() {
        let mut book = OrderBook::new(1, 0, BookConfig::default());
        book.submit(mk_order(1, 1, Side::Buy, 60, 100)).unwrap();
        let outcome = book.submit(mk_order(2, 2, Side::Sell, 60, 100)).unwrap();
        assert_eq!(outcome.trades.len(), 1);
        let t = &outcome.trades[0];
        assert_eq!(t.price, 60);
        assert_eq!(t.size, 100);
        assert!(!book.is_crossed());
    }

    #[test]
    fn partial_fill_leaves_residual_on_book() {
        let mut book = OrderBook::new(1, 0, BookConfig::default());
        book.submit(mk_order(1, 1, Side::Buy, 60, 100)).unwrap();
        let outcome = book.submit(mk_order(2, 2, Side::Sell, 60, 40)).unwrap();
        assert_eq!(outcome.trades[0].size, 40);
        let resting = book.order(1).unwrap();
        assert_eq!(resting.filled_size, 40);
        assert_eq!(resting.residual(), 60);
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut book = OrderBook::new(1, 0, BookConfig::default());
        book.submit(mk_order(1, 1, Side::Buy, 60, 100)).unwrap();
        let (noop1, released1) = book.cancel(1);
        assert!(!noop1);
        assert_eq!(released1, 100);
        let (noop2, released2) = book.cancel(1);
        assert!(noop2);
        assert_eq!(released2, 0);
    }

    #[test]
    fn self_trade_cancel_incoming_leaves_resting_order_untouched() {
        let mut config = BookConfig::default();
        config.self_trade_mode = SelfTradeMode::CancelIncoming;
        let mut book = OrderBook::new(1, 0, config);
        book.submit(mk_order(1, 1, Side::Buy, 60, 100)).unwrap();
        let outcome = book.submit(mk_order(2, 1, Side::Sell, 60, 100)).unwrap();
        assert!(outcome.trades.is_empty());
        assert_eq!(outcome.order.state, OrderState::Cancelled);
        assert_eq!(book.best_bid(), Some(60));
    }

    #[test]
    fn market_order_all_or_none_rejects_on_insufficient_liquidity() {
        let mut config = BookConfig::default();
        config.market_order_policy = MarketOrderPolicy::AllOrNone;
        let mut book = OrderBook::new(1, 0, config);
        book.submit(mk_order(1, 1, Side::Sell, 60, 50)).unwrap();
        assert!(!book.can_fill_fully(Side::Buy, 100));

        let market_order = Order {
            id: 2,
            market_id: 1,
            user_id: 2,
            side: Side::Buy,
            outcome: 0,
            kind: OrderKind::Market,
            price: None,
            size: 100,
            filled_size: 0,
            state: OrderState::Open,
            submit_time_ns: 2,
            last_update_ns: 2,
        };
        let result = book.submit(market_order);
        assert_eq!(result.unwrap_err(), MatchError::InsufficientLiquidity);
        // No trace of the rejected order's matching attempt was left behind.
        assert_eq!(book.best_ask(), Some(60));
    }
}
