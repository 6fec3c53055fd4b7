//! Pre-trade risk gate: a pure function of (user snapshot, market metadata,
//! order) with no I/O of its own.
//!
//! Grounded on `backtest_v2::pre_trade_risk::PreTradeRiskController::check`'s
//! shape — an ordered list of named checks, each producing a pass/fail
//! record — but changed from "run every check and report all of them" to
//! spec §4.5's "return the first failure", since the checks here are
//! genuinely ordered preconditions (a market that doesn't exist makes the
//! position-cap check meaningless) rather than independent risk limits to
//! report on together.

use crate::market::ledger::UserBalance;
use crate::market::types::{Amount, Market, Order, OrderKind, Position};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskRejection {
    UnknownMarket,
    MarketNotTradable,
    NotAccredited,
    InvalidSize,
    InvalidPrice,
    OverPositionCap,
    InsufficientFunds,
}

impl std::fmt::Display for RiskRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskRejection::UnknownMarket => write!(f, "market does not exist"),
            RiskRejection::MarketNotTradable => write!(f, "market is not currently tradable"),
            RiskRejection::NotAccredited => write!(f, "user is not permitted to trade this market"),
            RiskRejection::InvalidSize => write!(f, "order size must be positive"),
            RiskRejection::InvalidPrice => write!(f, "order price is outside the legal range"),
            RiskRejection::OverPositionCap => write!(f, "order would exceed the market's per-user position cap"),
            RiskRejection::InsufficientFunds => write!(f, "insufficient available balance for the required reservation"),
        }
    }
}

impl std::error::Error for RiskRejection {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskCheckRecord {
    pub name: &'static str,
    pub passed: bool,
}

#[derive(Debug, Clone)]
pub struct RiskCheckReport {
    pub checks: Vec<RiskCheckRecord>,
    pub rejection: Option<RiskRejection>,
}

impl RiskCheckReport {
    pub fn is_ok(&self) -> bool {
        self.rejection.is_none()
    }
}

/// Everything the gate needs about the user placing the order; assembled
/// by the caller (Market Coordinator) from the Ledger and accreditation
/// store, never fetched by the gate itself.
pub struct UserSnapshot {
    pub accredited: bool,
    pub balance: UserBalance,
    pub position: Position,
}

/// Computes the collateral a successful submit would reserve, the same way
/// `market::coordinator` does before dispatching to an engine. Exposed here
/// so the gate's "sufficient balance" check uses the exact amount that will
/// actually be reserved.
pub fn required_reservation(order: &Order) -> Amount {
    match order.side {
        crate::market::types::Side::Buy => {
            // Worst case for a buyer is filling at the highest legal price.
            let price = order.price.unwrap_or(crate::market::types::MAX_PRICE_TICKS) as Amount;
            price * order.size as Amount
        }
        crate::market::types::Side::Sell => {
            // Worst case for a seller is filling at the lowest legal price,
            // which maximizes the complement (1 - price) they're on the
            // hook for. A market order has no limit price to fall back on,
            // so substitute MIN_PRICE_TICKS rather than MAX_PRICE_TICKS —
            // using the buy-side default here would reserve the least
            // collateral instead of the most.
            let price = order.price.unwrap_or(crate::market::types::MIN_PRICE_TICKS) as Amount;
            let complement = crate::market::types::MAX_PRICE_TICKS as Amount + 1 - price;
            complement * order.size as Amount
        }
    }
}

/// Run the ordered risk checks and return the first failure, if any. Checks
/// after the first failure are not evaluated (`checks` reflects only the
/// ones that ran) so a caller inspecting the report never mistakes an
/// unevaluated later check for a pass.
pub fn check_order(
    market: Option<&Market>,
    user: &UserSnapshot,
    order: &Order,
) -> RiskCheckReport {
    let mut checks = Vec::new();

    let Some(market) = market else {
        checks.push(RiskCheckRecord { name: "market_exists", passed: false });
        return RiskCheckReport { checks, rejection: Some(RiskRejection::UnknownMarket) };
    };
    checks.push(RiskCheckRecord { name: "market_exists", passed: true });

    if !market.state.is_tradable() {
        checks.push(RiskCheckRecord { name: "market_tradable", passed: false });
        return RiskCheckReport { checks, rejection: Some(RiskRejection::MarketNotTradable) };
    }
    checks.push(RiskCheckRecord { name: "market_tradable", passed: true });

    if market.accredited_only && !user.accredited {
        checks.push(RiskCheckRecord { name: "accredited", passed: false });
        return RiskCheckReport { checks, rejection: Some(RiskRejection::NotAccredited) };
    }
    checks.push(RiskCheckRecord { name: "accredited", passed: true });

    if order.size == 0 {
        checks.push(RiskCheckRecord { name: "size_positive", passed: false });
        return RiskCheckReport { checks, rejection: Some(RiskRejection::InvalidSize) };
    }
    checks.push(RiskCheckRecord { name: "size_positive", passed: true });

    if order.kind == OrderKind::Limit {
        let price_ok = order.price.is_some_and(|p| {
            (crate::market::types::MIN_PRICE_TICKS..=crate::market::types::MAX_PRICE_TICKS).contains(&p)
        });
        if !price_ok {
            checks.push(RiskCheckRecord { name: "price_in_range", passed: false });
            return RiskCheckReport { checks, rejection: Some(RiskRejection::InvalidPrice) };
        }
        checks.push(RiskCheckRecord { name: "price_in_range", passed: true });
    }

    let projected = user.position.quantity.unsigned_abs() + order.size;
    if projected > market.per_user_position_cap {
        checks.push(RiskCheckRecord { name: "position_cap", passed: false });
        return RiskCheckReport { checks, rejection: Some(RiskRejection::OverPositionCap) };
    }
    checks.push(RiskCheckRecord { name: "position_cap", passed: true });

    let reservation = required_reservation(order);
    if user.balance.available < reservation {
        checks.push(RiskCheckRecord { name: "sufficient_balance", passed: false });
        return RiskCheckReport { checks, rejection: Some(RiskRejection::InsufficientFunds) };
    }
    checks.push(RiskCheckRecord { name: "sufficient_balance", passed: true });

    RiskCheckReport { checks, rejection: None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::{EngineKind, MarketKind, MarketState, OrderKind, OrderState, PositionKey, Side};

    fn mk_market() -> Market {
        let mut m = Market::new(1, MarketKind::Binary, EngineKind::OrderBook, vec!["YES".into(), "NO".into()], 1000, false, 0, 1);
        m.state = MarketState::Active;
        m
    }

    fn mk_user(available: Amount) -> UserSnapshot {
        UserSnapshot {
            accredited: false,
            balance: UserBalance { available, reserved: 0 },
            position: Position::new(PositionKey { user_id: 1, market_id: 1, outcome: 0 }),
        }
    }

    fn mk_order(size: u64, price: u32) -> Order {
        Order {
            id: 1,
            market_id: 1,
            user_id: 1,
            side: Side::Buy,
            outcome: 0,
            kind: OrderKind::Limit,
            price: Some(price),
            size,
            filled_size: 0,
            state: OrderState::Open,
            submit_time_ns: 0,
            last_update_ns: 0,
        }
    }

    #[test]
    fn unknown_market_is_first_check() {
        let report = check_order(None, &mk_user(10_000), &mk_order(100, 60));
        assert_eq!(report.rejection, Some(RiskRejection::UnknownMarket));
        assert_eq!(report.checks.len(), 1);
    }

    #[test]
    fn accredited_only_market_rejects_unaccredited_user() {
        let mut market = mk_market();
        market.accredited_only = true;
        let report = check_order(Some(&market), &mk_user(10_000), &mk_order(100, 60));
        assert_eq!(report.rejection, Some(RiskRejection::NotAccredited));
    }

    #[test]
    fn insufficient_balance_is_last_check_and_reports_all_prior_passes() {
        let market = mk_market();
        let report = check_order(Some(&market), &mk_user(10), &mk_order(100, 60));
        assert_eq!(report.rejection, Some(RiskRejection::InsufficientFunds));
        assert_eq!(report.checks.len(), 6);
        assert!(report.checks.iter().take(5).all(|c| c.passed));
    }

    #[test]
    fn well_formed_order_passes_all_checks() {
        let market = mk_market();
        let report = check_order(Some(&market), &mk_user(10_000), &mk_order(100, 60));
        assert!(report.is_ok());
    }

    #[test]
    fn market_sell_reserves_the_full_unit_payout_not_the_minimum() {
        let mut order = mk_order(100, 60);
        order.kind = OrderKind::Market;
        order.price = None;
        order.side = Side::Sell;

        // Worst case is filling at MIN_PRICE_TICKS, which maximizes the
        // complement the seller is on the hook for — not MAX_PRICE_TICKS,
        // which would (wrongly) minimize it to 1 tick per share.
        let complement_at_min_price = crate::market::types::MAX_PRICE_TICKS as Amount + 1 - crate::market::types::MIN_PRICE_TICKS as Amount;
        assert_eq!(required_reservation(&order), complement_at_min_price * 100);
    }

    #[test]
    fn market_buy_still_reserves_at_the_worst_case_max_price() {
        let mut order = mk_order(100, 60);
        order.kind = OrderKind::Market;
        order.price = None;
        assert_eq!(required_reservation(&order), crate::market::types::MAX_PRICE_TICKS as Amount * 100);
    }
}
