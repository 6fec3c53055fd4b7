//! End-to-end scenario tests driving `MarketCoordinator` the way an
//! external caller (the HTTP layer, `engine_cli`) would: create a market,
//! deposit collateral, submit orders, and check the ledger/book/pool
//! state that comes out the other side.
//!
//! S1, S2, S4, S6 also have unit-level approximations colocated with
//! their owning module (`book.rs`, `amm.rs`, `settlement.rs`); these
//! versions exercise the same scenarios through the full coordinator
//! stack, including the writer task, the journal, and the ledger.
//!
//! The collateral amounts used here are larger than the scenarios'
//! original prose numbers: a short sale reserves against the complement
//! of `MAX_PRICE_TICKS`, not just `price * size` (see
//! `market::risk::required_reservation`), so a seller needs collateral
//! on the order of `MAX_PRICE_TICKS * size`, not `price * size`.

use prediction_engine::market::amm::AmmConfig;
use prediction_engine::market::book::BookConfig;
use prediction_engine::market::coordinator::{CoordinatorError, MarketCoordinator, MarketCoordinatorConfig};
use prediction_engine::market::journal::Journal;
use prediction_engine::market::ledger::Ledger;
use prediction_engine::market::settlement::settle_market_and_record;
use prediction_engine::market::types::{
    EngineKind, Market, MarketKind, MarketOrderPolicy, MarketState, Order, OrderId, OrderKind,
    OrderState, PositionKey, Resolution, Side, UserId,
};
use std::sync::Arc;
use std::time::Duration;

fn mk_limit_order(id: OrderId, market_id: u64, user: UserId, side: Side, price: u32, size: u64) -> Order {
    Order {
        id,
        market_id,
        user_id: user,
        side,
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

fn mk_active_market(id: u64, cap: u64) -> Market {
    let mut m = Market::new(id, MarketKind::Binary, EngineKind::OrderBook, vec!["YES".into(), "NO".into()], cap, false, 0, 1);
    m.state = MarketState::Active;
    m
}

async fn submit(
    coordinator: &MarketCoordinator,
    market_id: u64,
    order: Order,
) -> Result<prediction_engine::market::coordinator::SubmitResult, CoordinatorError> {
    coordinator
        .handle(market_id)
        .expect("market exists")
        .submit(order, false, Duration::from_millis(500))
        .await
}

/// S1. A posts limit buy 100 @ 60, B posts limit sell 100 @ 60: one trade
/// fills both completely and total ledger balance is conserved.
#[tokio::test]
async fn s1_simple_cross() {
    let ledger = Arc::new(Ledger::new(true));
    let journal = Arc::new(Journal::open_memory().unwrap());
    let mut coordinator = MarketCoordinator::new(ledger.clone(), journal, MarketCoordinatorConfig::default());
    let market = mk_active_market(1, 1000);
    coordinator.create_market(market, BookConfig::default(), AmmConfig::default());

    ledger.deposit(1, 10_000);
    ledger.deposit(2, 2_000_000);

    let total_before = ledger.snapshot(1).total() + ledger.snapshot(2).total();

    submit(&coordinator, 1, mk_limit_order(0, 1, 1, Side::Buy, 60, 100)).await.unwrap();
    let result = submit(&coordinator, 1, mk_limit_order(0, 1, 2, Side::Sell, 60, 100)).await.unwrap();

    assert_eq!(result.trades.len(), 1);
    assert_eq!(result.trades[0].price, 60);
    assert_eq!(result.trades[0].size, 100);

    let a_pos = ledger.position(PositionKey { user_id: 1, market_id: 1, outcome: 0 });
    assert_eq!(a_pos.quantity, 100);
    let a_balance = ledger.snapshot(1);
    assert_eq!(a_balance.reserved, 0);
    assert_eq!(a_balance.available, 10_000 - 60 * 100);

    let b_pos = ledger.position(PositionKey { user_id: 2, market_id: 1, outcome: 0 });
    assert_eq!(b_pos.quantity, -100);

    let total_after = ledger.snapshot(1).total() + ledger.snapshot(2).total();
    assert_eq!(total_before, total_after);
}

/// S2. A posts limit buy 100 @ 60, B posts limit sell 40 @ 60, then A's
/// resting order is cancelled: the partial fill settles, and cancelling
/// the residual releases exactly its reservation.
#[tokio::test]
async fn s2_partial_fill_then_cancel() {
    let ledger = Arc::new(Ledger::new(true));
    let journal = Arc::new(Journal::open_memory().unwrap());
    let mut coordinator = MarketCoordinator::new(ledger.clone(), journal, MarketCoordinatorConfig::default());
    let market = mk_active_market(1, 1000);
    coordinator.create_market(market, BookConfig::default(), AmmConfig::default());

    ledger.deposit(1, 10_000);
    ledger.deposit(2, 2_000_000);

    let a_submit = submit(&coordinator, 1, mk_limit_order(0, 1, 1, Side::Buy, 60, 100)).await.unwrap();
    let a_order_id = a_submit.order_id;
    assert_eq!(ledger.snapshot(1).reserved, 6_000);

    let c_result = submit(&coordinator, 1, mk_limit_order(0, 1, 2, Side::Sell, 60, 40)).await.unwrap();
    assert_eq!(c_result.trades.len(), 1);
    assert_eq!(c_result.trades[0].size, 40);

    // A is filled 40, residual 60 @ 60 = 3600 ticks still reserved.
    assert_eq!(ledger.snapshot(1).reserved, 3_600);
    assert_eq!(ledger.snapshot(1).available, 10_000 - 6_000 + (6_000 - 3_600));

    let cancel = coordinator.handle(1).unwrap().cancel(a_order_id).await;
    assert!(!cancel.noop);
    assert_eq!(cancel.released_amount, 3_600);
    assert_eq!(ledger.snapshot(1).reserved, 0);
    assert_eq!(ledger.snapshot(1).available, 10_000 - 60 * 40);
}

/// S3. A market buy with an all-or-none policy against insufficient resting
/// liquidity is rejected outright, with no residual ledger movement.
#[tokio::test]
async fn s3_market_order_all_or_none_rejected_on_insufficient_liquidity() {
    let ledger = Arc::new(Ledger::new(true));
    let journal = Arc::new(Journal::open_memory().unwrap());
    let mut coordinator = MarketCoordinator::new(ledger.clone(), journal, MarketCoordinatorConfig::default());
    let market = mk_active_market(1, 1000);
    let mut book_config = BookConfig::default();
    book_config.market_order_policy = MarketOrderPolicy::AllOrNone;
    coordinator.create_market(market, book_config, AmmConfig::default());

    ledger.deposit(1, 2_000_000);
    ledger.deposit(2, 2_000_000);

    submit(&coordinator, 1, mk_limit_order(0, 1, 1, Side::Sell, 60, 50)).await.unwrap();
    let balance_before = ledger.snapshot(2);

    let market_buy = Order {
        id: 0,
        market_id: 1,
        user_id: 2,
        side: Side::Buy,
        outcome: 0,
        kind: OrderKind::Market,
        price: None,
        size: 100,
        filled_size: 0,
        state: OrderState::Open,
        submit_time_ns: 0,
        last_update_ns: 0,
    };
    let result = submit(&coordinator, 1, market_buy).await;
    assert!(matches!(
        result,
        Err(CoordinatorError::Match(prediction_engine::market::book::MatchError::InsufficientLiquidity))
    ));
    let balance_after = ledger.snapshot(2);
    assert_eq!(balance_after.available, balance_before.available);
    assert_eq!(balance_after.reserved, balance_before.reserved);
}

/// S4. An AMM pool seeded with (1000, 1000) and a buy of 100 YES requires
/// the constant-product input, ceiling-rounded in the pool's favor.
#[tokio::test]
async fn s4_amm_swap_charges_ceiling_rounded_input() {
    let ledger = Arc::new(Ledger::new(true));
    let journal = Arc::new(Journal::open_memory().unwrap());
    let mut coordinator = MarketCoordinator::new(ledger.clone(), journal, MarketCoordinatorConfig::default());
    let mut market = mk_active_market(1, 1_000_000);
    market.engine = EngineKind::Amm;
    coordinator.create_market(market, BookConfig::default(), AmmConfig::default());

    ledger.deposit(1, 2_000_000);
    coordinator.handle(1).unwrap().add_liquidity(1, vec![1000, 1000]).await.unwrap();

    ledger.deposit(2, 2_000_000);
    let balance_before = ledger.snapshot(2).available;

    let buy = Order {
        id: 0,
        market_id: 1,
        user_id: 2,
        side: Side::Buy,
        outcome: 0,
        kind: OrderKind::Market,
        price: None,
        size: 100,
        filled_size: 0,
        state: OrderState::Open,
        submit_time_ns: 0,
        last_update_ns: 0,
    };
    let result = submit(&coordinator, 1, buy).await.unwrap();
    assert_eq!(result.trades.len(), 1);
    assert_eq!(result.trades[0].size, 100);

    // (900) * (1000 + x) = 1000 * 1000 -> x = 111.111..., ceiling-rounded to 112.
    let charged = balance_before - ledger.snapshot(2).available;
    assert_eq!(charged, 112);
}

/// S5. A circuit breaker trips after enough failures within its window and
/// recovers through a half-open probe once the cooldown elapses.
#[tokio::test]
async fn s5_circuit_breaker_trips_and_recovers() {
    use prediction_engine::resilience::circuit_breaker::{BreakerRejection, CircuitBreakerConfig, CircuitRegistry, CircuitState};

    let config = CircuitBreakerConfig {
        window_size: 10,
        min_samples: 5,
        failure_rate_threshold: 0.5,
        slow_rate_threshold: 1.0,
        slow_call_threshold: Duration::from_secs(10),
        cooldown: Duration::from_millis(200),
        max_cooldown: Duration::from_secs(5),
        half_open_probes: 1,
    };
    let registry = CircuitRegistry::new(config);

    for _ in 0..5 {
        let outcome = registry.call("dependency", || async { Err::<(), _>("boom") }).await;
        assert!(outcome.is_ok(), "call itself should be attempted while closed");
    }
    assert_eq!(registry.state("dependency"), CircuitState::Open);

    let rejected = registry.call("dependency", || async { Ok::<_, &str>(()) }).await;
    assert!(matches!(rejected, Err(BreakerRejection::CircuitOpen)));

    tokio::time::sleep(Duration::from_millis(250)).await;

    let probe = registry.call("dependency", || async { Ok::<_, &str>(()) }).await;
    assert!(probe.is_ok() && probe.unwrap().is_ok());
    assert_eq!(registry.state("dependency"), CircuitState::Closed);
}

/// S6. Market resolves to outcome 0 (YES); the winning holder is paid, the
/// losing holder's position is cleared, and re-running settlement is a
/// no-op.
#[tokio::test]
async fn s6_settlement_payout() {
    let ledger = Arc::new(Ledger::new(true));
    let journal = Arc::new(Journal::open_memory().unwrap());
    let mut coordinator = MarketCoordinator::new(ledger.clone(), journal.clone(), MarketCoordinatorConfig::default());
    let market = mk_active_market(1, 1000);
    let handle = coordinator.create_market(market, BookConfig::default(), AmmConfig::default());

    ledger.deposit(1, 10_000);
    ledger.deposit(2, 2_000_000);
    submit(&coordinator, 1, mk_limit_order(0, 1, 1, Side::Buy, 60, 100)).await.unwrap();
    submit(&coordinator, 1, mk_limit_order(0, 1, 2, Side::Sell, 60, 100)).await.unwrap();

    let holders = handle.position_holders().await;
    assert_eq!(holders.len(), 2);

    handle
        .transition(
            MarketState::Resolved,
            Some(Resolution { outcome: 0, scalar_value: None, resolved_at_ns: 500 }),
        )
        .await
        .unwrap();

    let mut resolved_market = mk_active_market(1, 1000);
    resolved_market.state = MarketState::Resolved;
    resolved_market.resolution = Some(Resolution { outcome: 0, scalar_value: None, resolved_at_ns: 500 });

    let a_before = ledger.snapshot(1).available;
    let records = settle_market_and_record(&ledger, &journal, &resolved_market, &holders, 500);
    assert_eq!(records.len(), 2);

    let unit = prediction_engine::market::types::MAX_PRICE_TICKS as i128 + 1;
    assert_eq!(ledger.snapshot(1).available, a_before + 100 * unit);
    let b_pos = ledger.position(PositionKey { user_id: 2, market_id: 1, outcome: 0 });
    assert_eq!(b_pos.quantity, 0);
    assert_eq!(ledger.snapshot(2).reserved, 0);

    let second = settle_market_and_record(&ledger, &journal, &resolved_market, &holders, 600);
    assert!(second.is_empty());
    assert_eq!(journal.settlement_count(1).unwrap(), 2);
}
