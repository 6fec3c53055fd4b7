//! Prediction-market matching and settlement core: order book and AMM
//! engines, a multi-user ledger, pre-trade risk checks, and the
//! coordinator that ties them together behind one writer task per market.
//!
//! ```text
//! MarketCoordinator
//!   └── MarketWriter (one tokio task per market, serializes all commands)
//!         ├── risk::check_order        (pure, no I/O)
//!         ├── book::OrderBook | amm::AmmPool
//!         ├── ledger::Ledger           (shared, Arc<Mutex<_>>)
//!         └── events::EventPublisher   (broadcast fanout)
//! ```
//!
//! Settlement (`settlement::settle_market`) runs outside the writer task,
//! driven by whatever resolves markets (an oracle feed, an admin action);
//! it only needs a position snapshot and the shared ledger.

pub mod amm;
pub mod book;
pub mod coordinator;
pub mod dispatch;
pub mod events;
pub mod journal;
pub mod ledger;
pub mod risk;
pub mod settlement;
pub mod types;
