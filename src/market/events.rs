//! Per-market causal event stream.
//!
//! Mirrors `backtest_v2::events`'s tagged-enum event model: every event
//! carries enough identity to route and order it, and the stream itself is
//! a `tokio::sync::broadcast` channel per market so many subscribers can
//! fan out from one producer without backpressuring the market writer.

use crate::market::types::{MarketId, OrderId, OutcomeIndex, Trade};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RejectReason {
    UnknownMarket,
    MarketNotTradable,
    NotAccredited,
    InvalidSize,
    InvalidPrice,
    OverPositionCap,
    InsufficientFunds,
    InsufficientLiquidity,
    SelfTrade,
    Unknown(String),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::UnknownMarket => write!(f, "unknown market"),
            RejectReason::MarketNotTradable => write!(f, "market not tradable"),
            RejectReason::NotAccredited => write!(f, "user not permitted for this market"),
            RejectReason::InvalidSize => write!(f, "invalid order size"),
            RejectReason::InvalidPrice => write!(f, "invalid order price"),
            RejectReason::OverPositionCap => write!(f, "order would exceed position cap"),
            RejectReason::InsufficientFunds => write!(f, "insufficient available balance"),
            RejectReason::InsufficientLiquidity => write!(f, "insufficient liquidity"),
            RejectReason::SelfTrade => write!(f, "self-trade prevented"),
            RejectReason::Unknown(s) => write!(f, "{}", s),
        }
    }
}

/// Per-market monotonic sequence number for causal ordering of published
/// events.
pub type EventSeq = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MarketEvent {
    OrderAccepted {
        seq: EventSeq,
        market_id: MarketId,
        order_id: OrderId,
    },
    OrderRejected {
        seq: EventSeq,
        market_id: MarketId,
        order_id: OrderId,
        reason: RejectReason,
    },
    Trade {
        seq: EventSeq,
        market_id: MarketId,
        trade: Trade,
    },
    OrderCancelled {
        seq: EventSeq,
        market_id: MarketId,
        order_id: OrderId,
        released_amount: crate::market::types::Amount,
        noop: bool,
    },
    MarketStateChanged {
        seq: EventSeq,
        market_id: MarketId,
        state: crate::market::types::MarketState,
    },
    MarketResolved {
        seq: EventSeq,
        market_id: MarketId,
        outcome: OutcomeIndex,
        timestamp_ns: i64,
    },
}

impl MarketEvent {
    pub fn seq(&self) -> EventSeq {
        match self {
            MarketEvent::OrderAccepted { seq, .. }
            | MarketEvent::OrderRejected { seq, .. }
            | MarketEvent::Trade { seq, .. }
            | MarketEvent::OrderCancelled { seq, .. }
            | MarketEvent::MarketStateChanged { seq, .. }
            | MarketEvent::MarketResolved { seq, .. } => *seq,
        }
    }

    pub fn market_id(&self) -> MarketId {
        match self {
            MarketEvent::OrderAccepted { market_id, .. }
            | MarketEvent::OrderRejected { market_id, .. }
            | MarketEvent::Trade { market_id, .. }
            | MarketEvent::OrderCancelled { market_id, .. }
            | MarketEvent::MarketStateChanged { market_id, .. }
            | MarketEvent::MarketResolved { market_id, .. } => *market_id,
        }
    }
}

/// A per-market broadcaster. Each market writer owns one; subscribers call
/// `subscribe()` to get their own receiver. The default channel capacity
/// mirrors the small fixed backlog this codebase uses for other live
/// broadcast feeds; a slow subscriber drops older events rather than
/// blocking the writer (`tokio::sync::broadcast`'s usual lagging-receiver
/// semantics).
pub struct EventPublisher {
    tx: tokio::sync::broadcast::Sender<MarketEvent>,
    next_seq: EventSeq,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = tokio::sync::broadcast::channel(capacity);
        Self { tx, next_seq: 0 }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<MarketEvent> {
        self.tx.subscribe()
    }

    /// Clone of the underlying sender, handed to the coordinator so it can
    /// keep offering `subscribe()` after the publisher itself has moved
    /// into a market's writer task.
    pub fn sender(&self) -> tokio::sync::broadcast::Sender<MarketEvent> {
        self.tx.clone()
    }

    /// Stamp the next sequence number and publish. Subscriber lag is not an
    /// error for the publisher: `send` only fails when there are zero
    /// receivers, which is a normal and harmless condition here.
    pub fn publish(&mut self, build: impl FnOnce(EventSeq) -> MarketEvent) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let _ = self.tx.send(build(seq));
    }
}
