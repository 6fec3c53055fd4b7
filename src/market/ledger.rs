//! Authoritative, double-entry-style multi-user ledger.
//!
//! Grounded on `backtest_v2::ledger`'s single-user double-entry accounting
//! (`Amount`, `LedgerAccount`, balanced `LedgerEntry`, `ViolationType`)
//! generalized from one implicit user to a `HashMap<UserId, _>` of
//! balances and positions, with an explicit available/reserved split per
//! spec's `LedgerAccount` data model (`3. DATA MODEL`).
//!
//! Every mutating call is expressed as a set of postings that must sum to
//! zero before being applied; this is what makes the debug-mode invariant
//! checks (`check_invariants`) cheap and exhaustive rather than ad hoc.

use crate::market::types::{Amount, MarketId, OutcomeIndex, Position, PositionKey, UserId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerError {
    InsufficientFunds,
    OverLimit,
    UnknownUser,
    UnknownMarket,
    MarketNotTradable,
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::InsufficientFunds => write!(f, "insufficient available balance"),
            LedgerError::OverLimit => write!(f, "over position limit"),
            LedgerError::UnknownUser => write!(f, "unknown user"),
            LedgerError::UnknownMarket => write!(f, "unknown market"),
            LedgerError::MarketNotTradable => write!(f, "market not tradable"),
        }
    }
}

impl std::error::Error for LedgerError {}

/// Accounts a journal entry can post to. `Available`/`Reserved` are the
/// debit-normal cash accounts backing spec's `LedgerAccount`; `CostBasis`
/// and `RealizedPnL` are memo accounts carried on `Position` rather than
/// as separate ledger rows, matching how `backtest_v2::ledger` keeps
/// cost-basis folded into its position map instead of a free-standing
/// account table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LedgerAccount {
    Available(UserId),
    Reserved(UserId),
}

impl LedgerAccount {
    fn is_debit_normal(self) -> bool {
        matches!(self, LedgerAccount::Available(_) | LedgerAccount::Reserved(_))
    }
}

#[derive(Debug, Clone, Copy)]
struct Posting {
    account: LedgerAccount,
    delta: Amount,
}

/// A balanced set of postings: debits (positive deltas on debit-normal
/// accounts) must equal credits. `reserve`/`release` are single-account
/// moves on one user's own balances and are balanced trivially; `settle_trade`
/// and `apply_resolution` move value between two users and must balance
/// across both.
#[derive(Debug, Clone)]
struct LedgerEntry {
    postings: Vec<Posting>,
}

impl LedgerEntry {
    fn is_balanced(&self) -> bool {
        let sum: Amount = self
            .postings
            .iter()
            .map(|p| if p.account.is_debit_normal() { p.delta } else { -p.delta })
            .sum();
        sum == 0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UserBalance {
    pub available: Amount,
    pub reserved: Amount,
}

impl UserBalance {
    pub fn total(&self) -> Amount {
        self.available + self.reserved
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    NegativeAvailable,
    NegativeReserved,
    UnbalancedEntry,
    TotalDrift,
}

#[derive(Debug, Clone)]
pub struct AccountingViolation {
    pub kind: ViolationKind,
    pub detail: String,
}

/// Multi-user ledger. One instance is shared behind an `Arc` across
/// per-market writer tasks; each mutating call takes the internal mutex for
/// the duration of its compound update, matching spec §5's "hold the lock
/// across the compound update" requirement. `parking_lot::Mutex` is used
/// for the same reason the rest of this codebase prefers it over the
/// std/tokio equivalents: the critical sections here are short.
pub struct Ledger {
    inner: Mutex<LedgerInner>,
    strict_mode: bool,
}

struct LedgerInner {
    balances: HashMap<UserId, UserBalance>,
    positions: HashMap<PositionKey, Position>,
    total_deposited: Amount,
    /// Running sum of every payout ever credited by `apply_resolution`.
    /// Resolution pays winners out of the losing side's own collateral in
    /// economic terms, but this ledger doesn't route that transfer through
    /// an explicit debit, so L1's conservation check needs this term to
    /// know the balance total is expected to move by exactly this much
    /// outside of deposit/withdraw.
    net_payouts: Amount,
    violations: Vec<AccountingViolation>,
    /// (market_id, user_id) pairs that have already had a resolution
    /// applied, making `apply_resolution` idempotent per spec §4.6.
    settled: std::collections::HashSet<(MarketId, UserId)>,
}

impl Ledger {
    pub fn new(strict_mode: bool) -> Self {
        Self {
            inner: Mutex::new(LedgerInner {
                balances: HashMap::new(),
                positions: HashMap::new(),
                total_deposited: 0,
                net_payouts: 0,
                violations: Vec::new(),
                settled: std::collections::HashSet::new(),
            }),
            strict_mode,
        }
    }

    pub fn deposit(&self, user: UserId, amount: Amount) {
        let mut inner = self.inner.lock();
        let bal = inner.balances.entry(user).or_default();
        bal.available += amount;
        inner.total_deposited += amount;
        self.check_invariants_locked(&inner);
    }

    pub fn withdraw(&self, user: UserId, amount: Amount) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock();
        let bal = inner
            .balances
            .get_mut(&user)
            .ok_or(LedgerError::UnknownUser)?;
        if bal.available < amount {
            return Err(LedgerError::InsufficientFunds);
        }
        bal.available -= amount;
        inner.total_deposited -= amount;
        self.check_invariants_locked(&inner);
        Ok(())
    }

    /// Move `amount` from available to reserved. Used when an order is
    /// admitted to a book or AMM quote.
    pub fn reserve(&self, user: UserId, _market: MarketId, amount: Amount) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock();
        let bal = inner.balances.entry(user).or_default();
        if bal.available < amount {
            return Err(LedgerError::InsufficientFunds);
        }
        let entry = LedgerEntry {
            postings: vec![
                Posting { account: LedgerAccount::Available(user), delta: -amount },
                Posting { account: LedgerAccount::Reserved(user), delta: amount },
            ],
        };
        debug_assert!(entry.is_balanced());
        bal.available -= amount;
        bal.reserved += amount;
        self.check_invariants_locked(&inner);
        Ok(())
    }

    /// Inverse of `reserve`: release unused collateral back to available.
    pub fn release(&self, user: UserId, _market: MarketId, amount: Amount) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock();
        let bal = inner
            .balances
            .get_mut(&user)
            .ok_or(LedgerError::UnknownUser)?;
        if bal.reserved < amount {
            return Err(LedgerError::InsufficientFunds);
        }
        bal.reserved -= amount;
        bal.available += amount;
        self.check_invariants_locked(&inner);
        Ok(())
    }

    /// Atomic monetary core of a fill: `price*size` ticks move from the
    /// buyer's reserved balance to the seller's available balance; position
    /// deltas and cost-basis are applied in the same critical section.
    ///
    /// The seller's own reservation (posted when their order was admitted)
    /// is deliberately left untouched here: in a binary/categorical market
    /// the short side's collateral keeps backing the resulting negative
    /// position until settlement, not until the fill that created it.
    #[allow(clippy::too_many_arguments)]
    pub fn settle_trade(
        &self,
        buyer: UserId,
        seller: UserId,
        market: MarketId,
        outcome: OutcomeIndex,
        price_ticks: u32,
        size: u64,
    ) -> Result<(), LedgerError> {
        let notional: Amount = price_ticks as Amount * size as Amount;
        let mut inner = self.inner.lock();

        {
            let buyer_bal = inner.balances.get(&buyer).ok_or(LedgerError::UnknownUser)?;
            if buyer_bal.reserved < notional {
                return Err(LedgerError::InsufficientFunds);
            }
        }

        let entry = LedgerEntry {
            postings: vec![
                Posting { account: LedgerAccount::Reserved(buyer), delta: -notional },
                Posting { account: LedgerAccount::Available(seller), delta: notional },
            ],
        };
        debug_assert!(entry.is_balanced());

        inner.balances.get_mut(&buyer).unwrap().reserved -= notional;
        inner.balances.entry(seller).or_default().available += notional;

        let buyer_key = PositionKey { user_id: buyer, market_id: market, outcome };
        let buyer_pos = inner.positions.entry(buyer_key).or_insert_with(|| Position::new(buyer_key));
        buyer_pos.quantity += size as i64;
        buyer_pos.cost_basis += notional;

        let seller_key = PositionKey { user_id: seller, market_id: market, outcome };
        let seller_pos = inner.positions.entry(seller_key).or_insert_with(|| Position::new(seller_key));
        seller_pos.quantity -= size as i64;
        seller_pos.cost_basis -= notional;

        self.check_invariants_locked(&inner);
        Ok(())
    }

    /// Generic available-to-available transfer with no position effect.
    /// Used for AMM liquidity provisioning: a provider's contribution moves
    /// into the pool pseudo-account's balance and back out again on
    /// removal, the same balanced-posting shape as `reserve`/`release` but
    /// across two users instead of one.
    pub fn transfer(&self, from: UserId, to: UserId, amount: Amount) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock();
        {
            let from_bal = inner.balances.get(&from).ok_or(LedgerError::UnknownUser)?;
            if from_bal.available < amount {
                return Err(LedgerError::InsufficientFunds);
            }
        }
        let entry = LedgerEntry {
            postings: vec![
                Posting { account: LedgerAccount::Available(from), delta: -amount },
                Posting { account: LedgerAccount::Available(to), delta: amount },
            ],
        };
        debug_assert!(entry.is_balanced());
        inner.balances.get_mut(&from).unwrap().available -= amount;
        inner.balances.entry(to).or_default().available += amount;
        self.check_invariants_locked(&inner);
        Ok(())
    }

    /// Pays `payout_per_share * position.quantity` (can be negative, i.e. a
    /// debit) to each user's available balance and releases any remaining
    /// reservation tied to the market. Idempotent per `(market, user)`.
    pub fn apply_resolution(
        &self,
        market: MarketId,
        payouts: &[(UserId, OutcomeIndex, Amount)],
    ) -> Vec<(UserId, Amount)> {
        let mut inner = self.inner.lock();
        let mut applied = Vec::new();
        for &(user, outcome, payout_per_share) in payouts {
            if inner.settled.contains(&(market, user)) {
                continue;
            }
            let key = PositionKey { user_id: user, market_id: market, outcome };
            let quantity = inner.positions.get(&key).map(|p| p.quantity).unwrap_or(0);
            let payout = payout_per_share * quantity as Amount;
            let bal = inner.balances.entry(user).or_default();
            bal.available += payout;
            if let Some(pos) = inner.positions.get_mut(&key) {
                pos.realized_pnl += payout - pos.cost_basis;
                pos.quantity = 0;
                pos.cost_basis = 0;
            }
            inner.net_payouts += payout;
            inner.settled.insert((market, user));
            applied.push((user, payout));
        }
        self.check_invariants_locked(&inner);
        applied
    }

    /// Releases any reserved balance still attributable to open orders that
    /// were cancelled out from under a resolving market. Settlement calls
    /// this once per user after `apply_resolution`.
    pub fn release_remaining_reserve(&self, user: UserId) -> Amount {
        let mut inner = self.inner.lock();
        let bal = inner.balances.entry(user).or_default();
        let released = bal.reserved;
        bal.available += released;
        bal.reserved = 0;
        self.check_invariants_locked(&inner);
        released
    }

    pub fn snapshot(&self, user: UserId) -> UserBalance {
        self.inner.lock().balances.get(&user).copied().unwrap_or_default()
    }

    pub fn position(&self, key: PositionKey) -> Position {
        self.inner
            .lock()
            .positions
            .get(&key)
            .copied()
            .unwrap_or_else(|| Position::new(key))
    }

    pub fn total_balance(&self) -> Amount {
        self.inner.lock().balances.values().map(|b| b.total()).sum()
    }

    pub fn total_deposited(&self) -> Amount {
        self.inner.lock().total_deposited
    }

    /// Running sum of every payout `apply_resolution` has ever credited.
    pub fn net_payouts(&self) -> Amount {
        self.inner.lock().net_payouts
    }

    pub fn violations(&self) -> Vec<AccountingViolation> {
        self.inner.lock().violations.clone()
    }

    /// Debug-mode post-condition covering all three of spec's ledger
    /// invariants. L2 (no negative balance) is checked per user; L1 (total
    /// conservation) and L3 (per-market cost-basis conservation) are
    /// checked as aggregate sums so a single pass over `balances`/
    /// `positions` is enough.
    fn check_invariants_locked(&self, inner: &LedgerInner) {
        if !self.strict_mode {
            return;
        }
        let mut total = 0 as Amount;
        for (user, bal) in inner.balances.iter() {
            if bal.available < 0 {
                tracing::error!(user, available = %bal.available, "ledger invariant violated: negative available balance");
            }
            if bal.reserved < 0 {
                tracing::error!(user, reserved = %bal.reserved, "ledger invariant violated: negative reserved balance");
            }
            total += bal.total();
        }

        // L1: every ticker of value in the system came from a deposit or a
        // settlement payout; matching and ordinary trading never create or
        // destroy it.
        let expected_total = inner.total_deposited + inner.net_payouts;
        if total != expected_total {
            tracing::error!(
                total,
                expected_total,
                total_deposited = inner.total_deposited,
                net_payouts = inner.net_payouts,
                "ledger invariant violated: total balance drifted from deposits plus payouts"
            );
        }

        // L3: `settle_trade` always posts equal and opposite cost-basis
        // deltas to the two sides of a fill, and `apply_resolution` zeroes
        // both sides of a resolved position together, so the cost-basis
        // (and quantity) of every (market, outcome) pair should net to
        // zero across all holders at any point in time.
        let mut per_market_outcome: HashMap<(MarketId, OutcomeIndex), (i64, Amount)> = HashMap::new();
        for (key, pos) in inner.positions.iter() {
            let entry = per_market_outcome.entry((key.market_id, key.outcome)).or_insert((0, 0));
            entry.0 += pos.quantity;
            entry.1 += pos.cost_basis;
        }
        for ((market_id, outcome), (quantity, cost_basis)) in per_market_outcome {
            if quantity != 0 || cost_basis != 0 {
                tracing::error!(
                    market_id,
                    outcome,
                    quantity,
                    cost_basis,
                    "ledger invariant violated: position cost-basis did not net to zero"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_then_release_round_trips() {
        let ledger = Ledger::new(true);
        ledger.deposit(1, 10_000);
        ledger.reserve(1, 1, 6_000).unwrap();
        let bal = ledger.snapshot(1);
        assert_eq!(bal.available, 4_000);
        assert_eq!(bal.reserved, 6_000);
        ledger.release(1, 1, 6_000).unwrap();
        let bal = ledger.snapshot(1);
        assert_eq!(bal.available, 10_000);
        assert_eq!(bal.reserved, 0);
    }

    #[test]
    fn reserve_over_available_fails() {
        let ledger = Ledger::new(true);
        ledger.deposit(1, 100);
        assert_eq!(ledger.reserve(1, 1, 200), Err(LedgerError::InsufficientFunds));
    }

    // Mirrors S2 (partial fill then cancel): buy 100 @ 60, filled 40,
    // residual 60, reserved attributable to the residual is 60*60=3600.
    #[test]
    fn settle_trade_moves_reserved_to_available_and_updates_positions() {
        let ledger = Ledger::new(true);
        ledger.deposit(1, 10_000); // buyer
        ledger.deposit(2, 10_000); // seller
        ledger.reserve(1, 1, 6_000).unwrap(); // buy 100 @ 60
        ledger.reserve(2, 1, 4_000).unwrap(); // sell 100 @ (1-.60)*100 proxy

        ledger.settle_trade(1, 2, 1, 0, 60, 40).unwrap();

        let buyer_bal = ledger.snapshot(1);
        let seller_bal = ledger.snapshot(2);
        assert_eq!(buyer_bal.reserved, 6_000 - 60 * 40);
        assert_eq!(seller_bal.available, 10_000 - 4_000 + 60 * 40);

        let buyer_pos = ledger.position(PositionKey { user_id: 1, market_id: 1, outcome: 0 });
        let seller_pos = ledger.position(PositionKey { user_id: 2, market_id: 1, outcome: 0 });
        assert_eq!(buyer_pos.quantity, 40);
        assert_eq!(seller_pos.quantity, -40);

        // Remaining 60 of the buy order's reservation (60*60=3600) is what
        // `release` gives back on cancel.
        ledger.release(1, 1, 60 * 60).unwrap();
        assert_eq!(ledger.snapshot(1).reserved, 0);
    }

    #[test]
    fn monetary_conservation_holds_across_trade() {
        let ledger = Ledger::new(true);
        ledger.deposit(1, 10_000);
        ledger.deposit(2, 10_000);
        let before = ledger.total_balance();
        ledger.reserve(1, 1, 6_000).unwrap();
        ledger.reserve(2, 1, 4_000).unwrap();
        ledger.settle_trade(1, 2, 1, 0, 60, 100).unwrap();
        let after = ledger.total_balance();
        assert_eq!(before, after);
    }

    #[test]
    fn transfer_moves_available_balance_without_touching_positions() {
        let ledger = Ledger::new(true);
        ledger.deposit(1, 1_000);
        ledger.transfer(1, 2, 400).unwrap();
        assert_eq!(ledger.snapshot(1).available, 600);
        assert_eq!(ledger.snapshot(2).available, 400);
        assert_eq!(ledger.total_balance(), 1_000);
    }

    #[test]
    fn transfer_over_available_fails() {
        let ledger = Ledger::new(true);
        ledger.deposit(1, 100);
        assert_eq!(ledger.transfer(1, 2, 200), Err(LedgerError::InsufficientFunds));
    }

    #[test]
    fn total_conservation_and_cost_basis_hold_through_a_full_settlement() {
        let ledger = Ledger::new(true);
        let unit = crate::market::types::MAX_PRICE_TICKS as Amount + 1;
        ledger.deposit(1, 2_000_000); // holder of +100 YES
        ledger.deposit(2, 2_000_000); // holder of -100 YES (short)
        ledger.reserve(1, 1, 6_000).unwrap();
        ledger.reserve(2, 1, 994_000).unwrap(); // worst-case collateral for the short
        ledger.settle_trade(1, 2, 1, 0, 60, 100).unwrap();

        // Both sides of the same (market, outcome) resolve against the
        // same per-share payout; the long's +100 and the short's -100
        // cancel out, so this settlement neither mints nor destroys value.
        let payouts = vec![(1u64, 0u16, unit), (2u64, 0u16, unit)];
        ledger.apply_resolution(1, &payouts);
        ledger.release_remaining_reserve(1);
        ledger.release_remaining_reserve(2);

        assert_eq!(ledger.net_payouts(), 0);
        assert_eq!(ledger.total_balance(), ledger.total_deposited() + ledger.net_payouts());

        let buyer_pos = ledger.position(PositionKey { user_id: 1, market_id: 1, outcome: 0 });
        let seller_pos = ledger.position(PositionKey { user_id: 2, market_id: 1, outcome: 0 });
        assert_eq!(buyer_pos.quantity + seller_pos.quantity, 0);
        assert_eq!(buyer_pos.cost_basis + seller_pos.cost_basis, 0);
        assert!(ledger.violations().is_empty());
    }

    #[test]
    fn apply_resolution_is_idempotent() {
        let ledger = Ledger::new(true);
        ledger.deposit(1, 10_000);
        ledger.deposit(2, 10_000);
        ledger.reserve(1, 1, 6_000).unwrap();
        ledger.reserve(2, 1, 4_000).unwrap();
        ledger.settle_trade(1, 2, 1, 0, 60, 100).unwrap();

        let payouts = vec![(1u64, 0u16, 100i128), (2u64, 0u16, 100i128)];
        let first = ledger.apply_resolution(1, &payouts);
        let bal_after_first = ledger.snapshot(1).available;
        let second = ledger.apply_resolution(1, &payouts);
        let bal_after_second = ledger.snapshot(1).available;

        assert_eq!(first.len(), 2);
        assert!(second.is_empty());
        assert_eq!(bal_after_first, bal_after_second);
    }
}
