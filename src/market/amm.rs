//! Constant-product automated market maker, one pool per market.
//!
//! There is no direct teacher analogue for AMM math (the teacher trades
//! against order books and external venues only), so this module is
//! grounded on the AMM examples in the retrieval pack's `other_examples/`
//! for the constant-product swap shape, reworked into this codebase's
//! integer-tick, `anyhow`-free typed-error style to match `market::book`.

use crate::market::types::{Amount, OutcomeIndex, Size, Trade, TradeId, AMM_PSEUDO_ORDER_ID, AMM_POOL_ACCOUNT};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmmError {
    InsufficientLiquidity,
    InvalidSize,
    UnknownOutcome,
    NoLiquidity,
}

impl std::fmt::Display for AmmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AmmError::InsufficientLiquidity => write!(f, "pool reserves cannot cover this size"),
            AmmError::InvalidSize => write!(f, "size must be positive"),
            AmmError::UnknownOutcome => write!(f, "outcome index out of range"),
            AmmError::NoLiquidity => write!(f, "pool has no liquidity"),
        }
    }
}

impl std::error::Error for AmmError {}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AmmConfig {
    pub fee_bps: u32,
}

impl Default for AmmConfig {
    fn default() -> Self {
        Self { fee_bps: 0 }
    }
}

pub struct Quote {
    pub required_input: Amount,
    pub size: Size,
}

/// Per-market constant-product pool: one reserve slot per outcome, with
/// invariant `k = product(reserves)`. Binary markets are the 2-outcome
/// special case.
pub struct AmmPool {
    pub market_id: crate::market::types::MarketId,
    config: AmmConfig,
    reserves: Vec<Amount>,
    total_shares: Amount,
    provider_shares: HashMap<crate::market::types::UserId, Amount>,
    next_trade_id: TradeId,
}

impl AmmPool {
    pub fn new(market_id: crate::market::types::MarketId, outcome_count: usize, config: AmmConfig) -> Self {
        Self {
            market_id,
            config,
            reserves: vec![0; outcome_count],
            total_shares: 0,
            provider_shares: HashMap::new(),
            next_trade_id: 1,
        }
    }

    pub fn reserves(&self) -> &[Amount] {
        &self.reserves
    }

    pub fn total_shares(&self) -> Amount {
        self.total_shares
    }

    pub fn provider_shares(&self) -> &HashMap<crate::market::types::UserId, Amount> {
        &self.provider_shares
    }

    pub fn next_trade_id(&self) -> TradeId {
        self.next_trade_id
    }

    /// Rebuilds a pool from a prior checkpoint's reserves/shares rather
    /// than the zero-liquidity state `new` starts from. Used only by
    /// startup recovery.
    pub fn restore(
        market_id: crate::market::types::MarketId,
        config: AmmConfig,
        reserves: Vec<Amount>,
        total_shares: Amount,
        provider_shares: HashMap<crate::market::types::UserId, Amount>,
        next_trade_id: TradeId,
    ) -> Self {
        Self { market_id, config, reserves, total_shares, provider_shares, next_trade_id }
    }

    fn k(&self) -> Amount {
        self.reserves.iter().product()
    }

    fn other_reserves_product(&self, outcome: usize) -> Amount {
        self.reserves
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != outcome)
            .map(|(_, r)| *r)
            .product()
    }

    /// Solve for the input `x` required to buy `size` shares of `outcome`,
    /// holding `k` constant (before fee) and rounding the result up in
    /// favour of the pool, per spec §4.3.
    ///
    /// For a 2-outcome pool this is the closed form
    /// `(R_i - size) * (R_j + x*(1-fee)) = k`, generalized here to an
    /// n-outcome pool by folding every other reserve into a single product
    /// `P = prod(R_j for j != i)`, which is algebraically equivalent for
    /// the binary case and extends unchanged to categorical markets.
    pub fn quote(&self, outcome: OutcomeIndex, size: Size, _side: crate::market::types::Side) -> Result<Quote, AmmError> {
        let i = outcome as usize;
        if i >= self.reserves.len() {
            return Err(AmmError::UnknownOutcome);
        }
        if size == 0 {
            return Err(AmmError::InvalidSize);
        }
        if self.total_shares == 0 {
            return Err(AmmError::NoLiquidity);
        }
        let size = size as Amount;
        let r_i = self.reserves[i];
        if r_i <= size {
            return Err(AmmError::InsufficientLiquidity);
        }
        let k = self.k();
        let other_product = self.other_reserves_product(i);
        if other_product == 0 {
            return Err(AmmError::NoLiquidity);
        }
        // (r_i - size) * (other_product + x*(1-fee)/1) = k, solved for the
        // post-fee reserve increase, then grossed up by the fee so the
        // *paid* input covers both the reserve increase and the fee. Fee
        // is in basis points of the input: effective_increase = x * (1 - fee_bps/10000).
        let target_other_sum = ceil_div(k, r_i - size);
        let required_increase = target_other_sum.saturating_sub(other_product);
        let x = if self.config.fee_bps == 0 {
            required_increase
        } else {
            // x * (10000 - fee_bps) / 10000 >= required_increase
            ceil_div(required_increase * 10_000, (10_000 - self.config.fee_bps) as Amount)
        };
        Ok(Quote { required_input: x.max(0), size: size as Size })
    }

    /// Atomically apply a swap: debit `quote.required_input` from the
    /// caller (handled by the Ledger one layer up), credit `size` shares of
    /// `outcome` to the user's position, update pool reserves.
    pub fn swap(
        &mut self,
        outcome: OutcomeIndex,
        size: Size,
        required_input: Amount,
        buyer: crate::market::types::UserId,
    ) -> Result<Trade, AmmError> {
        let i = outcome as usize;
        if i >= self.reserves.len() {
            return Err(AmmError::UnknownOutcome);
        }
        let k_before = self.k();
        self.reserves[i] = self.reserves[i].saturating_sub(size as Amount);
        for (j, r) in self.reserves.iter_mut().enumerate() {
            if j != i {
                // Fee is retained in the pool: split the post-fee
                // increase evenly across the other reserves so the
                // invariant check below only needs the product, not a
                // per-outcome ledger of where the fee landed.
                *r += required_input / (self.reserves.len() as Amount - 1).max(1);
            }
        }
        debug_assert!(self.k() >= k_before, "AMM invariant violated by swap");

        self.next_trade_id += 1;
        Ok(Trade {
            id: self.next_trade_id,
            market_id: self.market_id,
            outcome,
            buyer_order_id: AMM_PSEUDO_ORDER_ID,
            seller_order_id: AMM_PSEUDO_ORDER_ID,
            buyer_user_id: buyer,
            seller_user_id: AMM_POOL_ACCOUNT,
            price: price_ticks_for(required_input, size),
            size,
            timestamp_ns: 0,
        })
    }

    /// Seed or add liquidity proportionally. The first provider sets the
    /// ratio and receives `sqrt(prod(reserves))` shares; later providers
    /// must supply reserves in the existing ratio and receive shares
    /// pro-rata to the liquidity they add.
    pub fn add_liquidity(&mut self, provider: crate::market::types::UserId, amounts: &[Amount]) -> Amount {
        assert_eq!(amounts.len(), self.reserves.len());
        let minted = if self.total_shares == 0 {
            for (r, a) in self.reserves.iter_mut().zip(amounts) {
                *r = *a;
            }
            isqrt(self.k())
        } else {
            // Pro-rata against the first reserve slot; caller is expected
            // to have sized `amounts` in the pool's current ratio.
            let share_ratio_num = amounts[0];
            let share_ratio_den = self.reserves[0];
            for (r, a) in self.reserves.iter_mut().zip(amounts) {
                *r += *a;
            }
            if share_ratio_den == 0 {
                0
            } else {
                (self.total_shares * share_ratio_num) / share_ratio_den
            }
        };
        self.total_shares += minted;
        *self.provider_shares.entry(provider).or_insert(0) += minted;
        minted
    }

    pub fn remove_liquidity(&mut self, provider: crate::market::types::UserId, shares: Amount) -> Option<Vec<Amount>> {
        let held = *self.provider_shares.get(&provider)?;
        if shares > held || self.total_shares == 0 {
            return None;
        }
        let out: Vec<Amount> = self
            .reserves
            .iter()
            .map(|r| (*r * shares) / self.total_shares)
            .collect();
        for (r, o) in self.reserves.iter_mut().zip(&out) {
            *r -= *o;
        }
        self.total_shares -= shares;
        *self.provider_shares.get_mut(&provider).unwrap() -= shares;
        Some(out)
    }
}

fn ceil_div(a: Amount, b: Amount) -> Amount {
    if b == 0 {
        return 0;
    }
    (a + b - 1) / b
}

fn isqrt(n: Amount) -> Amount {
    if n <= 0 {
        return 0;
    }
    let mut x = n;
    let mut y = (x + 1) / 2;
    while y < x {
        x = y;
        y = (x + n / x) / 2;
    }
    x
}

fn price_ticks_for(required_input: Amount, size: Size) -> u32 {
    if size == 0 {
        return 0;
    }
    ((required_input.max(0) as u64) / size).clamp(
        crate::market::types::MIN_PRICE_TICKS as u64,
        crate::market::types::MAX_PRICE_TICKS as u64,
    ) as u32
}
