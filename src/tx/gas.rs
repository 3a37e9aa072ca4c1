//! Fee policy resolution for EIP-1559 transactions on Polygon
//!
//! Network-suggested fees are floored at the chain's minimum tip and then
//! bumped by a configurable percentage so transactions are not left behind
//! (or rejected as underpriced replacements) when the fee market moves.

use crate::error::{OpsError, OpsResult};

use ethers::types::U256;
use ethers::utils::format_units;
use tracing::debug;

/// Snapshot of network fee conditions; any field may be absent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeeQuote {
    pub base_fee: Option<U256>,
    pub suggested_priority_fee: Option<U256>,
    pub suggested_max_fee: Option<U256>,
}

/// Floor and escalation applied to suggested fees
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasPolicy {
    minimum_priority_fee: U256,
    bump_percent: u64,
}

impl GasPolicy {
    /// Create a policy; `bump_percent` is a multiplier in percent (100 = no bump)
    pub fn new(minimum_priority_fee: U256, bump_percent: u64) -> OpsResult<Self> {
        if bump_percent < 100 {
            return Err(OpsError::config(
                "gas.bump_percent",
                format!("{} is below 100", bump_percent),
            ));
        }
        Ok(Self {
            minimum_priority_fee,
            bump_percent,
        })
    }

    pub fn minimum_priority_fee(&self) -> U256 {
        self.minimum_priority_fee
    }

    fn bump(&self, amount: U256) -> U256 {
        bump_by(amount, self.bump_percent)
    }
}

/// `amount * percent / 100`, saturating at `U256::MAX`
fn bump_by(amount: U256, percent: u64) -> U256 {
    match amount.checked_mul(U256::from(percent)) {
        Some(scaled) => scaled / U256::from(100u64),
        None => (amount / U256::from(100u64)).saturating_mul(U256::from(percent)),
    }
}

/// Fee fields attached to an EIP-1559 transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eip1559Fees {
    pub max_priority_fee_per_gas: U256,
    pub max_fee_per_gas: U256,
}

/// Resolve transaction fees from a quote under a policy.
///
/// Never fails and never overflows: an empty quote falls back to the policy floor with a max fee
/// of twice the tip. The result always satisfies
/// `max_fee_per_gas >= max_priority_fee_per_gas >= minimum_priority_fee`.
pub fn resolve_fees(quote: &FeeQuote, policy: &GasPolicy) -> Eip1559Fees {
    let raw_tip = match quote.suggested_priority_fee {
        Some(tip) if tip >= policy.minimum_priority_fee => tip,
        _ => policy.minimum_priority_fee,
    };
    let tip = policy.bump(raw_tip);

    let raw_max_fee = match quote.suggested_max_fee {
        Some(max_fee) if max_fee >= raw_tip => max_fee,
        _ => raw_tip.saturating_mul(U256::from(2u64)),
    };
    let max_fee = policy.bump(raw_max_fee).max(tip);

    let fees = Eip1559Fees {
        max_priority_fee_per_gas: tip,
        max_fee_per_gas: max_fee,
    };

    debug!(
        "Resolved fees: tip {} gwei, max {} gwei (floor {} gwei, bump {}%)",
        gwei(fees.max_priority_fee_per_gas),
        gwei(fees.max_fee_per_gas),
        gwei(policy.minimum_priority_fee()),
        policy.bump_percent
    );
    fees
}

/// Fees for a same-nonce replacement: at least `previous * bump / 100` in
/// both fields and never below what the current market resolves to.
pub fn replacement_fees(
    previous: &Eip1559Fees,
    fresh: &Eip1559Fees,
    replacement_bump_percent: u64,
) -> Eip1559Fees {
    let tip = bump_by(previous.max_priority_fee_per_gas, replacement_bump_percent)
        .max(fresh.max_priority_fee_per_gas);
    let max_fee = bump_by(previous.max_fee_per_gas, replacement_bump_percent)
        .max(fresh.max_fee_per_gas)
        .max(tip);
    Eip1559Fees {
        max_priority_fee_per_gas: tip,
        max_fee_per_gas: max_fee,
    }
}

/// Worst-case native cost of a transaction
pub fn max_cost(gas_limit: U256, fees: &Eip1559Fees) -> U256 {
    gas_limit.saturating_mul(fees.max_fee_per_gas)
}

/// Fee actually paid according to a receipt
pub fn fee_paid(gas_used: U256, effective_gas_price: U256) -> U256 {
    gas_used.saturating_mul(effective_gas_price)
}

/// Render wei as gwei for log lines
pub fn gwei(amount: U256) -> String {
    format_units(amount, "gwei").unwrap_or_else(|_| amount.to_string())
}
