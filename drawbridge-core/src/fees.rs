//! Chain specific gas fee policy.
//!
//! Bundlers on some production chains reject operations below a minimum
//! priority fee, while an unbounded `maxFeePerGas` can make a single sponsored
//! operation arbitrarily expensive. The policy raises and caps the network
//! estimate accordingly. Local chains run with zero fees.

use serde::{Deserialize, Serialize};

use crate::chain::ChainClient;
use crate::defaults::{
    FALLBACK_MAX_FEE_PER_GAS, FALLBACK_MAX_PRIORITY_FEE_PER_GAS, FEE_CAPPED_CHAIN_IDS,
    LOCAL_CHAIN_ID, MAX_FEE_PER_GAS_CAP, MIN_PRIORITY_FEE_PER_GAS,
};

/// EIP-1559 fee fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeEstimate {
    /// `maxFeePerGas` in wei.
    pub max_fee_per_gas: u128,
    /// `maxPriorityFeePerGas` in wei.
    pub max_priority_fee_per_gas: u128,
}

impl FeeEstimate {
    /// Creates an estimate from its two fields.
    #[must_use]
    pub const fn new(max_fee_per_gas: u128, max_priority_fee_per_gas: u128) -> Self {
        Self {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        }
    }
}

/// Bounds applied on fee-capped chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeBounds {
    /// Lowest accepted `maxPriorityFeePerGas`.
    pub min_priority_fee_per_gas: u128,
    /// Highest accepted `maxFeePerGas`.
    pub max_fee_per_gas: u128,
}

impl Default for FeeBounds {
    fn default() -> Self {
        Self {
            min_priority_fee_per_gas: MIN_PRIORITY_FEE_PER_GAS,
            max_fee_per_gas: MAX_FEE_PER_GAS_CAP,
        }
    }
}

/// How fees are computed for a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeRegime {
    /// Zero fees (local development chain).
    Free,
    /// Network estimate raised to a minimum priority fee and capped.
    Capped(FeeBounds),
    /// Network estimate used as is.
    Passthrough,
}

/// Fee policy for one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeePolicy {
    chain_id: u64,
    regime: FeeRegime,
}

impl FeePolicy {
    /// Selects the regime for `chain_id`.
    #[must_use]
    pub fn for_chain(chain_id: u64) -> Self {
        let regime = if chain_id == LOCAL_CHAIN_ID {
            FeeRegime::Free
        } else if FEE_CAPPED_CHAIN_IDS.contains(&chain_id) {
            FeeRegime::Capped(FeeBounds::default())
        } else {
            FeeRegime::Passthrough
        };
        Self { chain_id, regime }
    }

    /// Uses an explicit regime, mostly useful for tests and custom chains.
    #[must_use]
    pub const fn with_regime(chain_id: u64, regime: FeeRegime) -> Self {
        Self { chain_id, regime }
    }

    /// The chain this policy applies to.
    #[must_use]
    pub const fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// The selected fee regime.
    #[must_use]
    pub const fn regime(&self) -> FeeRegime {
        self.regime
    }

    /// Returns `true` for chains with enforced fee bounds and cost caps.
    #[must_use]
    pub const fn is_capped(&self) -> bool {
        matches!(self.regime, FeeRegime::Capped(_))
    }

    /// Applies the policy to a network estimate.
    #[must_use]
    pub fn apply(&self, network: FeeEstimate) -> FeeEstimate {
        match self.regime {
            FeeRegime::Free => FeeEstimate::default(),
            FeeRegime::Passthrough => network,
            FeeRegime::Capped(bounds) => enforce_bounds(network, bounds),
        }
    }

    /// Estimates fees for the next user operation.
    ///
    /// Estimation failures are not propagated: the conservative fallback fees
    /// are used instead (still subject to the chain's bounds).
    pub async fn estimate(&self, chain: &dyn ChainClient) -> FeeEstimate {
        if self.regime == FeeRegime::Free {
            return FeeEstimate::default();
        }
        let network = match chain.estimate_eip1559_fees().await {
            Ok(estimate) => estimate,
            Err(err) => {
                log::warn!(
                    "fee estimation failed on chain {}, using fallback fees: {err}",
                    self.chain_id
                );
                FeeEstimate::new(FALLBACK_MAX_FEE_PER_GAS, FALLBACK_MAX_PRIORITY_FEE_PER_GAS)
            }
        };
        self.apply(network)
    }
}

/// Raise priority to the minimum, raise max fee to at least the priority fee,
/// then cap the max fee. The cap never drops below the minimum priority fee, so
/// `max_fee >= priority >= minimum` holds on the way out.
fn enforce_bounds(network: FeeEstimate, bounds: FeeBounds) -> FeeEstimate {
    let ceiling = bounds.max_fee_per_gas.max(bounds.min_priority_fee_per_gas);
    let priority = network
        .max_priority_fee_per_gas
        .max(bounds.min_priority_fee_per_gas)
        .min(ceiling);
    let max_fee = network.max_fee_per_gas.max(priority).min(ceiling);
    FeeEstimate::new(max_fee, priority)
}
