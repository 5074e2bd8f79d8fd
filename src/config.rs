//! Consensus parameters.
//!
//! The fixed constants are protocol-wide; the handful of values that differ
//! between the main network and the test network live in [`ChainConfig`].

use serde_derive::{Deserialize, Serialize};

use crate::amount::Amount;

/// Smallest accounting unit per whole token.
pub const COIN: Amount = 1_000_000;

/// Fee floor for an empty-payload transaction.
pub const MIN_TX_FEE: Amount = 10_000;

pub const MAX_BLOCK_SIZE: u64 = 2_000_000;

/// Accepted forward clock drift, in seconds.
pub const MAX_CLOCK_DRIFT: u32 = 80;

/// Target seconds between primary blocks.
pub const BLOCK_TARGET_SPACING: u32 = 10;
/// Seconds between extended blocks inside one primary round.
pub const EXTENDED_BLOCK_SPACING: u32 = 1;
pub const PROOF_OF_WORK_BLOCK_SPACING: u32 = BLOCK_TARGET_SPACING;

/// Committee size cap for one enrollment window.
pub const MAX_DELEGATE_THRESH: usize = 25;

/// Tokens minted by the genesis block.
pub const TOKEN_INIT: Amount = 20_000 * 10_000 * COIN;

/// Stake floor to enroll as delegate.
pub const ENROLL_MINIMUM: Amount = 1_000 * 10_000 * COIN;
/// Per-delegate stake cap counted toward ballot weight.
pub const ENROLL_MAXIMUM: Amount = 10_000 * 10_000 * COIN;
/// Stake divisor turning bonded amounts into ballot weight.
pub const STAKE_UNIT: Amount = 1_000 * COIN;
/// Multiplier applied to the ballot selector before reduction.
pub const STAKE_MAXIMUM_TIMES: Amount = 100 * 10_000 * COIN;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    Main,
    Test,
}

/// Network-dependent consensus windows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub network: Network,
}

impl ChainConfig {
    pub fn new(network: Network) -> Self {
        ChainConfig { network }
    }

    /// Blocks over which secret shares are distributed before an agreement.
    pub fn distribute_interval(&self) -> u32 {
        match self.network {
            Network::Main => 5,
            Network::Test => 3,
        }
    }

    /// Blocks scanned for enrollment certificates per window.
    pub fn enroll_interval(&self) -> u32 {
        match self.network {
            Network::Main => 10,
            Network::Test => 6,
        }
    }

    /// Full round from enrollment to the first agreed block.
    pub fn consensus_interval(&self) -> u32 {
        self.distribute_interval() + self.enroll_interval() + 1
    }

    /// Upper bound on enrollment certificates one delegate may publish
    /// inside an unexpired window, before subtracting those already seen.
    pub fn max_cert_count(&self, last_height: u32) -> u32 {
        let bound = self.enroll_interval() * 4 / 3;
        bound.min(last_height)
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig::new(Network::Main)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consensus_interval_spans_both_windows() {
        let main = ChainConfig::new(Network::Main);
        assert_eq!(main.consensus_interval(), 16);
        let test = ChainConfig::new(Network::Test);
        assert_eq!(test.consensus_interval(), 10);
    }

    #[test]
    fn cert_count_is_height_capped() {
        let cfg = ChainConfig::new(Network::Main);
        assert_eq!(cfg.max_cert_count(100), 13);
        assert_eq!(cfg.max_cert_count(5), 5);
    }
}
