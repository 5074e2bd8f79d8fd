//! Fork profiles and the registry of live fork lines.
//!
//! Each fork owns its mutable cursor state behind an `Arc<RwLock<_>>` so a
//! view can pin the fork with an owned read or upgradable-read guard while
//! the registry lock is already released. Lock order is always fork before
//! graph; no caller acquires a fork lock while holding the graph lock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{
    ArcRwLockReadGuard, ArcRwLockUpgradableReadGuard, ArcRwLockWriteGuard, RawRwLock, RwLock,
};
use serde_derive::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::hash::Hash256;

/// Static parameters of a fork, fixed at its origin block.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ForkProfile {
    pub name: String,
    pub symbol: String,
    pub owner: crate::destination::Destination,
    /// Parent fork, zero for the primary fork.
    pub parent: Hash256,
    /// Height on the parent at which this fork joined.
    pub joint_height: u32,
    /// Initial token amount minted at the origin.
    pub amount: Amount,
    pub mint_reward: Amount,
    pub min_tx_fee: Amount,
    /// Reward halving period in blocks, zero for no halving.
    pub halve_cycle: u32,
    /// Isolated forks start from a blank ledger instead of the parent's.
    pub isolated: bool,
    pub private_fork: bool,
    pub enclosed: bool,
}

impl ForkProfile {
    pub fn is_primary(&self) -> bool {
        self.parent.is_zero()
    }

    /// Mint reward at `height`, halved per cycle since the joint height.
    pub fn mint_reward_at(&self, height: u32) -> Amount {
        if self.halve_cycle == 0 {
            return self.mint_reward;
        }
        let cycles = height.saturating_sub(self.joint_height) / self.halve_cycle;
        if cycles >= 63 {
            return 0;
        }
        self.mint_reward / (1i64 << cycles)
    }
}

/// Mutable cursor of a fork line.
#[derive(Clone, Debug)]
pub struct ForkInner {
    pub origin: Hash256,
    pub last: Hash256,
    pub profile: ForkProfile,
    /// Origins of direct child forks.
    pub sublines: Vec<Hash256>,
}

pub type ForkReadGuard = ArcRwLockReadGuard<RawRwLock, ForkInner>;
pub type ForkUpgradableGuard = ArcRwLockUpgradableReadGuard<RawRwLock, ForkInner>;
pub type ForkWriteGuard = ArcRwLockWriteGuard<RawRwLock, ForkInner>;

#[derive(Clone)]
pub struct Fork {
    inner: Arc<RwLock<ForkInner>>,
}

impl Fork {
    pub fn new(origin: Hash256, last: Hash256, profile: ForkProfile) -> Self {
        Fork {
            inner: Arc::new(RwLock::new(ForkInner {
                origin,
                last,
                profile,
                sublines: Vec::new(),
            })),
        }
    }

    pub fn read_arc(&self) -> ForkReadGuard {
        self.inner.read_arc()
    }

    /// Pin the fork for a committable view. Other readers stay admitted
    /// until the commit point upgrades the guard.
    pub fn upgradable_read_arc(&self) -> ForkUpgradableGuard {
        self.inner.upgradable_read_arc()
    }

    pub fn last(&self) -> Hash256 {
        self.inner.read().last
    }

    pub fn origin(&self) -> Hash256 {
        self.inner.read().origin
    }

    pub fn profile(&self) -> ForkProfile {
        self.inner.read().profile.clone()
    }
}

#[derive(Default)]
pub struct ForkRegistry {
    forks: HashMap<Hash256, Fork>,
}

impl ForkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, origin: &Hash256) -> Option<Fork> {
        self.forks.get(origin).cloned()
    }

    pub fn contains(&self, origin: &Hash256) -> bool {
        self.forks.contains_key(origin)
    }

    pub fn insert(&mut self, fork: Fork) {
        self.forks.insert(fork.origin(), fork);
    }

    pub fn origins(&self) -> Vec<Hash256> {
        self.forks.keys().copied().collect()
    }

    pub fn name_in_use(&self, name: &str) -> bool {
        self.forks
            .values()
            .any(|f| f.inner.read().profile.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::Destination;
    use parking_lot::ArcRwLockUpgradableReadGuard;

    fn profile(name: &str) -> ForkProfile {
        ForkProfile {
            name: name.to_string(),
            symbol: name.to_uppercase(),
            owner: Destination::from_bytes([1u8; 32]),
            parent: Hash256::zero(),
            joint_height: 0,
            amount: 1_000,
            mint_reward: 64,
            min_tx_fee: 10,
            halve_cycle: 4,
            isolated: false,
            private_fork: false,
            enclosed: false,
        }
    }

    #[test]
    fn reward_halves_per_cycle() {
        let p = profile("alpha");
        assert_eq!(p.mint_reward_at(0), 64);
        assert_eq!(p.mint_reward_at(3), 64);
        assert_eq!(p.mint_reward_at(4), 32);
        assert_eq!(p.mint_reward_at(9), 16);
        let mut flat = profile("beta");
        flat.halve_cycle = 0;
        assert_eq!(flat.mint_reward_at(1_000_000), 64);
    }

    #[test]
    fn upgradable_guard_admits_readers_until_upgrade() {
        let origin = Hash256::digest(b"origin");
        let fork = Fork::new(origin, origin, profile("alpha"));
        let pin = fork.upgradable_read_arc();
        // plain readers coexist with the upgradable pin
        assert_eq!(fork.last(), origin);
        let mut write = ArcRwLockUpgradableReadGuard::upgrade(pin);
        write.last = Hash256::digest(b"next");
        drop(write);
        assert_eq!(fork.last(), Hash256::digest(b"next"));
    }

    #[test]
    fn registry_tracks_names() {
        let origin = Hash256::digest(b"origin");
        let mut registry = ForkRegistry::new();
        registry.insert(Fork::new(origin, origin, profile("alpha")));
        assert!(registry.contains(&origin));
        assert!(registry.name_in_use("alpha"));
        assert!(!registry.name_in_use("beta"));
        assert_eq!(registry.origins(), vec![origin]);
    }
}
