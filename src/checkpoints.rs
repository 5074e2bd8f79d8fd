//! Hard-coded checkpoint table.

use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};
use crate::hash::Hash256;

/// Pinned `fork -> height -> hash` entries. A candidate block landing on a
/// checkpointed height with a different hash is rejected outright.
#[derive(Clone, Debug, Default)]
pub struct Checkpoints {
    table: HashMap<Hash256, BTreeMap<u32, Hash256>>,
}

impl Checkpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, fork: Hash256, height: u32, hash: Hash256) {
        self.table.entry(fork).or_default().insert(height, hash);
    }

    pub fn get(&self, fork: &Hash256, height: u32) -> Option<Hash256> {
        self.table.get(fork).and_then(|m| m.get(&height)).copied()
    }

    pub fn check(&self, fork: &Hash256, height: u32, hash: &Hash256) -> Result<()> {
        match self.get(fork, height) {
            Some(expected) if expected != *hash => Err(Error::CheckpointMismatch {
                fork: *fork,
                height,
                expected,
                found: *hash,
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_only_on_checkpointed_heights() {
        let fork = Hash256::digest(b"fork");
        let pinned = Hash256::digest(b"pinned");
        let mut checkpoints = Checkpoints::new();
        checkpoints.insert(fork, 10, pinned);

        checkpoints.check(&fork, 10, &pinned).unwrap();
        checkpoints.check(&fork, 11, &Hash256::digest(b"other")).unwrap();
        checkpoints
            .check(&Hash256::digest(b"other fork"), 10, &Hash256::digest(b"x"))
            .unwrap();
        assert!(matches!(
            checkpoints.check(&fork, 10, &Hash256::digest(b"wrong")),
            Err(Error::CheckpointMismatch { height: 10, .. })
        ));
    }
}
