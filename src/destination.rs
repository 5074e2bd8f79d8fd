//! Destinations and the external capabilities resolved around them.
//!
//! A destination is an opaque 32 byte address. What a destination *means*
//! (plain key, delegate template, fork template and so on) is owned by the
//! template subsystem outside this crate, consumed here through the
//! [`TemplateOracle`] trait. Cryptographic checks are likewise injected
//! through [`ProofCrypto`] and the primary mint schedule through
//! [`RewardSource`].

use std::fmt;

use serde_derive::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::hash::Hash256;

#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Destination([u8; 32]);

impl Destination {
    pub const fn null() -> Self {
        Destination([0u8; 32])
    }

    pub fn is_null(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Destination(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Semantic role of a destination, resolved by the template subsystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TemplateRole {
    Plain,
    Delegate,
    Vote,
    Fork,
}

/// Destination classification and signature checking, provided externally.
pub trait TemplateOracle: Send + Sync {
    fn classify(&self, dest: &Destination) -> TemplateRole;

    fn verify_destination_signature(&self, dest: &Destination, msg: &Hash256, sig: &[u8])
        -> bool;
}

/// Cryptographic capability: secret-share verification and the
/// domain-specific proof-of-work hash.
pub trait ProofCrypto: Send + Sync {
    /// Verify one published secret share against the committed enrollment
    /// payload of its destination.
    fn verify_share(&self, dest: &Destination, enroll_data: &[u8], share: &[u8]) -> bool;

    fn pow_hash(&self, data: &[u8]) -> Hash256;
}

/// Mint reward for the next primary block, computed by the reward
/// subsystem outside this crate.
pub trait RewardSource: Send + Sync {
    fn primary_mint_reward(&self, prev: &Hash256, height: u32) -> Option<Amount>;
}
