//! Agreement derivation and ballot selection for one consensus round.
//!
//! A delegated block carries the published secret shares of the round. The
//! shares are verified against the committee's committed enrollment
//! payloads, folded into the round agreement, and the agreement picks the
//! single producer for the round by weighted reduction. A round with no
//! valid shares degrades to proof of work.

use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::config::{ENROLL_MAXIMUM, ENROLL_MINIMUM, STAKE_MAXIMUM_TIMES, STAKE_UNIT};
use crate::destination::{Destination, ProofCrypto};
use crate::error::{Error, Result};
use crate::hash::Hash256;

use super::DelegateEnrolled;

/// Proof blob of a delegated primary block.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct AgreementProof {
    pub shares: Vec<(Destination, Vec<u8>)>,
}

impl AgreementProof {
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }

    pub fn encode(&self) -> Vec<u8> {
        // the proof is a plain vector of pairs, serialization cannot fail
        bincode::serialize(self).unwrap_or_default()
    }
}

/// Outcome of one consensus round.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct DelegateAgreement {
    pub agreement: Hash256,
    pub weight: u64,
    pub ballot: Vec<Destination>,
    /// Stake-derived trust exponent of the round, from the bonds of the
    /// delegates whose shares made it into the agreement.
    pub enroll_trust: u64,
}

impl DelegateAgreement {
    /// A zero agreement means the round produced no delegated consensus
    /// and the height falls back to proof of work.
    pub fn is_proof_of_work(&self) -> bool {
        self.agreement.is_zero()
    }

    pub fn ballot_at(&self, index: usize) -> Option<&Destination> {
        self.ballot.get(index)
    }
}

/// Verify the published shares of `proof` against the enrolled committee
/// and derive the round agreement and ballot.
pub fn verify_proof(
    block: Hash256,
    proof: &[u8],
    enrolled: &DelegateEnrolled,
    crypto: &dyn ProofCrypto,
) -> Result<DelegateAgreement> {
    let decoded =
        AgreementProof::decode(proof).ok_or(Error::ProofOfStakeInvalid(block))?;
    if decoded.shares.is_empty() {
        return Err(Error::ProofOfStakeInvalid(block));
    }

    let mut weight = 0u64;
    let mut verified: BTreeMap<Destination, Vec<u8>> = BTreeMap::new();
    for (dest, share) in decoded.shares {
        let enroll_data = enrolled
            .enroll_data
            .get(&dest)
            .ok_or(Error::ProofOfStakeInvalid(block))?;
        if verified.contains_key(&dest) || !crypto.verify_share(&dest, enroll_data, &share) {
            return Err(Error::ProofOfStakeInvalid(block));
        }
        weight += enrolled.weights.get(&dest).copied().unwrap_or(0);
        verified.insert(dest, share);
    }

    let mut hasher = blake3::Hasher::new();
    for (dest, share) in &verified {
        hasher.update(dest.as_bytes());
        hasher.update(share);
    }
    let agreement = Hash256::from(hasher.finalize());

    // ballot weights and the trust term count only the delegates whose
    // shares survived verification; the bonds are summed before dividing
    let mut participating: BTreeMap<Destination, Amount> = BTreeMap::new();
    let mut bonded: Amount = 0;
    for dest in verified.keys() {
        if let Some(amount) = enrolled.amounts.get(dest) {
            participating.insert(*dest, *amount);
            bonded += (*amount).min(ENROLL_MAXIMUM);
        }
    }
    let enroll_trust = (bonded / ENROLL_MINIMUM) as u64;
    let ballot = select_ballot(&agreement, &participating);
    Ok(DelegateAgreement {
        agreement,
        weight,
        ballot,
        enroll_trust,
    })
}

/// Reduce the agreement to the round's producer. Each delegate weighs
/// `min(amount, ENROLL_MAXIMUM) / STAKE_UNIT`; the agreement bytes fold
/// into a selector that lands on exactly one weighted slot.
pub fn select_ballot(
    agreement: &Hash256,
    amounts: &BTreeMap<Destination, Amount>,
) -> Vec<Destination> {
    if agreement.is_zero() {
        return Vec::new();
    }
    let mut weights: BTreeMap<Destination, u64> = BTreeMap::new();
    for (dest, amount) in amounts {
        let w = ((*amount).min(ENROLL_MAXIMUM) / STAKE_UNIT) as u64;
        if w > 0 {
            weights.insert(*dest, w);
        }
    }
    let total: u64 = weights.values().sum();
    if total == 0 {
        return Vec::new();
    }

    let mut selector = 0u64;
    for byte in agreement.as_bytes() {
        selector ^= *byte as u64;
    }
    let mut n =
        ((selector as u128 * STAKE_MAXIMUM_TIMES as u128) % total as u128) as u64;
    for (dest, w) in &weights {
        if n < *w {
            return vec![*dest];
        }
        n -= *w;
    }
    Vec::new()
}
