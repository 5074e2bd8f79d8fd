//! Block validation: structure, proofs, timing and transaction rules.
//!
//! The verifier is stateless over the chain; everything contextual (the
//! previous index node, the round agreement, primary-chain timing) is
//! passed in by the engine. Cryptography and destination semantics come
//! through the injected capabilities.

use std::sync::Arc;

use primitive_types::U256;

use crate::amount::{min_tx_fee, Amount};
use crate::block::{Block, BlockType, MintType, PiggybackProof, PowProof};
use crate::config::{
    BLOCK_TARGET_SPACING, EXTENDED_BLOCK_SPACING, MAX_BLOCK_SIZE, MAX_CLOCK_DRIFT,
    PROOF_OF_WORK_BLOCK_SPACING,
};
use crate::delegate::DelegateAgreement;
use crate::destination::{Destination, ProofCrypto, TemplateOracle};
use crate::error::{Error, Result, StorageError};
use crate::fork::ForkProfile;
use crate::hash::Hash256;
use crate::index::BlockIndex;
use crate::transaction::{Transaction, TxType};

/// Difficulty schedule. Fixed for now; the schedule hook keeps the
/// previous node in the signature.
pub fn pow_bits(_prev: &BlockIndex) -> u32 {
    8
}

pub fn pow_target(bits: u32) -> U256 {
    !U256::zero() >> bits as usize
}

pub fn pow_trust(bits: u32) -> U256 {
    U256::one() << bits as usize
}

/// Trust of an agreed block. All three terms must be live, otherwise the
/// round cannot claim delegated trust.
pub fn dpos_trust(enroll_trust: u64, bits: u32, weight: u64) -> Option<U256> {
    if enroll_trust == 0 || bits == 0 || weight == 0 {
        return None;
    }
    Some(U256::one() << (enroll_trust as usize + bits as usize + 20))
}

/// Earliest admissible timestamp for the block after `prev`.
pub fn next_block_timestamp(prev_mint: MintType, prev_time: u32, target: MintType) -> u32 {
    match (prev_mint, target) {
        (MintType::Stake, _) | (_, MintType::Stake) => prev_time + BLOCK_TARGET_SPACING,
        _ => prev_time + PROOF_OF_WORK_BLOCK_SPACING,
    }
}

/// Extended blocks subdivide one primary round on a fixed cadence.
pub fn extended_timestamp_ok(ref_time: u32, prev_time: u32, timestamp: u32) -> bool {
    timestamp > ref_time
        && timestamp < ref_time + BLOCK_TARGET_SPACING
        && timestamp > prev_time
        && (timestamp - prev_time) % EXTENDED_BLOCK_SPACING == 0
}

pub struct BlockVerifier {
    oracle: Arc<dyn TemplateOracle>,
    crypto: Arc<dyn ProofCrypto>,
}

impl BlockVerifier {
    pub fn new(oracle: Arc<dyn TemplateOracle>, crypto: Arc<dyn ProofCrypto>) -> Self {
        BlockVerifier { oracle, crypto }
    }

    /// Shape checks independent of chain context.
    pub fn verify_structure(&self, block: &Block, now: u32) -> Result<()> {
        let hash = block.hash();
        let size = bincode::serialized_size(block)
            .map_err(|e| StorageError::Codec(e.to_string()))?;
        if size > MAX_BLOCK_SIZE {
            return Err(Error::Oversize { block: hash, size });
        }
        if now > 0 && block.timestamp > now + MAX_CLOCK_DRIFT {
            return Err(Error::TimestampOutOfRange {
                block: hash,
                timestamp: block.timestamp,
            });
        }
        let mint_ok = match block.block_type {
            BlockType::Genesis | BlockType::Origin => {
                block.tx_mint.tx_type == TxType::Genesis
            }
            BlockType::Primary => matches!(
                block.tx_mint.tx_type,
                TxType::Work | TxType::Stake
            ),
            BlockType::Subsidiary | BlockType::Extended => {
                block.tx_mint.tx_type == TxType::Stake
            }
            BlockType::Vacant => block.tx_mint.amount == 0 && block.txs.is_empty(),
        };
        if !mint_ok {
            return Err(Error::InvalidForkType(hash));
        }
        if !block.is_vacant() && block.tx_mint.tx_time != block.timestamp {
            return Err(Error::TimestampOutOfRange {
                block: hash,
                timestamp: block.tx_mint.tx_time,
            });
        }
        Ok(())
    }

    /// Check a proof-of-work primary block against the previous node,
    /// returning the decoded proof.
    pub fn verify_proof_of_work(&self, block: &Block, prev: &BlockIndex) -> Result<PowProof> {
        let hash = block.hash();
        let proof = PowProof::decode(&block.proof).ok_or(Error::ProofOfWorkInvalid(hash))?;
        if proof.bits != pow_bits(prev) {
            return Err(Error::ProofOfWorkInvalid(hash));
        }
        if proof.dest_mint != block.tx_mint.send_to {
            return Err(Error::ProofOfWorkInvalid(hash));
        }
        let earliest = next_block_timestamp(prev.mint_type, prev.timestamp, MintType::Work);
        if block.timestamp < earliest {
            return Err(Error::TimestampOutOfRange {
                block: hash,
                timestamp: block.timestamp,
            });
        }
        let digest = U256::from_big_endian(
            self.crypto.pow_hash(&block.pow_data()).as_bytes(),
        );
        if digest > pow_target(proof.bits) {
            return Err(Error::ProofOfWorkInvalid(hash));
        }
        Ok(proof)
    }

    /// Check an agreed primary block: the round's ballot names exactly
    /// this producer and the slot timing is exact.
    pub fn verify_delegated(
        &self,
        block: &Block,
        prev: &BlockIndex,
        agreement: &DelegateAgreement,
    ) -> Result<()> {
        let hash = block.hash();
        if agreement.is_proof_of_work() || agreement.weight == 0 {
            return Err(Error::ProofOfStakeInvalid(hash));
        }
        if agreement.ballot_at(0) != Some(&block.tx_mint.send_to) {
            return Err(Error::ProofOfStakeInvalid(hash));
        }
        let slot = next_block_timestamp(prev.mint_type, prev.timestamp, MintType::Stake);
        if block.timestamp != slot {
            return Err(Error::TimestampOutOfRange {
                block: hash,
                timestamp: block.timestamp,
            });
        }
        Ok(())
    }

    /// Check a piggybacked sub-fork block (subsidiary, extended or vacant)
    /// against the agreement of its referenced primary round.
    pub fn verify_piggyback(
        &self,
        block: &Block,
        prev: &BlockIndex,
        reference: &BlockIndex,
        round: &DelegateAgreement,
        primary_time: Option<u32>,
    ) -> Result<PiggybackProof> {
        let hash = block.hash();
        let proof =
            PiggybackProof::decode(&block.proof).ok_or(Error::ProofOfStakeInvalid(hash))?;
        if proof.ref_block != reference.hash {
            return Err(Error::ProofOfStakeInvalid(hash));
        }
        if proof.agreement != round.agreement {
            return Err(Error::AgreementMismatch {
                block: hash,
                declared: proof.agreement,
                derived: round.agreement,
            });
        }
        if proof.weight != round.weight {
            return Err(Error::ProofOfStakeInvalid(hash));
        }
        match block.block_type {
            BlockType::Subsidiary => {
                if round.ballot_at(0) != Some(&block.tx_mint.send_to) {
                    return Err(Error::ProofOfStakeInvalid(hash));
                }
                if block.timestamp != reference.timestamp
                    || block.timestamp <= prev.timestamp
                {
                    return Err(Error::TimestampOutOfRange {
                        block: hash,
                        timestamp: block.timestamp,
                    });
                }
            }
            BlockType::Extended => {
                if round.ballot_at(0) != Some(&block.tx_mint.send_to) {
                    return Err(Error::ProofOfStakeInvalid(hash));
                }
                if !extended_timestamp_ok(reference.timestamp, prev.timestamp, block.timestamp)
                {
                    return Err(Error::TimestampOutOfRange {
                        block: hash,
                        timestamp: block.timestamp,
                    });
                }
            }
            BlockType::Vacant => {
                // lockstep with the primary chain at the same height
                match primary_time {
                    Some(t) if t == block.timestamp => {}
                    _ => {
                        return Err(Error::TimestampOutOfRange {
                            block: hash,
                            timestamp: block.timestamp,
                        })
                    }
                }
            }
            _ => return Err(Error::InvalidForkType(hash)),
        }
        Ok(proof)
    }

    /// Static rules of one payload transaction; the spending destination
    /// was resolved by the ledger view.
    pub fn verify_payload_tx(
        &self,
        tx: &Transaction,
        dest_in: &Destination,
        block_time: u32,
        base_fee: Amount,
    ) -> Result<()> {
        let txid = tx.txid();
        if !matches!(tx.tx_type, TxType::Token | TxType::Cert) {
            return Err(Error::TransactionInvalid(txid));
        }
        if tx.send_to.is_null() || tx.amount <= 0 {
            return Err(Error::TransactionInvalid(txid));
        }
        if tx.tx_time > block_time {
            return Err(Error::TransactionInvalid(txid));
        }
        if tx.fee < min_tx_fee(tx.data.len(), base_fee) {
            return Err(Error::TransactionInvalid(txid));
        }
        if !self
            .oracle
            .verify_destination_signature(dest_in, &txid, &tx.sig)
        {
            return Err(Error::TransactionInvalid(txid));
        }
        Ok(())
    }

    /// The mint may claim at most the height reward plus the block's fees.
    pub fn verify_mint(
        &self,
        block: &Block,
        reward: Amount,
        total_fees: Amount,
    ) -> Result<()> {
        if block.is_vacant() {
            return Ok(());
        }
        if block.tx_mint.amount > reward + total_fees {
            return Err(Error::TransactionInvalid(block.tx_mint.txid()));
        }
        Ok(())
    }
}

/// Height reward of a sub fork, or the injected source for the primary.
pub fn mint_reward(
    profile: &ForkProfile,
    rewards: &dyn crate::destination::RewardSource,
    prev: &Hash256,
    height: u32,
) -> Result<Amount> {
    if profile.is_primary() {
        rewards
            .primary_mint_reward(prev, height)
            .ok_or(Error::MissingPrev(*prev))
    } else {
        Ok(profile.mint_reward_at(height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{index_node, work_mint, StubCrypto, StubOracle};
    use std::collections::BTreeMap;

    fn verifier() -> BlockVerifier {
        BlockVerifier::new(
            Arc::new(StubOracle::default()),
            Arc::new(StubCrypto::default()),
        )
    }

    fn prev_node(mint: MintType, time: u32) -> BlockIndex {
        let origin = Hash256::digest(b"origin");
        let mut node = index_node(Hash256::digest(b"prev"), None, origin, 4, time);
        node.mint_type = mint;
        node
    }

    fn pow_block(prev: &BlockIndex, dest: Destination, timestamp: u32) -> Block {
        let crypto = StubCrypto::default();
        let mut block = Block {
            version: 1,
            block_type: BlockType::Primary,
            timestamp,
            prev: prev.hash,
            proof: vec![],
            tx_mint: work_mint(dest, 1_000, timestamp),
            txs: vec![],
        };
        // mine: scan nonces until the stub pow digest meets the target
        for nonce in 0u64.. {
            let proof = PowProof {
                algo: 1,
                bits: 8,
                nonce,
                dest_mint: dest,
            };
            block.proof = proof.encode();
            let digest =
                U256::from_big_endian(crypto.pow_hash(&block.pow_data()).as_bytes());
            if digest <= pow_target(8) {
                break;
            }
        }
        block
    }

    #[test]
    fn mined_proof_of_work_passes() {
        let prev = prev_node(MintType::Work, 1_000);
        let dest = Destination::from_bytes([7u8; 32]);
        let block = pow_block(&prev, dest, 1_010);
        let proof = verifier().verify_proof_of_work(&block, &prev).unwrap();
        assert_eq!(proof.bits, 8);
        assert_eq!(proof.dest_mint, dest);
    }

    #[test]
    fn bad_nonce_fails_proof_of_work() {
        let prev = prev_node(MintType::Work, 1_000);
        let dest = Destination::from_bytes([7u8; 32]);
        let mut block = pow_block(&prev, dest, 1_010);
        let mut proof = PowProof::decode(&block.proof).unwrap();
        proof.nonce = proof.nonce.wrapping_add(1);
        block.proof = proof.encode();
        // one nonce off almost surely misses an 8-bit target
        assert!(matches!(
            verifier().verify_proof_of_work(&block, &prev),
            Err(Error::ProofOfWorkInvalid(_))
        ));
    }

    #[test]
    fn early_proof_of_work_is_out_of_range() {
        let prev = prev_node(MintType::Work, 1_000);
        let dest = Destination::from_bytes([7u8; 32]);
        let block = pow_block(&prev, dest, 1_005);
        assert!(matches!(
            verifier().verify_proof_of_work(&block, &prev),
            Err(Error::TimestampOutOfRange { .. })
        ));
    }

    #[test]
    fn delegated_slot_is_exact() {
        let prev = prev_node(MintType::Stake, 1_000);
        let dest = Destination::from_bytes([7u8; 32]);
        let mut block = Block {
            version: 1,
            block_type: BlockType::Primary,
            timestamp: 1_010,
            prev: prev.hash,
            proof: vec![],
            tx_mint: work_mint(dest, 1_000, 1_010),
            txs: vec![],
        };
        block.tx_mint.tx_type = TxType::Stake;
        let agreement = DelegateAgreement {
            agreement: Hash256::digest(b"round"),
            weight: 3,
            ballot: vec![dest],
            enroll_trust: 5,
        };
        verifier().verify_delegated(&block, &prev, &agreement).unwrap();

        block.timestamp = 1_011;
        block.tx_mint.tx_time = 1_011;
        assert!(matches!(
            verifier().verify_delegated(&block, &prev, &agreement),
            Err(Error::TimestampOutOfRange { .. })
        ));

        block.timestamp = 1_010;
        block.tx_mint.tx_time = 1_010;
        let other = DelegateAgreement {
            ballot: vec![Destination::from_bytes([9u8; 32])],
            ..agreement.clone()
        };
        assert!(matches!(
            verifier().verify_delegated(&block, &prev, &other),
            Err(Error::ProofOfStakeInvalid(_))
        ));
    }

    #[test]
    fn dpos_trust_requires_all_terms() {
        assert_eq!(dpos_trust(0, 8, 1), None);
        assert_eq!(dpos_trust(3, 0, 1), None);
        assert_eq!(dpos_trust(3, 8, 0), None);
        assert_eq!(dpos_trust(3, 8, 1), Some(U256::one() << 31));
    }

    #[test]
    fn extended_cadence() {
        // reference at 1000, prev at 1002, spacing 1s within a 10s round
        assert!(extended_timestamp_ok(1_000, 1_002, 1_003));
        assert!(!extended_timestamp_ok(1_000, 1_002, 1_000));
        assert!(!extended_timestamp_ok(1_000, 1_002, 1_010));
        assert!(!extended_timestamp_ok(1_000, 1_002, 1_002));
    }

    fn agreed_round(producer: Destination) -> DelegateAgreement {
        DelegateAgreement {
            agreement: Hash256::digest(b"round"),
            weight: 3,
            ballot: vec![producer],
            enroll_trust: 5,
        }
    }

    fn piggyback_block(
        block_type: BlockType,
        timestamp: u32,
        prev: &BlockIndex,
        reference: &BlockIndex,
        round: &DelegateAgreement,
        producer: Destination,
    ) -> Block {
        let proof = PiggybackProof {
            agreement: round.agreement,
            weight: round.weight,
            ref_block: reference.hash,
        };
        let mut mint = work_mint(producer, 5, timestamp);
        mint.tx_type = TxType::Stake;
        Block {
            version: 1,
            block_type,
            timestamp,
            prev: prev.hash,
            proof: proof.encode(),
            tx_mint: mint,
            txs: vec![],
        }
    }

    fn reference_node(timestamp: u32) -> BlockIndex {
        let primary = Hash256::digest(b"primary");
        index_node(Hash256::digest(b"ref"), None, primary, 5, timestamp)
    }

    #[test]
    fn subsidiary_producer_must_match_the_ballot() {
        let producer = Destination::from_bytes([7u8; 32]);
        let round = agreed_round(producer);
        let reference = reference_node(1_050);
        let prev = prev_node(MintType::Stake, 1_040);

        let block =
            piggyback_block(BlockType::Subsidiary, 1_050, &prev, &reference, &round, producer);
        verifier()
            .verify_piggyback(&block, &prev, &reference, &round, None)
            .unwrap();

        let intruder = piggyback_block(
            BlockType::Subsidiary,
            1_050,
            &prev,
            &reference,
            &round,
            Destination::from_bytes([9u8; 32]),
        );
        assert!(matches!(
            verifier().verify_piggyback(&intruder, &prev, &reference, &round, None),
            Err(Error::ProofOfStakeInvalid(_))
        ));

        // a declared agreement differing from the derived round is its own error
        let mut tampered = block;
        let mut proof = PiggybackProof::decode(&tampered.proof).unwrap();
        proof.agreement = Hash256::digest(b"other");
        tampered.proof = proof.encode();
        assert!(matches!(
            verifier().verify_piggyback(&tampered, &prev, &reference, &round, None),
            Err(Error::AgreementMismatch { .. })
        ));
    }

    #[test]
    fn extended_block_follows_the_cadence() {
        let producer = Destination::from_bytes([7u8; 32]);
        let round = agreed_round(producer);
        let reference = reference_node(1_050);
        let prev = prev_node(MintType::Stake, 1_051);

        let block =
            piggyback_block(BlockType::Extended, 1_052, &prev, &reference, &round, producer);
        verifier()
            .verify_piggyback(&block, &prev, &reference, &round, None)
            .unwrap();

        // the reference round ends at ref_time + spacing
        let late =
            piggyback_block(BlockType::Extended, 1_060, &prev, &reference, &round, producer);
        assert!(matches!(
            verifier().verify_piggyback(&late, &prev, &reference, &round, None),
            Err(Error::TimestampOutOfRange { .. })
        ));
    }

    #[test]
    fn vacant_block_locks_to_the_primary_round_time() {
        let round = DelegateAgreement::default();
        let reference = reference_node(1_050);
        let prev = prev_node(MintType::Stake, 1_040);
        let block = piggyback_block(
            BlockType::Vacant,
            1_050,
            &prev,
            &reference,
            &round,
            Destination::null(),
        );

        verifier()
            .verify_piggyback(&block, &prev, &reference, &round, Some(1_050))
            .unwrap();
        assert!(matches!(
            verifier().verify_piggyback(&block, &prev, &reference, &round, Some(1_049)),
            Err(Error::TimestampOutOfRange { .. })
        ));
        assert!(matches!(
            verifier().verify_piggyback(&block, &prev, &reference, &round, None),
            Err(Error::TimestampOutOfRange { .. })
        ));
    }

    #[test]
    fn ballot_reduction_is_deterministic() {
        let mut amounts = BTreeMap::new();
        amounts.insert(Destination::from_bytes([1u8; 32]), crate::config::ENROLL_MINIMUM);
        let a = crate::delegate::select_ballot(&Hash256::digest(b"x"), &amounts);
        let b = crate::delegate::select_ballot(&Hash256::digest(b"x"), &amounts);
        assert_eq!(a, b);
    }
}
