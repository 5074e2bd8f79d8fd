//! Blocks, proof blobs and the changeset emitted on commit.

use std::collections::BTreeSet;

use serde_derive::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::destination::Destination;
use crate::hash::Hash256;
use crate::transaction::Transaction;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, Serialize, Deserialize)]
pub enum BlockType {
    /// Network genesis, the origin of the primary fork.
    Genesis,
    /// Fork creation block, the origin of a sub fork.
    Origin,
    Primary,
    Subsidiary,
    Extended,
    /// Placeholder keeping a sub fork in lockstep with the primary chain.
    Vacant,
}

/// Producer type of the mint transaction, kept on every index node.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, Serialize, Deserialize)]
pub enum MintType {
    Genesis,
    Work,
    Stake,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Block {
    pub version: u16,
    pub block_type: BlockType,
    pub timestamp: u32,
    pub prev: Hash256,
    /// Opaque proof blob, interpreted per block type.
    pub proof: Vec<u8>,
    pub tx_mint: Transaction,
    pub txs: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.version.to_le_bytes());
        hasher.update(&(self.block_type as u8).to_le_bytes());
        hasher.update(&self.timestamp.to_le_bytes());
        hasher.update(self.prev.as_bytes());
        hasher.update(&self.proof);
        hasher.update(self.tx_mint.txid().as_bytes());
        for tx in &self.txs {
            hasher.update(tx.txid().as_bytes());
        }
        Hash256::from(hasher.finalize())
    }

    pub fn is_genesis(&self) -> bool {
        self.block_type == BlockType::Genesis
    }

    pub fn is_origin(&self) -> bool {
        matches!(self.block_type, BlockType::Genesis | BlockType::Origin)
    }

    pub fn is_primary(&self) -> bool {
        matches!(self.block_type, BlockType::Genesis | BlockType::Primary)
    }

    pub fn is_subsidiary(&self) -> bool {
        self.block_type == BlockType::Subsidiary
    }

    pub fn is_extended(&self) -> bool {
        self.block_type == BlockType::Extended
    }

    pub fn is_vacant(&self) -> bool {
        self.block_type == BlockType::Vacant
    }

    pub fn is_proof_of_work(&self) -> bool {
        self.tx_mint.tx_type == crate::transaction::TxType::Work
    }

    pub fn mint_type(&self) -> Option<MintType> {
        match self.tx_mint.tx_type {
            crate::transaction::TxType::Genesis => Some(MintType::Genesis),
            crate::transaction::TxType::Work => Some(MintType::Work),
            crate::transaction::TxType::Stake => Some(MintType::Stake),
            _ => None,
        }
    }

    /// Preimage of the proof-of-work hash: the header with the full proof
    /// blob, so the nonce inside the blob varies the digest.
    pub fn pow_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(64 + self.proof.len());
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(&(self.block_type as u8).to_le_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(self.prev.as_bytes());
        data.extend_from_slice(&self.proof);
        data
    }
}

/// Proof carried by a primary proof-of-work block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PowProof {
    pub algo: u8,
    pub bits: u32,
    pub nonce: u64,
    pub dest_mint: Destination,
}

impl PowProof {
    pub const SIZE: usize = 1 + 4 + 8 + 32;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.push(self.algo);
        out.extend_from_slice(&self.bits.to_le_bytes());
        out.extend_from_slice(&self.nonce.to_le_bytes());
        out.extend_from_slice(self.dest_mint.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let algo = bytes[0];
        let mut bits = [0u8; 4];
        bits.copy_from_slice(&bytes[1..5]);
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&bytes[5..13]);
        let mut dest = [0u8; 32];
        dest.copy_from_slice(&bytes[13..45]);
        Some(PowProof {
            algo,
            bits: u32::from_le_bytes(bits),
            nonce: u64::from_le_bytes(nonce),
            dest_mint: Destination::from_bytes(dest),
        })
    }
}

/// Proof carried by subsidiary, extended and vacant blocks, referencing a
/// primary block's agreement round.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PiggybackProof {
    pub agreement: Hash256,
    pub weight: u64,
    pub ref_block: Hash256,
}

impl PiggybackProof {
    pub const SIZE: usize = 32 + 8 + 32;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(self.agreement.as_bytes());
        out.extend_from_slice(&self.weight.to_le_bytes());
        out.extend_from_slice(self.ref_block.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let mut agreement = [0u8; 32];
        agreement.copy_from_slice(&bytes[..32]);
        let mut weight = [0u8; 8];
        weight.copy_from_slice(&bytes[32..40]);
        let mut ref_block = [0u8; 32];
        ref_block.copy_from_slice(&bytes[40..72]);
        Some(PiggybackProof {
            agreement: Hash256::from_bytes(agreement),
            weight: u64::from_le_bytes(weight),
            ref_block: Hash256::from_bytes(ref_block),
        })
    }
}

/// Result of committing a block: the new fork cursor plus everything the
/// caller must propagate (txpool updates, reorged blocks).
#[derive(Clone, Debug, Default)]
pub struct ChangeSet {
    pub fork: Hash256,
    pub last_block: Hash256,
    pub last_height: u32,
    pub last_time: u32,
    pub money_supply: Amount,
    pub money_destroy: Amount,
    /// Whether the fork cursor actually moved; an indexed but out-trusted
    /// block leaves this false and the lists empty.
    pub committed: bool,
    pub tx_updated: BTreeSet<Hash256>,
    pub blocks_added: Vec<Block>,
    pub blocks_removed: Vec<Block>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TxType;

    fn mint(tx_type: TxType) -> Transaction {
        Transaction {
            version: 1,
            tx_type,
            tx_time: 7,
            lock_until: 0,
            inputs: vec![],
            send_to: Destination::from_bytes([9u8; 32]),
            amount: 100,
            fee: 0,
            data: vec![],
            sig: vec![],
        }
    }

    #[test]
    fn proof_blobs_round_trip() {
        let pow = PowProof {
            algo: 1,
            bits: 8,
            nonce: 0xDEAD_BEEF,
            dest_mint: Destination::from_bytes([3u8; 32]),
        };
        assert_eq!(PowProof::decode(&pow.encode()), Some(pow));
        assert!(PowProof::decode(&[0u8; 4]).is_none());

        let piggyback = PiggybackProof {
            agreement: Hash256::digest(b"agreement"),
            weight: 12,
            ref_block: Hash256::digest(b"ref"),
        };
        assert_eq!(PiggybackProof::decode(&piggyback.encode()), Some(piggyback));
    }

    #[test]
    fn hash_depends_on_proof() {
        let block = Block {
            version: 1,
            block_type: BlockType::Primary,
            timestamp: 1000,
            prev: Hash256::digest(b"prev"),
            proof: vec![1, 2, 3],
            tx_mint: mint(TxType::Work),
            txs: vec![],
        };
        let mut other = block.clone();
        other.proof = vec![1, 2, 4];
        assert_ne!(block.hash(), other.hash());
        assert_eq!(block.mint_type(), Some(MintType::Work));
        assert!(block.is_proof_of_work());
    }
}
