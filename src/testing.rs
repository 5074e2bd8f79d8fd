//! Deterministic fixtures shared by unit and integration tests.
//!
//! The stub capabilities are pure functions of their inputs, so every
//! signature, share and mined proof is reproducible across runs.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use primitive_types::U256;

use crate::amount::Amount;
use crate::block::{Block, BlockType, MintType, PowProof};
use crate::config::{MIN_TX_FEE, TOKEN_INIT};
use crate::destination::{Destination, ProofCrypto, RewardSource, TemplateOracle, TemplateRole};
use crate::fork::ForkProfile;
use crate::hash::Hash256;
use crate::index::BlockIndex;
use crate::transaction::{OutPoint, Transaction, TxIn, TxType};
use crate::verifier::pow_target;

pub const GENESIS_DEST: Destination = Destination::from_bytes([0xAA; 32]);

/// Template oracle with an explicit delegate set and a reproducible
/// signature scheme.
#[derive(Default)]
pub struct StubOracle {
    delegates: Mutex<HashSet<Destination>>,
}

impl StubOracle {
    pub fn with_delegates(delegates: &[Destination]) -> Self {
        StubOracle {
            delegates: Mutex::new(delegates.iter().copied().collect()),
        }
    }

    pub fn register_delegate(&self, dest: Destination) {
        self.delegates.lock().insert(dest);
    }
}

impl TemplateOracle for StubOracle {
    fn classify(&self, dest: &Destination) -> TemplateRole {
        if self.delegates.lock().contains(dest) {
            TemplateRole::Delegate
        } else {
            TemplateRole::Plain
        }
    }

    fn verify_destination_signature(
        &self,
        dest: &Destination,
        msg: &Hash256,
        sig: &[u8],
    ) -> bool {
        sig == expected_signature(dest, msg).as_slice()
    }
}

fn expected_signature(dest: &Destination, msg: &Hash256) -> Vec<u8> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"sig");
    hasher.update(dest.as_bytes());
    hasher.update(msg.as_bytes());
    hasher.finalize().as_bytes().to_vec()
}

/// Sign a built transaction; the txid does not cover the signature.
pub fn sign_tx(tx: &mut Transaction, dest_in: &Destination) {
    tx.sig = expected_signature(dest_in, &tx.txid());
}

/// Deterministic crypto: shares and enrollment payloads are digests of the
/// destination, and the proof-of-work hash is plain blake3 so an 8-bit
/// target is minable in a few hundred nonce attempts.
#[derive(Default)]
pub struct StubCrypto;

impl StubCrypto {
    pub fn enroll_data(&self, dest: &Destination) -> Vec<u8> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"enroll");
        hasher.update(dest.as_bytes());
        hasher.finalize().as_bytes().to_vec()
    }

    pub fn share(&self, dest: &Destination) -> Vec<u8> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"share");
        hasher.update(dest.as_bytes());
        hasher.finalize().as_bytes().to_vec()
    }
}

impl ProofCrypto for StubCrypto {
    fn verify_share(&self, dest: &Destination, enroll_data: &[u8], share: &[u8]) -> bool {
        enroll_data == self.enroll_data(dest).as_slice()
            && share == self.share(dest).as_slice()
    }

    fn pow_hash(&self, data: &[u8]) -> Hash256 {
        Hash256::digest(data)
    }
}

/// Flat reward schedule for the primary chain.
pub struct StubRewards(pub Amount);

impl RewardSource for StubRewards {
    fn primary_mint_reward(&self, _prev: &Hash256, _height: u32) -> Option<Amount> {
        Some(self.0)
    }
}

pub fn work_mint(dest: Destination, amount: Amount, time: u32) -> Transaction {
    Transaction {
        version: 1,
        tx_type: TxType::Work,
        tx_time: time,
        lock_until: 0,
        inputs: vec![],
        send_to: dest,
        amount,
        fee: 0,
        data: vec![],
        sig: vec![],
    }
}

pub fn token_tx(
    inputs: Vec<OutPoint>,
    to: Destination,
    amount: Amount,
    fee: Amount,
    time: u32,
) -> Transaction {
    Transaction {
        version: 1,
        tx_type: TxType::Token,
        tx_time: time,
        lock_until: 0,
        inputs: inputs
            .into_iter()
            .map(|prevout| TxIn { prevout })
            .collect(),
        send_to: to,
        amount,
        fee,
        data: vec![],
        sig: vec![],
    }
}

pub fn genesis_block(amount: Amount) -> Block {
    Block {
        version: 1,
        block_type: BlockType::Genesis,
        timestamp: 1_000,
        prev: Hash256::zero(),
        proof: vec![],
        tx_mint: Transaction {
            version: 1,
            tx_type: TxType::Genesis,
            tx_time: 1_000,
            lock_until: 0,
            inputs: vec![],
            send_to: GENESIS_DEST,
            amount,
            fee: 0,
            data: vec![],
            sig: vec![],
        },
        txs: vec![],
    }
}

pub fn genesis_profile() -> ForkProfile {
    ForkProfile {
        name: "primary".to_string(),
        symbol: "PRI".to_string(),
        owner: GENESIS_DEST,
        parent: Hash256::zero(),
        joint_height: 0,
        amount: TOKEN_INIT,
        mint_reward: 15 * crate::config::COIN,
        min_tx_fee: MIN_TX_FEE,
        halve_cycle: 0,
        isolated: true,
        private_fork: false,
        enclosed: false,
    }
}

/// Bare index node for graph-level tests.
pub fn index_node(
    hash: Hash256,
    prev: Option<Hash256>,
    origin: Hash256,
    height: u32,
    timestamp: u32,
) -> BlockIndex {
    BlockIndex {
        hash,
        prev,
        next: None,
        origin,
        block_type: BlockType::Primary,
        mint_type: MintType::Work,
        dest_mint: Destination::from_bytes([0xAB; 32]),
        height,
        timestamp,
        proof_bits: 8,
        ref_block: Hash256::zero(),
        trust: U256::zero(),
        money_supply: 0,
        money_destroy: 0,
        location: Default::default(),
    }
}

/// Index node derived from a block, chained onto `prev` when given.
pub fn index_for_block(
    block: &Block,
    prev: Option<&BlockIndex>,
    origin: Hash256,
    height: u32,
) -> BlockIndex {
    BlockIndex {
        hash: block.hash(),
        prev: prev.map(|p| p.hash),
        next: None,
        origin,
        block_type: block.block_type,
        mint_type: block.mint_type().unwrap_or(MintType::Stake),
        dest_mint: block.tx_mint.send_to,
        height,
        timestamp: block.timestamp,
        proof_bits: 0,
        ref_block: Hash256::zero(),
        trust: prev.map(|p| p.trust).unwrap_or_default(),
        money_supply: prev.map(|p| p.money_supply).unwrap_or(0) + block.tx_mint.amount,
        money_destroy: prev.map(|p| p.money_destroy).unwrap_or(0),
        location: Default::default(),
    }
}

/// Mine a proof-of-work primary block over the stub hash, scanning nonces
/// until the 8-bit target is met.
pub fn mine_pow_block(
    prev: &BlockIndex,
    dest: Destination,
    timestamp: u32,
    mint_amount: Amount,
    txs: Vec<Transaction>,
) -> Block {
    let crypto = StubCrypto::default();
    let mut mint = work_mint(dest, mint_amount, timestamp);
    mint.fee = 0;
    let mut block = Block {
        version: 1,
        block_type: BlockType::Primary,
        timestamp,
        prev: prev.hash,
        proof: vec![],
        tx_mint: mint,
        txs,
    };
    for nonce in 0u64.. {
        let proof = PowProof {
            algo: 1,
            bits: 8,
            nonce,
            dest_mint: dest,
        };
        block.proof = proof.encode();
        let digest = U256::from_big_endian(crypto.pow_hash(&block.pow_data()).as_bytes());
        if digest <= pow_target(8) {
            break;
        }
    }
    block
}

/// Engine wired with all stub capabilities over a fresh memory backend.
pub fn stub_engine() -> crate::chain::ChainEngine {
    stub_engine_with(Arc::new(StubOracle::default()))
}

pub fn stub_engine_with(oracle: Arc<StubOracle>) -> crate::chain::ChainEngine {
    crate::chain::ChainEngine::new(
        crate::config::ChainConfig::default(),
        Arc::new(crate::store::MemoryBackend::new()),
        oracle,
        Arc::new(StubCrypto::default()),
        Arc::new(StubRewards(15 * crate::config::COIN)),
        crate::checkpoints::Checkpoints::new(),
    )
}
