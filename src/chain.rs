//! The chain engine: public entry point tying the store, the verifier and
//! the delegate subsystem together.
//!
//! One engine instance serves one node. All methods take `&self`; internal
//! synchronization follows the store's lock discipline, with candidate
//! validation running under the target fork's upgradable pin so competing
//! commits serialize while readers stay admitted.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use lru::LruCache;
use parking_lot::Mutex;
use primitive_types::U256;

use crate::amount::Amount;
use crate::block::{Block, BlockType, ChangeSet, MintType, PiggybackProof};
use crate::chaintrust::{compare, ComparisonResult};
use crate::checkpoints::Checkpoints;
use crate::config::{ChainConfig, ENROLL_MINIMUM};
use crate::delegate::{self, select_enrolled, DelegateAgreement, DelegateEnrolled};
use crate::destination::{ProofCrypto, RewardSource, TemplateOracle, TemplateRole};
use crate::error::{Error, Result, StorageError};
use crate::fork::ForkProfile;
use crate::hash::Hash256;
use crate::index::BlockIndex;
use crate::store::{Backend, ChainStore};
use crate::transaction::TxType;
use crate::verifier::{self, BlockVerifier};

const ENROLLED_CACHE_SIZE: usize = 64;
const AGREEMENT_CACHE_SIZE: usize = 16;

/// Current cursor of one fork.
#[derive(Clone, Debug)]
pub struct ForkStatus {
    pub origin: Hash256,
    pub name: String,
    pub symbol: String,
    pub last_block: Hash256,
    pub last_height: u32,
    pub last_time: u32,
    pub money_supply: Amount,
    pub money_destroy: Amount,
}

#[derive(Clone, Debug)]
pub struct BlockStatus {
    pub hash: Hash256,
    pub fork: Hash256,
    pub height: u32,
    pub timestamp: u32,
    pub block_type: BlockType,
    /// Whether the block sits on its fork's committed chain.
    pub confirmed: bool,
}

/// Everything proof verification derived about a candidate block.
struct ProofOutcome {
    trust_delta: U256,
    mint_type: MintType,
    dest_mint: crate::destination::Destination,
    ref_block: Hash256,
    proof_bits: u32,
    ref_time: Option<u32>,
}

pub struct ChainEngine {
    config: ChainConfig,
    store: ChainStore,
    verifier: BlockVerifier,
    oracle: Arc<dyn TemplateOracle>,
    crypto: Arc<dyn ProofCrypto>,
    rewards: Arc<dyn RewardSource>,
    checkpoints: Checkpoints,
    genesis: Mutex<Hash256>,
    enrolled_cache: Mutex<LruCache<Hash256, DelegateEnrolled>>,
    agreement_cache: Mutex<LruCache<Hash256, DelegateAgreement>>,
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

impl ChainEngine {
    pub fn new(
        config: ChainConfig,
        backend: Arc<dyn Backend>,
        oracle: Arc<dyn TemplateOracle>,
        crypto: Arc<dyn ProofCrypto>,
        rewards: Arc<dyn RewardSource>,
        checkpoints: Checkpoints,
    ) -> Self {
        ChainEngine {
            config,
            store: ChainStore::new(backend),
            verifier: BlockVerifier::new(oracle.clone(), crypto.clone()),
            oracle,
            crypto,
            rewards,
            checkpoints,
            genesis: Mutex::new(Hash256::zero()),
            enrolled_cache: Mutex::new(LruCache::new(ENROLLED_CACHE_SIZE)),
            agreement_cache: Mutex::new(LruCache::new(AGREEMENT_CACHE_SIZE)),
        }
    }

    /// Bootstrap from the backend, seeding the genesis block when empty.
    pub fn initiate(&self, genesis: Block, profile: ForkProfile) -> Result<bool> {
        let hash = genesis.hash();
        self.checkpoints.check(&hash, 0, &hash)?;
        let index = BlockIndex {
            hash,
            prev: None,
            next: None,
            origin: hash,
            block_type: genesis.block_type,
            mint_type: MintType::Genesis,
            dest_mint: genesis.tx_mint.send_to,
            height: 0,
            timestamp: genesis.timestamp,
            proof_bits: 0,
            ref_block: Hash256::zero(),
            trust: U256::zero(),
            money_supply: genesis.tx_mint.amount,
            money_destroy: 0,
            location: Default::default(),
        };
        let fresh = self.store.initiate(&genesis, profile, index, &*self.oracle)?;
        *self.genesis.lock() = hash;
        Ok(fresh)
    }

    pub fn genesis_hash(&self) -> Hash256 {
        *self.genesis.lock()
    }

    pub fn store(&self) -> &ChainStore {
        &self.store
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Validate and index one non-origin block, committing the fork cursor
    /// to it when it out-trusts the current tip.
    pub fn add_new_block(&self, block: Block) -> Result<ChangeSet> {
        let hash = block.hash();
        if self.store.exists(&hash) {
            return Err(Error::DuplicateBlock(hash));
        }
        if block.is_origin() {
            return Err(Error::InvalidForkType(hash));
        }
        let prev = self
            .store
            .get_index(&block.prev)
            .ok_or(Error::MissingPrev(block.prev))?;
        let origin = prev.origin;
        let fork = self
            .store
            .get_fork(&origin)
            .ok_or(Error::UnknownFork(origin))?;
        let profile = fork.profile();
        let height = prev.height + 1;
        self.checkpoints.check(&origin, height, &hash)?;
        self.verifier.verify_structure(&block, unix_now())?;

        let genesis = self.genesis_hash();
        let on_primary = origin == genesis;
        let placement_ok = match block.block_type {
            BlockType::Primary => on_primary,
            BlockType::Subsidiary | BlockType::Extended | BlockType::Vacant => !on_primary,
            _ => false,
        };
        if !placement_ok {
            return Err(Error::InvalidForkType(hash));
        }

        let outcome = self.verify_proof(&block, &prev, height, &genesis)?;

        let index = BlockIndex {
            hash,
            prev: Some(prev.hash),
            next: None,
            origin,
            block_type: block.block_type,
            mint_type: outcome.mint_type,
            dest_mint: outcome.dest_mint,
            height,
            timestamp: block.timestamp,
            proof_bits: outcome.proof_bits,
            ref_block: outcome.ref_block,
            trust: prev.trust + outcome.trust_delta,
            money_supply: prev.money_supply + block.tx_mint.amount,
            money_destroy: prev.money_destroy,
            location: Default::default(),
        };

        // ledger validation under the fork's upgradable pin
        let mut view = self.store.get_view(&origin, prev.hash, true)?;
        let total_fees: Amount = block.txs.iter().map(|t| t.fee).sum();
        let reward = verifier::mint_reward(&profile, &*self.rewards, &prev.hash, height)?;
        self.verifier.verify_mint(&block, reward, total_fees)?;
        self.verify_cert_budget(&block, &prev, hash)?;

        view.apply_block(&block, height)?;
        for tx in &block.txs {
            let txid = tx.txid();
            let ctx = view
                .get_tx_context(&txid)?
                .ok_or_else(|| StorageError::MissingEntry(format!("tx context {}", txid)))?;
            self.verifier
                .verify_payload_tx(tx, &ctx.dest_in, block.timestamp, profile.min_tx_fee)?;
            if tx.tx_type == TxType::Cert {
                self.verify_cert_tx(tx, &ctx.dest_in, &prev)?;
            }
        }

        let indexed = self.store.add_new(&block, index, outcome.ref_time)?;
        let current = self
            .store
            .get_index(&view.tip())
            .ok_or(Error::MissingPrev(view.tip()))?;
        if compare(&indexed, &current) == ComparisonResult::PreferCandidate {
            return self.store.commit_view(view, &indexed, &*self.oracle);
        }

        drop(view);
        tracing::debug!(
            "block {} indexed at height {} without displacing tip {}",
            hash,
            height,
            current.hash
        );
        Ok(ChangeSet {
            fork: origin,
            last_block: current.hash,
            last_height: current.height,
            last_time: current.timestamp,
            money_supply: current.money_supply,
            money_destroy: current.money_destroy,
            committed: false,
            ..Default::default()
        })
    }

    fn verify_proof(
        &self,
        block: &Block,
        prev: &BlockIndex,
        height: u32,
        genesis: &Hash256,
    ) -> Result<ProofOutcome> {
        let hash = block.hash();
        match block.block_type {
            BlockType::Primary => match block.tx_mint.tx_type {
                TxType::Work => {
                    let proof = self.verifier.verify_proof_of_work(block, prev)?;
                    Ok(ProofOutcome {
                        trust_delta: verifier::pow_trust(proof.bits),
                        mint_type: MintType::Work,
                        dest_mint: proof.dest_mint,
                        ref_block: Hash256::zero(),
                        proof_bits: proof.bits,
                        ref_time: None,
                    })
                }
                TxType::Stake => {
                    let enrolled = self.get_candidate_delegate_enrolled(prev)?;
                    if enrolled.is_empty() {
                        return Err(Error::ProofOfStakeInvalid(hash));
                    }
                    let agreement =
                        delegate::verify_proof(hash, &block.proof, &enrolled, &*self.crypto)?;
                    self.verifier.verify_delegated(block, prev, &agreement)?;
                    let bits = verifier::pow_bits(prev);
                    let trust =
                        verifier::dpos_trust(agreement.enroll_trust, bits, agreement.weight)
                            .ok_or(Error::ProofOfStakeInvalid(hash))?;
                    Ok(ProofOutcome {
                        trust_delta: trust,
                        mint_type: MintType::Stake,
                        dest_mint: block.tx_mint.send_to,
                        ref_block: Hash256::zero(),
                        proof_bits: bits,
                        ref_time: None,
                    })
                }
                _ => Err(Error::InvalidForkType(hash)),
            },
            BlockType::Subsidiary | BlockType::Extended | BlockType::Vacant => {
                let piggyback = PiggybackProof::decode(&block.proof)
                    .ok_or(Error::ProofOfStakeInvalid(hash))?;
                if !self.store.verify_ref_block(genesis, &piggyback.ref_block) {
                    return Err(Error::ProofOfStakeInvalid(hash));
                }
                let reference = self
                    .store
                    .get_index(&piggyback.ref_block)
                    .ok_or(Error::MissingPrev(piggyback.ref_block))?;
                // the reference chain must not step backwards
                if !prev.ref_block.is_zero()
                    && !self.store.verify_same_chain(&prev.ref_block, &reference.hash)
                {
                    return Err(Error::ProofOfStakeInvalid(hash));
                }
                let round = self.get_block_delegate_agreement(&reference.hash)?;
                let primary_time = if block.is_vacant() {
                    self.store.primary_time_at_height(genesis, height)
                } else {
                    None
                };
                self.verifier
                    .verify_piggyback(block, prev, &reference, &round, primary_time)?;
                // vacant placeholders claim none of the round's trust
                let trust_delta = if block.is_vacant() {
                    U256::zero()
                } else {
                    let ref_prev_trust = reference
                        .prev
                        .and_then(|p| self.store.get_index(&p))
                        .map(|n| n.trust)
                        .unwrap_or_default();
                    reference.trust - ref_prev_trust
                };
                Ok(ProofOutcome {
                    trust_delta,
                    mint_type: MintType::Stake,
                    dest_mint: block.tx_mint.send_to,
                    ref_block: reference.hash,
                    proof_bits: 0,
                    ref_time: if block.is_extended() {
                        Some(reference.timestamp)
                    } else {
                        None
                    },
                })
            }
            _ => Err(Error::InvalidForkType(hash)),
        }
    }

    fn verify_cert_budget(&self, block: &Block, prev: &BlockIndex, hash: Hash256) -> Result<()> {
        let cert_count = block
            .txs
            .iter()
            .filter(|t| t.tx_type == TxType::Cert)
            .count() as u32;
        if cert_count == 0 {
            return Ok(());
        }
        let bound = self.config.max_cert_count(prev.height);
        let window = self.config.enroll_interval().saturating_sub(1);
        let min_anchor = (prev.height + 2)
            .saturating_sub(self.config.enroll_interval())
            .max(1);
        let seen = self.store.count_recent_enrolls(&prev.hash, window, min_anchor)?;
        if cert_count > bound.saturating_sub(seen) {
            return Err(Error::TransactionInvalid(hash));
        }
        Ok(())
    }

    fn verify_cert_tx(
        &self,
        tx: &crate::transaction::Transaction,
        dest_in: &crate::destination::Destination,
        prev: &BlockIndex,
    ) -> Result<()> {
        let txid = tx.txid();
        let (anchor_height, _) = tx.cert_anchor().ok_or(Error::TransactionInvalid(txid))?;
        if anchor_height > prev.height {
            return Err(Error::TransactionInvalid(txid));
        }
        if self.oracle.classify(dest_in) != TemplateRole::Delegate {
            return Err(Error::TransactionInvalid(txid));
        }
        let anchor = self
            .store
            .walk_back(prev.hash, prev.height - anchor_height)
            .ok_or(Error::MissingPrev(prev.hash))?;
        if self.store.delegate_votes(&anchor, dest_in)? < ENROLL_MINIMUM {
            return Err(Error::TransactionInvalid(txid));
        }
        Ok(())
    }

    /// Validate a fork origin block and register the new fork line.
    pub fn add_new_origin(&self, block: Block) -> Result<ChangeSet> {
        let hash = block.hash();
        if self.store.exists(&hash) {
            return Err(Error::DuplicateBlock(hash));
        }
        if block.block_type != BlockType::Origin {
            return Err(Error::InvalidForkType(hash));
        }
        let prev = self
            .store
            .get_index(&block.prev)
            .ok_or(Error::MissingPrev(block.prev))?;
        if prev.is_extended() || prev.is_vacant() {
            return Err(Error::InvalidForkType(hash));
        }
        let profile: ForkProfile =
            bincode::deserialize(&block.proof).map_err(|_| Error::InvalidForkType(hash))?;
        if profile.is_primary() || profile.parent != prev.origin {
            return Err(Error::InvalidForkType(hash));
        }
        if self.store.fork_name_in_use(&profile.name) {
            return Err(Error::InvalidForkType(hash));
        }
        self.verifier.verify_structure(&block, unix_now())?;

        let height = prev.height + 1;
        let genesis = self.genesis_hash();
        if let Some(t) = self.store.primary_time_at_height(&genesis, height) {
            if t != block.timestamp {
                return Err(Error::TimestampOutOfRange {
                    block: hash,
                    timestamp: block.timestamp,
                });
            }
        }

        if profile.isolated {
            let mut view = self.store.blank_view(hash);
            view.apply_tx(&block.tx_mint, height)?;
        } else {
            // the parent ledger must be reachable at the joint
            let _view = self.store.get_view(&prev.origin, prev.hash, false)?;
        }

        let index = BlockIndex {
            hash,
            prev: Some(prev.hash),
            next: None,
            origin: hash,
            block_type: BlockType::Origin,
            mint_type: MintType::Genesis,
            dest_mint: block.tx_mint.send_to,
            height,
            timestamp: block.timestamp,
            proof_bits: 0,
            ref_block: Hash256::zero(),
            trust: U256::zero(),
            money_supply: block.tx_mint.amount,
            money_destroy: 0,
            location: Default::default(),
        };
        let indexed = self.store.add_new(&block, index, None)?;
        self.store
            .commit_new_fork(&block, &indexed, profile, &*self.oracle)
    }

    /// Committee of the enrollment window ending at `block`.
    pub fn get_block_delegate_enrolled(&self, block: &Hash256) -> Result<DelegateEnrolled> {
        if let Some(hit) = self.enrolled_cache.lock().get(block) {
            return Ok(hit.clone());
        }
        let node = self
            .store
            .get_index(block)
            .ok_or(Error::MissingPrev(*block))?;
        let interval = self.config.enroll_interval();
        if node.height < interval {
            return Ok(DelegateEnrolled::default());
        }
        let range = self.store.range_back(*block, interval)?;
        let avail = self.store.retrieve_avail_delegate(
            block,
            node.height - interval,
            &range,
            ENROLL_MINIMUM,
        )?;
        let enrolled = select_enrolled(avail);
        self.enrolled_cache.lock().put(*block, enrolled.clone());
        Ok(enrolled)
    }

    /// Committee for the round of the block after `prev`.
    pub fn get_candidate_delegate_enrolled(&self, prev: &BlockIndex) -> Result<DelegateEnrolled> {
        if prev.height + 1 < self.config.consensus_interval() {
            return Ok(DelegateEnrolled::default());
        }
        let anchor = self
            .store
            .walk_back(prev.hash, self.config.distribute_interval())
            .ok_or(Error::MissingPrev(prev.hash))?;
        self.get_block_delegate_enrolled(&anchor)
    }

    /// Agreement of a stored primary block's round. Proof-of-work heights
    /// and rounds before the first full consensus window report the empty
    /// agreement.
    pub fn get_block_delegate_agreement(&self, block_hash: &Hash256) -> Result<DelegateAgreement> {
        if let Some(hit) = self.agreement_cache.lock().get(block_hash) {
            return Ok(hit.clone());
        }
        let node = self
            .store
            .get_index(block_hash)
            .ok_or(Error::MissingPrev(*block_hash))?;
        if !node.is_primary() || node.height < self.config.consensus_interval() {
            return Ok(DelegateAgreement::default());
        }
        let block = self.store.retrieve_block(block_hash)?;
        if block.is_proof_of_work() || block.is_genesis() {
            return Ok(DelegateAgreement::default());
        }
        let anchor = self
            .store
            .walk_back(*block_hash, self.config.distribute_interval() + 1)
            .ok_or(Error::MissingPrev(*block_hash))?;
        let enrolled = self.get_block_delegate_enrolled(&anchor)?;
        let agreement = delegate::verify_proof(*block_hash, &block.proof, &enrolled, &*self.crypto)?;
        self.agreement_cache.lock().put(*block_hash, agreement.clone());
        Ok(agreement)
    }

    /// Agreement a candidate block extending `prev` would have to carry.
    pub fn get_candidate_delegate_agreement(
        &self,
        prev_hash: &Hash256,
        proof: &[u8],
    ) -> Result<DelegateAgreement> {
        let prev = self
            .store
            .get_index(prev_hash)
            .ok_or(Error::MissingPrev(*prev_hash))?;
        let enrolled = self.get_candidate_delegate_enrolled(&prev)?;
        if enrolled.is_empty() {
            return Ok(DelegateAgreement::default());
        }
        delegate::verify_proof(*prev_hash, proof, &enrolled, &*self.crypto)
    }

    /// After a primary reorg, retire sub-fork blocks referencing retired
    /// primary blocks and move the fork cursor to the best surviving tip.
    pub fn check_fork_valid_last(&self, origin: &Hash256) -> Result<Option<ChangeSet>> {
        let genesis = self.genesis_hash();
        let (new_tip, invalid) = match self.store.get_fork_valid_last(origin, &genesis)? {
            Some(repair) => repair,
            None => return Ok(None),
        };
        tracing::warn!(
            "fork {} tip invalidated, retiring {} block(s), new tip {}",
            origin,
            invalid.len(),
            new_tip.hash
        );
        let view = self.store.get_view(origin, new_tip.hash, true)?;
        let changes = self.store.commit_view(view, &new_tip, &*self.oracle)?;
        Ok(Some(changes))
    }

    /// Blocks that would be applied and retracted if the fork cursor moved
    /// from its current tip to `target`.
    pub fn get_block_changes(
        &self,
        origin: &Hash256,
        target: &Hash256,
    ) -> Result<(Vec<Block>, Vec<Block>)> {
        let fork = self
            .store
            .get_fork(origin)
            .ok_or(Error::UnknownFork(*origin))?;
        self.store.branch_blocks(fork.last(), *target)
    }

    pub fn get_last_block(&self, origin: &Hash256) -> Option<(Hash256, u32, u32)> {
        let fork = self.store.get_fork(origin)?;
        let node = self.store.get_index(&fork.last())?;
        Some((node.hash, node.height, node.timestamp))
    }

    pub fn get_fork_status(&self, origin: &Hash256) -> Option<ForkStatus> {
        let fork = self.store.get_fork(origin)?;
        let profile = fork.profile();
        let node = self.store.get_index(&fork.last())?;
        Some(ForkStatus {
            origin: *origin,
            name: profile.name,
            symbol: profile.symbol,
            last_block: node.hash,
            last_height: node.height,
            last_time: node.timestamp,
            money_supply: node.money_supply,
            money_destroy: node.money_destroy,
        })
    }

    pub fn get_block_status(&self, hash: &Hash256) -> Option<BlockStatus> {
        let node = self.store.get_index(hash)?;
        let confirmed = self
            .store
            .get_fork(&node.origin)
            .map(|fork| self.store.is_valid_block(&fork.last(), hash))
            .unwrap_or(false);
        Some(BlockStatus {
            hash: node.hash,
            fork: node.origin,
            height: node.height,
            timestamp: node.timestamp,
            block_type: node.block_type,
            confirmed,
        })
    }
}
