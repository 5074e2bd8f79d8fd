//! Persistence layer: the backend table contract and the chain store that
//! coordinates the block log, the index graph, the fork registry and the
//! per-fork ledger tables.
//!
//! The store owns two coarse locks, one over the index graph and one over
//! the fork registry. Per-fork cursor state lives behind each fork's own
//! lock; the documented order is fork lock first, then graph lock.

mod memory;

pub use memory::MemoryBackend;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::{ArcRwLockUpgradableReadGuard, RwLock};

use crate::amount::Amount;
use crate::block::{Block, ChangeSet};
use crate::destination::{Destination, TemplateOracle, TemplateRole};
use crate::error::{Error, Result, StorageError};
use crate::fork::{Fork, ForkProfile, ForkRegistry};
use crate::hash::Hash256;
use crate::index::{BlockIndex, BlockIndexGraph, BlockLocation};
use crate::transaction::{OutPoint, TxContext, TxOut, TxType};
use crate::view::{ForkGuard, UnspentView};

/// One spendable output as stored in a fork's unspent table.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct UnspentOut {
    pub output: TxOut,
    pub tx_type: TxType,
    pub height: u32,
}

/// Per-transaction index entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TxIndexEntry {
    pub tx_type: TxType,
    pub height: u32,
}

/// Atomic batch applied to one fork's tables on commit.
#[derive(Clone, Debug, Default)]
pub struct ForkTableUpdate {
    pub new_last: Hash256,
    pub unspent_added: Vec<(OutPoint, UnspentOut)>,
    pub unspent_removed: Vec<OutPoint>,
    pub tx_added: Vec<(Hash256, TxIndexEntry, TxContext)>,
    pub tx_removed: Vec<Hash256>,
}

/// Stable ordering key of an enrollment certificate inside the chain.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct EnrollPos {
    pub height: u32,
    pub seq: u32,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct EnrollRecord {
    pub dest: Destination,
    pub anchor_height: u32,
    pub pos: EnrollPos,
    pub data: Vec<u8>,
}

/// Delegate bookkeeping snapshot attached to every committed block: the
/// full vote tally after the block plus the enrollment certificates the
/// block itself carried.
#[derive(Clone, Debug, Default)]
pub struct DelegateContext {
    pub votes: BTreeMap<Destination, Amount>,
    pub enrolls: Vec<EnrollRecord>,
}

/// Storage backend contract. Implementations use interior mutability; the
/// store shares one instance across views and commits.
pub trait Backend: Send + Sync {
    fn append_block(&self, block: &Block) -> std::result::Result<BlockLocation, StorageError>;
    fn read_block(&self, location: BlockLocation) -> std::result::Result<Block, StorageError>;

    fn write_outline(&self, index: &BlockIndex) -> std::result::Result<(), StorageError>;
    fn remove_outline(&self, hash: &Hash256) -> std::result::Result<(), StorageError>;
    /// All persisted outlines in append order, parents before children.
    fn list_outlines(&self) -> std::result::Result<Vec<BlockIndex>, StorageError>;

    fn add_fork_context(
        &self,
        origin: &Hash256,
        profile: &ForkProfile,
    ) -> std::result::Result<(), StorageError>;
    fn list_fork_contexts(&self)
        -> std::result::Result<Vec<(Hash256, ForkProfile)>, StorageError>;

    /// Apply one batch to a fork's tables, all or nothing.
    fn update_fork(
        &self,
        origin: &Hash256,
        update: ForkTableUpdate,
    ) -> std::result::Result<(), StorageError>;
    fn retrieve_fork_last(
        &self,
        origin: &Hash256,
    ) -> std::result::Result<Option<Hash256>, StorageError>;

    fn retrieve_unspent(
        &self,
        origin: &Hash256,
        outpoint: &OutPoint,
    ) -> std::result::Result<Option<UnspentOut>, StorageError>;
    fn retrieve_tx_context(
        &self,
        origin: &Hash256,
        txid: &Hash256,
    ) -> std::result::Result<Option<TxContext>, StorageError>;
    fn retrieve_tx_entry(
        &self,
        origin: &Hash256,
        txid: &Hash256,
    ) -> std::result::Result<Option<TxIndexEntry>, StorageError>;

    fn add_delegate_context(
        &self,
        block: &Hash256,
        ctx: DelegateContext,
    ) -> std::result::Result<(), StorageError>;
    fn retrieve_delegate_context(
        &self,
        block: &Hash256,
    ) -> std::result::Result<Option<DelegateContext>, StorageError>;
    fn remove_delegate_context(&self, block: &Hash256) -> std::result::Result<(), StorageError>;
}

pub struct ChainStore {
    backend: Arc<dyn Backend>,
    graph: RwLock<BlockIndexGraph>,
    forks: RwLock<ForkRegistry>,
}

impl ChainStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        ChainStore {
            backend,
            graph: RwLock::new(BlockIndexGraph::new()),
            forks: RwLock::new(ForkRegistry::new()),
        }
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }

    /// Load persisted state, or seed the store with the genesis block when
    /// the backend is empty. Returns true when genesis was freshly written.
    pub fn initiate(
        &self,
        genesis: &Block,
        profile: ForkProfile,
        index: BlockIndex,
        oracle: &dyn TemplateOracle,
    ) -> Result<bool> {
        let contexts = self.backend.list_fork_contexts()?;
        if !contexts.is_empty() {
            self.restore(contexts)?;
            if !self.graph.read().contains(&index.hash) {
                return Err(Error::CheckpointMismatch {
                    fork: index.hash,
                    height: 0,
                    expected: index.hash,
                    found: Hash256::zero(),
                });
            }
            return Ok(false);
        }

        let mut index = index;
        index.location = self.backend.append_block(genesis)?;
        self.backend.write_outline(&index)?;
        self.backend.add_fork_context(&index.hash, &profile)?;
        self.backend
            .update_fork(&index.hash, seed_update(genesis, &index))?;
        let ctx = delegate_context(genesis, None, DelegateContext::default(), 0, oracle)?;
        self.backend.add_delegate_context(&index.hash, ctx)?;

        let origin = index.hash;
        self.graph.write().insert(index)?;
        self.forks
            .write()
            .insert(Fork::new(origin, origin, profile));
        tracing::info!("seeded chain store with genesis {}", origin);
        Ok(true)
    }

    fn restore(&self, contexts: Vec<(Hash256, ForkProfile)>) -> Result<()> {
        let outlines = self.backend.list_outlines()?;
        {
            let mut graph = self.graph.write();
            for outline in outlines {
                graph.insert(outline)?;
            }
        }
        let mut forks = self.forks.write();
        for (origin, profile) in contexts {
            let last = self
                .backend
                .retrieve_fork_last(&origin)?
                .ok_or_else(|| StorageError::MissingEntry(format!("fork last {}", origin)))?;
            forks.insert(Fork::new(origin, last, profile));
            self.graph.write().set_canonical_chain(last);
        }
        tracing::info!("restored {} fork(s) from backend", forks.origins().len());
        Ok(())
    }

    pub fn exists(&self, hash: &Hash256) -> bool {
        self.graph.read().contains(hash)
    }

    pub fn get_index(&self, hash: &Hash256) -> Option<BlockIndex> {
        self.graph.read().get(hash).cloned()
    }

    pub fn retrieve_block(&self, hash: &Hash256) -> Result<Block> {
        let location = self
            .graph
            .read()
            .get(hash)
            .map(|n| n.location)
            .ok_or(Error::MissingPrev(*hash))?;
        Ok(self.backend.read_block(location)?)
    }

    pub fn get_fork(&self, origin: &Hash256) -> Option<Fork> {
        self.forks.read().get(origin)
    }

    pub fn fork_origins(&self) -> Vec<Hash256> {
        self.forks.read().origins()
    }

    pub fn fork_name_in_use(&self, name: &str) -> bool {
        self.forks.read().name_in_use(name)
    }

    /// Append the block body and index the node. The repeat-mint rule is
    /// enforced under the graph write lock, so two candidates racing for
    /// one height slot cannot both be indexed. A failed outline write
    /// rolls the node back out of the graph so a retry starts clean.
    pub fn add_new(
        &self,
        block: &Block,
        mut index: BlockIndex,
        ref_time: Option<u32>,
    ) -> Result<BlockIndex> {
        let mut graph = self.graph.write();
        graph.verify_repeat_block(
            &index.origin,
            index.height,
            index.hash,
            index.block_type,
            &index.dest_mint,
            index.timestamp,
            ref_time,
        )?;
        index.location = self.backend.append_block(block)?;
        let hash = index.hash;
        graph.insert(index.clone())?;
        if let Err(err) = self.backend.write_outline(&index) {
            graph.remove(&hash);
            return Err(err.into());
        }
        Ok(index)
    }

    /// Open a ledger view of `origin` positioned at `at`. When `at` is not
    /// the fork tip the view is rebased there by retracting and replaying
    /// blocks along the branch.
    pub fn get_view(&self, origin: &Hash256, at: Hash256, committable: bool) -> Result<UnspentView> {
        let fork = self
            .forks
            .read()
            .get(origin)
            .ok_or(Error::UnknownFork(*origin))?;
        let (guard, last) = if committable {
            let g = fork.upgradable_read_arc();
            let last = g.last;
            (ForkGuard::Upgradable(g), last)
        } else {
            let g = fork.read_arc();
            let last = g.last;
            (ForkGuard::Read(g), last)
        };
        let mut view = UnspentView::new(*origin, last, guard, self.backend.clone(), false);
        if at != last {
            self.rebase_view(&mut view, last, at)?;
        }
        Ok(view)
    }

    /// Blank view for an isolated fork origin.
    pub fn blank_view(&self, origin: Hash256) -> UnspentView {
        UnspentView::new(origin, origin, ForkGuard::None, self.backend.clone(), true)
    }

    /// Blocks retracted from and applied onto the chain when moving the
    /// cursor from `tip` to `target`, without touching any state.
    pub fn branch_blocks(&self, tip: Hash256, target: Hash256) -> Result<(Vec<Block>, Vec<Block>)> {
        let (retract, apply) = {
            let graph = self.graph.read();
            let (ancestor, apply) = graph.branch_point(tip, target)?;
            (graph.descent_path(tip, ancestor)?, apply)
        };
        let mut removed = Vec::with_capacity(retract.len());
        for hash in retract {
            removed.push(self.retrieve_block(&hash)?);
        }
        let mut added = Vec::with_capacity(apply.len());
        for hash in apply {
            added.push(self.retrieve_block(&hash)?);
        }
        Ok((added, removed))
    }

    fn rebase_view(&self, view: &mut UnspentView, last: Hash256, at: Hash256) -> Result<()> {
        let (retract, apply) = {
            let graph = self.graph.read();
            let (ancestor, apply) = graph.branch_point(last, at)?;
            (graph.descent_path(last, ancestor)?, apply)
        };
        for hash in retract {
            let block = self.retrieve_block(&hash)?;
            view.retract_block(&block)?;
        }
        for hash in apply {
            let height = self
                .get_index(&hash)
                .map(|n| n.height)
                .ok_or(Error::MissingPrev(hash))?;
            let block = self.retrieve_block(&hash)?;
            view.apply_block(&block, height)?;
        }
        Ok(())
    }

    /// Move the fork cursor to `tip` and flush the view's ledger delta in
    /// one backend batch. The view's upgradable pin is upgraded here, so
    /// readers admitted during validation drain before the cursor moves.
    pub fn commit_view(
        &self,
        mut view: UnspentView,
        tip: &BlockIndex,
        oracle: &dyn TemplateOracle,
    ) -> Result<ChangeSet> {
        let guard = view.take_commit_guard()?;
        let mut write = ArcRwLockUpgradableReadGuard::upgrade(guard);

        let (unspent_added, unspent_removed) = view.changes();
        let (tx_added, tx_removed) = view.tx_changes();
        let update = ForkTableUpdate {
            new_last: tip.hash,
            unspent_added,
            unspent_removed,
            tx_added: tx_added.to_vec(),
            tx_removed: tx_removed.to_vec(),
        };
        self.backend.update_fork(&view.fork(), update)?;

        for block in view.blocks_removed() {
            self.backend.remove_delegate_context(&block.hash())?;
        }
        for block in view.blocks_added() {
            let hash = block.hash();
            let (prev, height) = {
                let graph = self.graph.read();
                let node = graph.get(&hash).ok_or(Error::MissingPrev(hash))?;
                (node.prev, node.height)
            };
            let base = match prev {
                Some(prev) if !block.is_origin() => self
                    .backend
                    .retrieve_delegate_context(&prev)?
                    .unwrap_or_default(),
                _ => DelegateContext::default(),
            };
            let ctx = delegate_context(block, Some(&view), base, height, oracle)?;
            self.backend.add_delegate_context(&hash, ctx)?;
        }

        write.last = tip.hash;
        drop(write);
        self.graph.write().set_canonical_chain(tip.hash);

        tracing::debug!(
            "fork {} advanced to {} at height {}",
            view.fork(),
            tip.hash,
            tip.height
        );
        Ok(ChangeSet {
            fork: view.fork(),
            last_block: tip.hash,
            last_height: tip.height,
            last_time: tip.timestamp,
            money_supply: tip.money_supply,
            money_destroy: tip.money_destroy,
            committed: true,
            tx_updated: view.tx_updated().clone(),
            blocks_added: view.blocks_added().iter().cloned().collect(),
            blocks_removed: view.blocks_removed().iter().cloned().collect(),
        })
    }

    /// Register a freshly accepted fork origin with its own ledger tables.
    pub fn commit_new_fork(
        &self,
        block: &Block,
        index: &BlockIndex,
        profile: ForkProfile,
        oracle: &dyn TemplateOracle,
    ) -> Result<ChangeSet> {
        if self.forks.read().contains(&index.hash) {
            return Err(Error::DuplicateBlock(index.hash));
        }
        self.backend.add_fork_context(&index.hash, &profile)?;
        self.backend
            .update_fork(&index.hash, seed_update(block, index))?;
        let ctx = delegate_context(block, None, DelegateContext::default(), index.height, oracle)?;
        self.backend.add_delegate_context(&index.hash, ctx)?;
        self.forks
            .write()
            .insert(Fork::new(index.hash, index.hash, profile));
        tracing::info!("registered fork {} at height {}", index.hash, index.height);
        Ok(ChangeSet {
            fork: index.hash,
            last_block: index.hash,
            last_height: index.height,
            last_time: index.timestamp,
            money_supply: index.money_supply,
            money_destroy: index.money_destroy,
            committed: true,
            tx_updated: std::iter::once(block.tx_mint.txid()).collect(),
            blocks_added: vec![block.clone()],
            blocks_removed: vec![],
        })
    }

    /// Vote weight held by `dest` in the snapshot at `block`.
    pub fn delegate_votes(&self, block: &Hash256, dest: &Destination) -> Result<Amount> {
        Ok(self
            .backend
            .retrieve_delegate_context(block)?
            .and_then(|ctx| ctx.votes.get(dest).copied())
            .unwrap_or(0))
    }

    /// Delegates eligible at the snapshot block `at`: vote weight of at
    /// least `min` and an enrollment inside `range` anchored at
    /// `anchor_height`.
    pub fn retrieve_avail_delegate(
        &self,
        at: &Hash256,
        anchor_height: u32,
        range: &[Hash256],
        min: Amount,
    ) -> Result<Vec<(Destination, Amount, EnrollPos, Vec<u8>)>> {
        let votes = self
            .backend
            .retrieve_delegate_context(at)?
            .map(|ctx| ctx.votes)
            .unwrap_or_default();
        let mut enrolls: BTreeMap<Destination, (EnrollPos, Vec<u8>)> = BTreeMap::new();
        for hash in range {
            let ctx = match self.backend.retrieve_delegate_context(hash)? {
                Some(ctx) => ctx,
                None => continue,
            };
            for record in ctx.enrolls {
                if record.anchor_height != anchor_height {
                    continue;
                }
                // a re-enrollment supersedes earlier certs for the window
                let slot = enrolls
                    .entry(record.dest)
                    .or_insert((record.pos, record.data.clone()));
                if record.pos > slot.0 {
                    *slot = (record.pos, record.data);
                }
            }
        }
        let mut avail = Vec::new();
        for (dest, (pos, data)) in enrolls {
            if let Some(amount) = votes.get(&dest) {
                if *amount >= min {
                    avail.push((dest, *amount, pos, data));
                }
            }
        }
        Ok(avail)
    }

    /// Count enrollment certificates anchored within the trailing window,
    /// feeding the per-block certificate budget.
    pub fn count_recent_enrolls(
        &self,
        last: &Hash256,
        window: u32,
        min_anchor: u32,
    ) -> Result<u32> {
        let mut count = 0u32;
        let mut cursor = *last;
        for _ in 0..window {
            let node = match self.get_index(&cursor) {
                Some(node) => node,
                None => break,
            };
            if let Some(ctx) = self.backend.retrieve_delegate_context(&cursor)? {
                count += ctx
                    .enrolls
                    .iter()
                    .filter(|r| r.anchor_height >= min_anchor)
                    .count() as u32;
            }
            match node.prev {
                Some(prev) => cursor = prev,
                None => break,
            }
        }
        Ok(count)
    }

    /// Hashes of `count` blocks ending at `from` inclusive, newest first.
    pub fn range_back(&self, from: Hash256, count: u32) -> Result<Vec<Hash256>> {
        let graph = self.graph.read();
        let mut out = Vec::with_capacity(count as usize);
        let mut cursor = from;
        for _ in 0..count {
            let node = graph.get(&cursor).ok_or(Error::MissingPrev(cursor))?;
            out.push(cursor);
            match node.prev {
                Some(prev) => cursor = prev,
                None => break,
            }
        }
        Ok(out)
    }

    /// Step `steps` blocks back from `from`, or None when the chain is too
    /// short.
    pub fn walk_back(&self, from: Hash256, steps: u32) -> Option<Hash256> {
        let graph = self.graph.read();
        let mut cursor = from;
        for _ in 0..steps {
            cursor = graph.get(&cursor)?.prev?;
        }
        Some(cursor)
    }

    /// Whether `block` sits on the chain ending at `tip`.
    pub fn is_valid_block(&self, tip: &Hash256, block: &Hash256) -> bool {
        self.graph.read().is_on_chain(tip, block)
    }

    pub fn verify_same_chain(&self, older: &Hash256, newer: &Hash256) -> bool {
        self.graph.read().same_chain(older, newer)
    }

    /// Whether `reference` is a primary block on the current primary chain.
    pub fn verify_ref_block(&self, primary_origin: &Hash256, reference: &Hash256) -> bool {
        let last = match self.get_fork(primary_origin) {
            Some(fork) => fork.last(),
            None => return false,
        };
        let graph = self.graph.read();
        match graph.get(reference) {
            Some(node) if node.is_primary() => graph.is_on_chain(&last, reference),
            _ => false,
        }
    }

    /// Timestamp of the primary-chain block at `height`.
    pub fn primary_time_at_height(&self, primary_origin: &Hash256, height: u32) -> Option<u32> {
        let last = self.get_fork(primary_origin)?.last();
        let graph = self.graph.read();
        graph.block_at_height(&last, height).map(|n| n.timestamp)
    }

    /// After a primary reorg, find the best still-valid tip of a sub fork
    /// whose recent blocks reference retired primary blocks. Returns the
    /// replacement tip and the invalidated block set, or None when the
    /// current tip is still valid.
    pub fn get_fork_valid_last(
        &self,
        origin: &Hash256,
        primary_origin: &Hash256,
    ) -> Result<Option<(BlockIndex, Vec<Hash256>)>> {
        let fork = self
            .forks
            .read()
            .get(origin)
            .ok_or(Error::UnknownFork(*origin))?;
        let last = fork.last();

        let mut invalid = HashSet::new();
        let mut base = {
            let mut cursor = self
                .get_index(&last)
                .ok_or(Error::MissingPrev(last))?;
            loop {
                let ref_ok = cursor.ref_block.is_zero()
                    || self.verify_ref_block(primary_origin, &cursor.ref_block);
                if cursor.is_origin() || ref_ok {
                    break cursor;
                }
                invalid.insert(cursor.hash);
                let prev = cursor.prev.ok_or(Error::MissingPrev(cursor.hash))?;
                cursor = self.get_index(&prev).ok_or(Error::MissingPrev(prev))?;
            }
        };
        if invalid.is_empty() {
            return Ok(None);
        }

        // scan every candidate above the valid base for the highest-trust
        // tip whose ancestry avoids the invalid set
        let heights = self.graph.read().heights_above(origin, base.height);
        for height in heights {
            for hash in self.graph.read().height_nodes(origin, height) {
                if invalid.contains(&hash) {
                    continue;
                }
                let node = match self.get_index(&hash) {
                    Some(node) => node,
                    None => continue,
                };
                if !node.ref_block.is_zero()
                    && !self.verify_ref_block(primary_origin, &node.ref_block)
                {
                    invalid.insert(hash);
                    continue;
                }
                let mut ancestry_ok = true;
                let mut cursor = node.prev;
                while let Some(prev) = cursor {
                    if invalid.contains(&prev) {
                        ancestry_ok = false;
                        break;
                    }
                    let prev_node = match self.get_index(&prev) {
                        Some(n) => n,
                        None => {
                            ancestry_ok = false;
                            break;
                        }
                    };
                    if prev_node.height <= base.height {
                        break;
                    }
                    cursor = prev_node.prev;
                }
                if ancestry_ok && node.trust > base.trust {
                    base = node;
                }
            }
        }
        Ok(Some((base, invalid.into_iter().collect())))
    }
}

fn seed_update(block: &Block, index: &BlockIndex) -> ForkTableUpdate {
    let mint = &block.tx_mint;
    let txid = mint.txid();
    let mut update = ForkTableUpdate {
        new_last: index.hash,
        ..Default::default()
    };
    let out = TxOut::new(mint.send_to, mint.amount, mint.tx_time, mint.lock_until);
    if !out.is_null() {
        update.unspent_added.push((
            OutPoint::new(txid, 0),
            UnspentOut {
                output: out,
                tx_type: mint.tx_type,
                height: index.height,
            },
        ));
    }
    update.tx_added.push((
        txid,
        TxIndexEntry {
            tx_type: mint.tx_type,
            height: index.height,
        },
        TxContext::default(),
    ));
    update
}

/// Roll the delegate snapshot of `base` forward across one block.
fn delegate_context(
    block: &Block,
    view: Option<&UnspentView>,
    base: DelegateContext,
    height: u32,
    oracle: &dyn TemplateOracle,
) -> Result<DelegateContext> {
    let mut ctx = DelegateContext {
        votes: base.votes,
        enrolls: Vec::new(),
    };
    let mint = &block.tx_mint;
    if oracle.classify(&mint.send_to) == TemplateRole::Delegate {
        *ctx.votes.entry(mint.send_to).or_insert(0) += mint.amount;
    }
    for (seq, tx) in block.txs.iter().enumerate() {
        let txid = tx.txid();
        let tx_ctx = match view {
            Some(view) => view
                .get_tx_context(&txid)?
                .ok_or_else(|| StorageError::MissingEntry(format!("tx context {}", txid)))?,
            None => TxContext::default(),
        };
        if oracle.classify(&tx.send_to) == TemplateRole::Delegate {
            *ctx.votes.entry(tx.send_to).or_insert(0) += tx.amount;
        }
        if !tx_ctx.dest_in.is_null()
            && oracle.classify(&tx_ctx.dest_in) == TemplateRole::Delegate
        {
            let entry = ctx.votes.entry(tx_ctx.dest_in).or_insert(0);
            *entry -= tx.amount + tx.fee;
            if *entry <= 0 {
                ctx.votes.remove(&tx_ctx.dest_in);
            }
        }
        if let Some((anchor_height, data)) = tx.cert_anchor() {
            ctx.enrolls.push(EnrollRecord {
                dest: tx_ctx.dest_in,
                anchor_height,
                pos: EnrollPos {
                    height,
                    seq: seq as u32 + 1,
                },
                data: data.to_vec(),
            });
        }
    }
    Ok(ctx)
}
