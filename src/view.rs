//! Copy-on-write ledger view stacked on the persistent unspent table.
//!
//! A view pins its fork with an owned lock guard for its whole lifetime.
//! Read-only views take a shared guard; committable views take an
//! upgradable guard so concurrent readers stay admitted until the commit
//! point upgrades to exclusive. All transaction application and removal
//! happens in the overlay; nothing touches the backend tables until the
//! store commits the accumulated changes in one atomic update.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use crate::amount::Amount;
use crate::block::Block;
use crate::destination::Destination;
use crate::error::{Error, Result, StorageError};
use crate::fork::{ForkReadGuard, ForkUpgradableGuard};
use crate::hash::Hash256;
use crate::store::{Backend, TxIndexEntry, UnspentOut};
use crate::transaction::{OutPoint, Transaction, TxContext, TxType};

/// Owned pin on the fork whose ledger the view overlays.
pub enum ForkGuard {
    /// Blank or detached view, nothing pinned.
    None,
    Read(ForkReadGuard),
    Upgradable(ForkUpgradableGuard),
}

struct ViewEntry {
    unspent: UnspentOut,
    spent: bool,
    /// Net enable count: positive entries are additions, negative entries
    /// removals, zero means the overlay cancelled itself out.
    opt: i32,
}

pub struct UnspentView {
    fork: Hash256,
    /// Fork tip at the time the pin was taken; stable for the lifetime of
    /// a committable view.
    tip: Hash256,
    guard: ForkGuard,
    backend: Arc<dyn Backend>,
    /// Blank views never consult the backend; used by isolated fork
    /// origins that start from an empty ledger.
    blank: bool,
    entries: HashMap<OutPoint, ViewEntry>,
    contexts: HashMap<Hash256, TxContext>,
    tx_added: Vec<(Hash256, TxIndexEntry, TxContext)>,
    tx_removed: Vec<Hash256>,
    tx_updated: BTreeSet<Hash256>,
    blocks_added: VecDeque<Block>,
    blocks_removed: VecDeque<Block>,
}

impl UnspentView {
    pub fn new(
        fork: Hash256,
        tip: Hash256,
        guard: ForkGuard,
        backend: Arc<dyn Backend>,
        blank: bool,
    ) -> Self {
        UnspentView {
            fork,
            tip,
            guard,
            backend,
            blank,
            entries: HashMap::new(),
            contexts: HashMap::new(),
            tx_added: Vec::new(),
            tx_removed: Vec::new(),
            tx_updated: BTreeSet::new(),
            blocks_added: VecDeque::new(),
            blocks_removed: VecDeque::new(),
        }
    }

    pub fn fork(&self) -> Hash256 {
        self.fork
    }

    pub fn tip(&self) -> Hash256 {
        self.tip
    }

    pub fn is_committable(&self) -> bool {
        matches!(self.guard, ForkGuard::Upgradable(_))
    }

    /// Release the pin, surrendering the upgradable guard for the commit.
    pub(crate) fn take_commit_guard(&mut self) -> Result<ForkUpgradableGuard> {
        match std::mem::replace(&mut self.guard, ForkGuard::None) {
            ForkGuard::Upgradable(guard) => Ok(guard),
            other => {
                self.guard = other;
                Err(StorageError::NotCommittable.into())
            }
        }
    }

    pub fn retrieve_unspent(&self, outpoint: &OutPoint) -> Result<Option<UnspentOut>> {
        if let Some(entry) = self.entries.get(outpoint) {
            if entry.spent {
                return Ok(None);
            }
            return Ok(Some(entry.unspent.clone()));
        }
        if self.blank {
            return Ok(None);
        }
        Ok(self.backend.retrieve_unspent(&self.fork, outpoint)?)
    }

    pub fn get_tx_context(&self, txid: &Hash256) -> Result<Option<TxContext>> {
        if let Some(ctx) = self.contexts.get(txid) {
            return Ok(Some(ctx.clone()));
        }
        if self.blank {
            return Ok(None);
        }
        Ok(self.backend.retrieve_tx_context(&self.fork, txid)?)
    }

    fn enable(&mut self, outpoint: OutPoint, unspent: UnspentOut) {
        let entry = self.entries.entry(outpoint).or_insert(ViewEntry {
            unspent: unspent.clone(),
            spent: true,
            opt: 0,
        });
        entry.unspent = unspent;
        entry.spent = false;
        entry.opt += 1;
    }

    fn disable(&mut self, outpoint: OutPoint, unspent: UnspentOut) {
        let entry = self.entries.entry(outpoint).or_insert(ViewEntry {
            unspent: unspent.clone(),
            spent: false,
            opt: 0,
        });
        entry.unspent = unspent;
        entry.spent = true;
        entry.opt -= 1;
    }

    /// Apply one transaction on top of the overlay, resolving and spending
    /// its inputs and creating its payment and change outputs. Returns the
    /// resolved spending destination.
    pub fn apply_tx(&mut self, tx: &Transaction, height: u32) -> Result<Destination> {
        let txid = tx.txid();
        if tx.inputs.is_empty() {
            // mint path, output only
            let out = crate::transaction::TxOut::new(
                tx.send_to,
                tx.amount,
                tx.tx_time,
                tx.lock_until,
            );
            if !out.is_null() {
                self.enable(
                    OutPoint::new(txid, 0),
                    UnspentOut {
                        output: out,
                        tx_type: tx.tx_type,
                        height,
                    },
                );
            }
            self.record_added(txid, tx, height, TxContext::default());
            return Ok(Destination::null());
        }

        let mut resolved = Vec::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            let spent_in_overlay = self
                .entries
                .get(&input.prevout)
                .map(|e| e.spent)
                .unwrap_or(false);
            if spent_in_overlay {
                return Err(Error::DoubleSpend {
                    outpoint: input.prevout,
                });
            }
            let unspent = self
                .retrieve_unspent(&input.prevout)?
                .ok_or(Error::MissingInput {
                    outpoint: input.prevout,
                })?;
            if unspent.output.is_locked(height) {
                return Err(Error::TransactionInvalid(txid));
            }
            resolved.push((input.prevout, unspent));
        }

        let dest_in = resolved[0].1.output.dest;
        if resolved.iter().any(|(_, u)| u.output.dest != dest_in) {
            return Err(Error::TransactionInvalid(txid));
        }

        let value_in: Amount = resolved.iter().map(|(_, u)| u.output.amount).sum();
        let change = value_in - tx.amount - tx.fee;
        if change < 0 {
            return Err(Error::Overspend {
                txid,
                value_in,
                value_out: tx.amount + tx.fee,
            });
        }

        let mut ctx = TxContext {
            dest_in,
            inputs: Vec::with_capacity(resolved.len()),
        };
        for (outpoint, unspent) in resolved {
            ctx.inputs.push(unspent.output.clone());
            self.disable(outpoint, unspent);
        }

        self.enable(
            OutPoint::new(txid, 0),
            UnspentOut {
                output: crate::transaction::TxOut::new(
                    tx.send_to,
                    tx.amount,
                    tx.tx_time,
                    tx.lock_until,
                ),
                tx_type: tx.tx_type,
                height,
            },
        );
        if change > 0 && !dest_in.is_null() {
            self.enable(
                OutPoint::new(txid, 1),
                UnspentOut {
                    output: crate::transaction::TxOut::new(
                        dest_in,
                        change,
                        tx.tx_time,
                        tx.lock_until,
                    ),
                    tx_type: tx.tx_type,
                    height,
                },
            );
        }
        self.record_added(txid, tx, height, ctx.clone());
        Ok(dest_in)
    }

    fn record_added(&mut self, txid: Hash256, tx: &Transaction, height: u32, ctx: TxContext) {
        self.contexts.insert(txid, ctx.clone());
        self.tx_added.push((
            txid,
            TxIndexEntry {
                tx_type: tx.tx_type,
                height,
            },
            ctx,
        ));
        self.tx_updated.insert(txid);
    }

    /// Undo one transaction, restoring its spent inputs and retiring its
    /// outputs. The spending context is taken from the overlay for freshly
    /// applied transactions and from the backend during a reorg retract.
    pub fn remove_tx(&mut self, tx: &Transaction) -> Result<()> {
        let txid = tx.txid();
        let ctx = if tx.inputs.is_empty() {
            TxContext::default()
        } else {
            self.get_tx_context(&txid)?
                .ok_or_else(|| StorageError::MissingEntry(format!("tx context {}", txid)))?
        };

        let out = crate::transaction::TxOut::new(tx.send_to, tx.amount, tx.tx_time, tx.lock_until);
        if !out.is_null() {
            self.disable(
                OutPoint::new(txid, 0),
                UnspentOut {
                    output: out,
                    tx_type: tx.tx_type,
                    height: 0,
                },
            );
        }
        let change = ctx.value_in() - tx.amount - tx.fee;
        if change > 0 && !ctx.dest_in.is_null() {
            self.disable(
                OutPoint::new(txid, 1),
                UnspentOut {
                    output: crate::transaction::TxOut::new(
                        ctx.dest_in,
                        change,
                        tx.tx_time,
                        tx.lock_until,
                    ),
                    tx_type: tx.tx_type,
                    height: 0,
                },
            );
        }

        for (input, output) in tx.inputs.iter().zip(ctx.inputs.iter()) {
            let (tx_type, height) = if self.blank {
                (TxType::Token, 0)
            } else {
                match self.backend.retrieve_tx_entry(&self.fork, &input.prevout.txid)? {
                    Some(entry) => (entry.tx_type, entry.height),
                    None => (TxType::Token, 0),
                }
            };
            self.enable(
                input.prevout,
                UnspentOut {
                    output: output.clone(),
                    tx_type,
                    height,
                },
            );
        }

        self.contexts.remove(&txid);
        self.tx_removed.push(txid);
        self.tx_updated.insert(txid);
        Ok(())
    }

    /// Apply a whole block, mint first then payload transactions in order.
    pub fn apply_block(&mut self, block: &Block, height: u32) -> Result<()> {
        self.apply_tx(&block.tx_mint, height)?;
        for tx in &block.txs {
            self.apply_tx(tx, height)?;
        }
        self.blocks_added.push_back(block.clone());
        Ok(())
    }

    /// Undo a whole block, payload transactions in reverse then the mint.
    pub fn retract_block(&mut self, block: &Block) -> Result<()> {
        for tx in block.txs.iter().rev() {
            self.remove_tx(tx)?;
        }
        self.remove_tx(&block.tx_mint)?;
        self.blocks_removed.push_back(block.clone());
        Ok(())
    }

    /// Net unspent delta of the overlay.
    pub fn changes(&self) -> (Vec<(OutPoint, UnspentOut)>, Vec<OutPoint>) {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        for (outpoint, entry) in &self.entries {
            if entry.opt > 0 {
                added.push((*outpoint, entry.unspent.clone()));
            } else if entry.opt < 0 {
                removed.push(*outpoint);
            }
        }
        (added, removed)
    }

    pub fn tx_changes(&self) -> (&[(Hash256, TxIndexEntry, TxContext)], &[Hash256]) {
        (&self.tx_added, &self.tx_removed)
    }

    pub fn tx_updated(&self) -> &BTreeSet<Hash256> {
        &self.tx_updated
    }

    pub fn blocks_added(&self) -> &VecDeque<Block> {
        &self.blocks_added
    }

    pub fn blocks_removed(&self) -> &VecDeque<Block> {
        &self.blocks_removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;
    use crate::testing::{token_tx, work_mint};
    use crate::transaction::TxIn;

    fn blank_view() -> UnspentView {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let fork = Hash256::digest(b"fork");
        UnspentView::new(fork, fork, ForkGuard::None, backend, true)
    }

    #[test]
    fn mint_then_spend_produces_change() {
        let mut view = blank_view();
        let dest = Destination::from_bytes([1u8; 32]);
        let mint = work_mint(dest, 1_000, 10);
        let mint_id = mint.txid();
        view.apply_tx(&mint, 1).unwrap();
        assert!(view
            .retrieve_unspent(&OutPoint::new(mint_id, 0))
            .unwrap()
            .is_some());

        let payee = Destination::from_bytes([2u8; 32]);
        let tx = token_tx(vec![OutPoint::new(mint_id, 0)], payee, 600, 10, 20);
        let txid = tx.txid();
        let dest_in = view.apply_tx(&tx, 2).unwrap();
        assert_eq!(dest_in, dest);

        // mint output spent, payment and change live
        assert!(view
            .retrieve_unspent(&OutPoint::new(mint_id, 0))
            .unwrap()
            .is_none());
        let payment = view.retrieve_unspent(&OutPoint::new(txid, 0)).unwrap().unwrap();
        assert_eq!(payment.output.amount, 600);
        let change = view.retrieve_unspent(&OutPoint::new(txid, 1)).unwrap().unwrap();
        assert_eq!(change.output.amount, 390);
        assert_eq!(change.output.dest, dest);
    }

    #[test]
    fn double_spend_and_overspend_are_rejected() {
        let mut view = blank_view();
        let dest = Destination::from_bytes([1u8; 32]);
        let mint = work_mint(dest, 500, 10);
        let mint_id = mint.txid();
        view.apply_tx(&mint, 1).unwrap();

        let payee = Destination::from_bytes([2u8; 32]);
        let over = token_tx(vec![OutPoint::new(mint_id, 0)], payee, 495, 10, 20);
        assert!(matches!(
            view.apply_tx(&over, 2),
            Err(Error::Overspend { .. })
        ));

        let ok = token_tx(vec![OutPoint::new(mint_id, 0)], payee, 400, 10, 20);
        view.apply_tx(&ok, 2).unwrap();
        let again = token_tx(vec![OutPoint::new(mint_id, 0)], payee, 50, 10, 21);
        assert!(matches!(
            view.apply_tx(&again, 2),
            Err(Error::DoubleSpend { .. })
        ));

        let missing = token_tx(
            vec![OutPoint::new(Hash256::digest(b"nowhere"), 0)],
            payee,
            1,
            10,
            22,
        );
        assert!(matches!(
            view.apply_tx(&missing, 2),
            Err(Error::MissingInput { .. })
        ));
    }

    #[test]
    fn remove_tx_cancels_the_overlay() {
        let mut view = blank_view();
        let dest = Destination::from_bytes([1u8; 32]);
        let mint = work_mint(dest, 1_000, 10);
        let mint_id = mint.txid();
        view.apply_tx(&mint, 1).unwrap();

        let payee = Destination::from_bytes([2u8; 32]);
        let tx = token_tx(vec![OutPoint::new(mint_id, 0)], payee, 600, 10, 20);
        view.apply_tx(&tx, 2).unwrap();
        view.remove_tx(&tx).unwrap();

        // mint output restored, spend outputs cancelled
        assert!(view
            .retrieve_unspent(&OutPoint::new(mint_id, 0))
            .unwrap()
            .is_some());
        let (added, removed) = view.changes();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].0, OutPoint::new(mint_id, 0));
        assert!(removed.is_empty());
    }

    #[test]
    fn locked_output_cannot_be_spent_early() {
        let mut view = blank_view();
        let dest = Destination::from_bytes([1u8; 32]);
        let mut mint = work_mint(dest, 1_000, 10);
        mint.lock_until = 5;
        let mint_id = mint.txid();
        view.apply_tx(&mint, 1).unwrap();

        let payee = Destination::from_bytes([2u8; 32]);
        let tx = Transaction {
            inputs: vec![TxIn {
                prevout: OutPoint::new(mint_id, 0),
            }],
            ..token_tx(vec![], payee, 100, 10, 20)
        };
        assert!(matches!(
            view.apply_tx(&tx, 4),
            Err(Error::TransactionInvalid(_))
        ));
        view.apply_tx(&tx, 6).unwrap();
    }
}
