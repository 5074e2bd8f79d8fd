//! In-memory backend, the reference implementation of the table contract.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::block::Block;
use crate::error::StorageError;
use crate::fork::ForkProfile;
use crate::hash::Hash256;
use crate::index::{BlockIndex, BlockLocation};
use crate::transaction::{OutPoint, TxContext};

use super::{Backend, DelegateContext, ForkTableUpdate, TxIndexEntry, UnspentOut};

#[derive(Default)]
struct ForkTable {
    last: Hash256,
    unspent: HashMap<OutPoint, UnspentOut>,
    txs: HashMap<Hash256, (TxIndexEntry, TxContext)>,
}

#[derive(Default)]
pub struct MemoryBackend {
    blocks: Mutex<Vec<Block>>,
    outlines: Mutex<Vec<BlockIndex>>,
    contexts: Mutex<Vec<(Hash256, ForkProfile)>>,
    forks: Mutex<HashMap<Hash256, ForkTable>>,
    delegates: Mutex<HashMap<Hash256, DelegateContext>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn append_block(&self, block: &Block) -> Result<BlockLocation, StorageError> {
        let mut blocks = self.blocks.lock();
        let location = BlockLocation {
            file: 0,
            offset: blocks.len() as u64,
        };
        blocks.push(block.clone());
        Ok(location)
    }

    fn read_block(&self, location: BlockLocation) -> Result<Block, StorageError> {
        self.blocks
            .lock()
            .get(location.offset as usize)
            .cloned()
            .ok_or(StorageError::BadLocation {
                file: location.file,
                offset: location.offset,
            })
    }

    fn write_outline(&self, index: &BlockIndex) -> Result<(), StorageError> {
        let mut outlines = self.outlines.lock();
        if let Some(existing) = outlines.iter_mut().find(|o| o.hash == index.hash) {
            *existing = index.clone();
        } else {
            outlines.push(index.clone());
        }
        Ok(())
    }

    fn remove_outline(&self, hash: &Hash256) -> Result<(), StorageError> {
        self.outlines.lock().retain(|o| o.hash != *hash);
        Ok(())
    }

    fn list_outlines(&self) -> Result<Vec<BlockIndex>, StorageError> {
        Ok(self.outlines.lock().clone())
    }

    fn add_fork_context(
        &self,
        origin: &Hash256,
        profile: &ForkProfile,
    ) -> Result<(), StorageError> {
        self.contexts.lock().push((*origin, profile.clone()));
        Ok(())
    }

    fn list_fork_contexts(&self) -> Result<Vec<(Hash256, ForkProfile)>, StorageError> {
        Ok(self.contexts.lock().clone())
    }

    fn update_fork(&self, origin: &Hash256, update: ForkTableUpdate) -> Result<(), StorageError> {
        let mut forks = self.forks.lock();
        let table = forks.entry(*origin).or_default();
        table.last = update.new_last;
        for outpoint in &update.unspent_removed {
            table.unspent.remove(outpoint);
        }
        for (outpoint, unspent) in update.unspent_added {
            table.unspent.insert(outpoint, unspent);
        }
        for txid in &update.tx_removed {
            table.txs.remove(txid);
        }
        for (txid, entry, ctx) in update.tx_added {
            table.txs.insert(txid, (entry, ctx));
        }
        Ok(())
    }

    fn retrieve_fork_last(&self, origin: &Hash256) -> Result<Option<Hash256>, StorageError> {
        Ok(self.forks.lock().get(origin).map(|t| t.last))
    }

    fn retrieve_unspent(
        &self,
        origin: &Hash256,
        outpoint: &OutPoint,
    ) -> Result<Option<UnspentOut>, StorageError> {
        Ok(self
            .forks
            .lock()
            .get(origin)
            .and_then(|t| t.unspent.get(outpoint).cloned()))
    }

    fn retrieve_tx_context(
        &self,
        origin: &Hash256,
        txid: &Hash256,
    ) -> Result<Option<TxContext>, StorageError> {
        Ok(self
            .forks
            .lock()
            .get(origin)
            .and_then(|t| t.txs.get(txid).map(|(_, ctx)| ctx.clone())))
    }

    fn retrieve_tx_entry(
        &self,
        origin: &Hash256,
        txid: &Hash256,
    ) -> Result<Option<TxIndexEntry>, StorageError> {
        Ok(self
            .forks
            .lock()
            .get(origin)
            .and_then(|t| t.txs.get(txid).map(|(entry, _)| *entry)))
    }

    fn add_delegate_context(
        &self,
        block: &Hash256,
        ctx: DelegateContext,
    ) -> Result<(), StorageError> {
        self.delegates.lock().insert(*block, ctx);
        Ok(())
    }

    fn retrieve_delegate_context(
        &self,
        block: &Hash256,
    ) -> Result<Option<DelegateContext>, StorageError> {
        Ok(self.delegates.lock().get(block).cloned())
    }

    fn remove_delegate_context(&self, block: &Hash256) -> Result<(), StorageError> {
        self.delegates.lock().remove(block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::Destination;
    use crate::transaction::{TxOut, TxType};

    #[test]
    fn fork_update_is_applied_in_batch() {
        let backend = MemoryBackend::new();
        let origin = Hash256::digest(b"origin");
        let tip = Hash256::digest(b"tip");
        let out = OutPoint::new(Hash256::digest(b"tx"), 0);
        backend
            .update_fork(
                &origin,
                ForkTableUpdate {
                    new_last: tip,
                    unspent_added: vec![(
                        out,
                        UnspentOut {
                            output: TxOut::new(Destination::from_bytes([1; 32]), 10, 0, 0),
                            tx_type: TxType::Token,
                            height: 1,
                        },
                    )],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(backend.retrieve_fork_last(&origin).unwrap(), Some(tip));
        assert!(backend.retrieve_unspent(&origin, &out).unwrap().is_some());

        backend
            .update_fork(
                &origin,
                ForkTableUpdate {
                    new_last: origin,
                    unspent_removed: vec![out],
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(backend.retrieve_unspent(&origin, &out).unwrap().is_none());
    }

    #[test]
    fn outlines_keep_append_order() {
        let backend = MemoryBackend::new();
        let a = crate::testing::index_node(
            Hash256::digest(b"a"),
            None,
            Hash256::digest(b"a"),
            0,
            100,
        );
        let mut b = crate::testing::index_node(
            Hash256::digest(b"b"),
            Some(a.hash),
            a.hash,
            1,
            110,
        );
        backend.write_outline(&a).unwrap();
        backend.write_outline(&b).unwrap();
        b.timestamp = 111;
        backend.write_outline(&b).unwrap();
        let outlines = backend.list_outlines().unwrap();
        assert_eq!(outlines.len(), 2);
        assert_eq!(outlines[1].timestamp, 111);
        backend.remove_outline(&a.hash).unwrap();
        assert_eq!(backend.list_outlines().unwrap().len(), 1);
    }
}
