//! In-memory DAG of block metadata.
//!
//! One node per accepted block header, addressed by hash. `prev` links walk
//! toward the fork origin, `next` is the single canonical forward link
//! (rewritten on reorg), `origin` names the fork. A secondary index per
//! `(fork, height)` serves repeat-block detection and primary height time
//! queries; several nodes can legitimately share a height because of
//! extended and vacant blocks.

use std::collections::{BTreeMap, HashMap};

use primitive_types::U256;

use crate::amount::Amount;
use crate::block::{BlockType, MintType};
use crate::config::EXTENDED_BLOCK_SPACING;
use crate::destination::Destination;
use crate::error::{Error, Result};
use crate::hash::Hash256;

/// Position of a block body inside the append-only log.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct BlockLocation {
    pub file: u32,
    pub offset: u64,
}

#[derive(Clone, Debug)]
pub struct BlockIndex {
    pub hash: Hash256,
    pub prev: Option<Hash256>,
    pub next: Option<Hash256>,
    pub origin: Hash256,
    pub block_type: BlockType,
    pub mint_type: MintType,
    pub dest_mint: Destination,
    pub height: u32,
    pub timestamp: u32,
    pub proof_bits: u32,
    /// Referenced primary block for piggybacked sub blocks, zero otherwise.
    pub ref_block: Hash256,
    /// Accumulated chain trust up to and including this block.
    pub trust: U256,
    pub money_supply: Amount,
    pub money_destroy: Amount,
    pub location: BlockLocation,
}

impl BlockIndex {
    pub fn is_origin(&self) -> bool {
        matches!(self.block_type, BlockType::Genesis | BlockType::Origin)
    }

    pub fn is_primary(&self) -> bool {
        matches!(self.block_type, BlockType::Genesis | BlockType::Primary)
    }

    pub fn is_extended(&self) -> bool {
        self.block_type == BlockType::Extended
    }

    pub fn is_vacant(&self) -> bool {
        self.block_type == BlockType::Vacant
    }

    pub fn is_proof_of_work(&self) -> bool {
        self.mint_type == MintType::Work
    }

    /// Two tips are equivalent when they were minted the same way by the
    /// same producer; used to break exact trust ties.
    pub fn is_equivalent(&self, other: &BlockIndex) -> bool {
        self.mint_type == other.mint_type && self.dest_mint == other.dest_mint
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HeightEntry {
    pub timestamp: u32,
    pub dest_mint: Destination,
    pub ref_block: Hash256,
}

#[derive(Default)]
pub struct BlockIndexGraph {
    nodes: HashMap<Hash256, BlockIndex>,
    heights: HashMap<Hash256, BTreeMap<u32, HashMap<Hash256, HeightEntry>>>,
}

impl BlockIndexGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.nodes.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash256) -> Option<&BlockIndex> {
        self.nodes.get(hash)
    }

    pub fn insert(&mut self, index: BlockIndex) -> Result<()> {
        if self.nodes.contains_key(&index.hash) {
            return Err(Error::DuplicateBlock(index.hash));
        }
        if let Some(prev) = index.prev {
            if !self.nodes.contains_key(&prev) {
                return Err(Error::MissingPrev(prev));
            }
        }
        self.heights
            .entry(index.origin)
            .or_default()
            .entry(index.height)
            .or_default()
            .insert(
                index.hash,
                HeightEntry {
                    timestamp: index.timestamp,
                    dest_mint: index.dest_mint,
                    ref_block: index.ref_block,
                },
            );
        self.nodes.insert(index.hash, index);
        Ok(())
    }

    /// Drop a node again after a failed persistence attempt.
    pub fn remove(&mut self, hash: &Hash256) {
        if let Some(index) = self.nodes.remove(hash) {
            if let Some(by_height) = self.heights.get_mut(&index.origin) {
                if let Some(entries) = by_height.get_mut(&index.height) {
                    entries.remove(hash);
                    if entries.is_empty() {
                        by_height.remove(&index.height);
                    }
                }
            }
        }
    }

    pub fn height_entries(&self, fork: &Hash256, height: u32) -> Vec<(Hash256, HeightEntry)> {
        self.heights
            .get(fork)
            .and_then(|m| m.get(&height))
            .map(|entries| entries.iter().map(|(h, e)| (*h, *e)).collect())
        .unwrap_or_default()
    }

    pub fn height_nodes(&self, fork: &Hash256, height: u32) -> Vec<Hash256> {
        self.height_entries(fork, height)
            .into_iter()
            .map(|(h, _)| h)
            .collect()
    }

    /// Heights known for a fork above `from`, ascending.
    pub fn heights_above(&self, fork: &Hash256, from: u32) -> Vec<u32> {
        self.heights
            .get(fork)
            .map(|m| m.range(from + 1..).map(|(h, _)| *h).collect())
            .unwrap_or_default()
    }

    /// Reject a second mint competing inside one timing window at the same
    /// height. Primary and subsidiary blocks collide on producer identity;
    /// extended blocks only collide when they fall into the same
    /// extended-spacing slot relative to their reference round.
    pub fn verify_repeat_block(
        &self,
        fork: &Hash256,
        height: u32,
        block_hash: Hash256,
        block_type: BlockType,
        dest_mint: &Destination,
        timestamp: u32,
        ref_time: Option<u32>,
    ) -> Result<()> {
        for (hash, entry) in self.height_entries(fork, height) {
            if hash == block_hash || entry.dest_mint != *dest_mint {
                continue;
            }
            let collides = match (block_type, ref_time) {
                (BlockType::Extended, Some(ref_time)) => {
                    let existing = self
                        .nodes
                        .get(&hash)
                        .map(|n| n.is_extended())
                        .unwrap_or(false);
                    if existing && entry.timestamp >= ref_time && timestamp >= ref_time {
                        (entry.timestamp - ref_time) / EXTENDED_BLOCK_SPACING
                            == (timestamp - ref_time) / EXTENDED_BLOCK_SPACING
                    } else {
                        !existing
                    }
                }
                _ => true,
            };
            if collides {
                tracing::debug!(
                    "repeat mint by {} at height {} rejected, block {}",
                    dest_mint,
                    height,
                    block_hash
                );
                return Err(Error::ProofOfStakeInvalid(block_hash));
            }
        }
        Ok(())
    }

    /// Find the lowest common ancestor of the fork tip and a target block,
    /// returning it together with the path from the ancestor (exclusive) up
    /// to the target in forward order.
    ///
    /// The walk compares timestamps, not heights: sibling vacant and
    /// extended blocks share heights, and the later-stamped side is always
    /// the one stepped back.
    pub fn branch_point(
        &self,
        tip: Hash256,
        target: Hash256,
    ) -> Result<(Hash256, Vec<Hash256>)> {
        let mut path = Vec::new();
        let mut ref_cursor = tip;
        let mut cursor = target;
        while cursor != ref_cursor {
            let ref_time = self
                .nodes
                .get(&ref_cursor)
                .ok_or(Error::MissingPrev(ref_cursor))?
                .timestamp;
            let node = self.nodes.get(&cursor).ok_or(Error::MissingPrev(cursor))?;
            if ref_time > node.timestamp {
                let prev = self
                    .nodes
                    .get(&ref_cursor)
                    .and_then(|n| n.prev)
                    .ok_or(Error::MissingPrev(ref_cursor))?;
                ref_cursor = prev;
            } else if node.timestamp > ref_time {
                path.push(cursor);
                cursor = node.prev.ok_or(Error::MissingPrev(cursor))?;
            } else {
                path.push(cursor);
                cursor = node.prev.ok_or(Error::MissingPrev(cursor))?;
                let prev = self
                    .nodes
                    .get(&ref_cursor)
                    .and_then(|n| n.prev)
                    .ok_or(Error::MissingPrev(ref_cursor))?;
                ref_cursor = prev;
            }
        }
        path.reverse();
        Ok((cursor, path))
    }

    /// Blocks from the tip (inclusive) down to `ancestor` (exclusive).
    pub fn descent_path(&self, tip: Hash256, ancestor: Hash256) -> Result<Vec<Hash256>> {
        let mut path = Vec::new();
        let mut cursor = tip;
        while cursor != ancestor {
            let node = self.nodes.get(&cursor).ok_or(Error::MissingPrev(cursor))?;
            path.push(cursor);
            cursor = node.prev.ok_or(Error::MissingPrev(cursor))?;
        }
        Ok(path)
    }

    /// Repair the canonical `next` links after the fork cursor moved: stale
    /// forward links beyond the new tip are cleared, then the new tip's
    /// ancestry is rewritten back to the origin or to the first link that
    /// is already canonical. Every forward link displaced along the
    /// ancestry walk roots an abandoned subtree whose own links must be
    /// cleared too.
    pub fn set_canonical_chain(&mut self, new_tip: Hash256) {
        if let Some(forward) = self.nodes.get_mut(&new_tip).and_then(|n| n.next.take()) {
            self.clear_forward_links(forward);
        }

        let mut cursor = new_tip;
        while let Some(prev) = self.nodes.get(&cursor).and_then(|n| n.prev) {
            let displaced = match self.nodes.get(&prev) {
                Some(node) => node.next,
                None => break,
            };
            if displaced == Some(cursor) {
                break;
            }
            let at_origin = match self.nodes.get_mut(&prev) {
                Some(node) => {
                    node.next = Some(cursor);
                    node.is_origin()
                }
                None => break,
            };
            if let Some(stale) = displaced {
                self.clear_forward_links(stale);
            }
            if at_origin {
                break;
            }
            cursor = prev;
        }
    }

    fn clear_forward_links(&mut self, from: Hash256) {
        let mut cursor = Some(from);
        while let Some(hash) = cursor {
            cursor = self.nodes.get_mut(&hash).and_then(|n| n.next.take());
        }
    }

    /// Whether `block` lies on the chain ending at `tip`, located by height.
    pub fn is_on_chain(&self, tip: &Hash256, block: &Hash256) -> bool {
        let target = match self.nodes.get(block) {
            Some(node) => node,
            None => return false,
        };
        let mut cursor = match self.nodes.get(tip) {
            Some(node) => node,
            None => return false,
        };
        if target.height > cursor.height {
            return false;
        }
        while cursor.height > target.height {
            cursor = match cursor.prev.and_then(|p| self.nodes.get(&p)) {
                Some(node) => node,
                None => return false,
            };
        }
        cursor.hash == *block
    }

    /// Whether `newer` extends the chain that contains `older`.
    pub fn same_chain(&self, older: &Hash256, newer: &Hash256) -> bool {
        self.is_on_chain(newer, older)
    }

    /// Node on the chain ending at `tip` at the given height.
    pub fn block_at_height(&self, tip: &Hash256, height: u32) -> Option<&BlockIndex> {
        let mut cursor = self.nodes.get(tip)?;
        if height > cursor.height {
            return None;
        }
        while cursor.height > height {
            cursor = self.nodes.get(&cursor.prev?)?;
        }
        Some(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::index_node;

    fn graph_with_chain(n: u32) -> (BlockIndexGraph, Vec<Hash256>) {
        let mut graph = BlockIndexGraph::new();
        let mut hashes = Vec::new();
        let origin = Hash256::digest(b"origin");
        let mut prev: Option<Hash256> = None;
        for i in 0..n {
            let hash = if i == 0 {
                origin
            } else {
                Hash256::digest(format!("block-{}", i).as_bytes())
            };
            let mut node = index_node(hash, prev, origin, i, 1000 + i * 10);
            if i == 0 {
                node.block_type = BlockType::Genesis;
                node.mint_type = MintType::Genesis;
            }
            graph.insert(node).unwrap();
            if prev.is_some() {
                graph.set_canonical_chain(hash);
            }
            hashes.push(hash);
            prev = Some(hash);
        }
        (graph, hashes)
    }

    #[test]
    fn duplicate_and_missing_parent_are_rejected() {
        let (mut graph, hashes) = graph_with_chain(3);
        let dup = index_node(hashes[1], Some(hashes[0]), hashes[0], 1, 1010);
        assert!(matches!(
            graph.insert(dup),
            Err(Error::DuplicateBlock(_))
        ));
        let orphan = index_node(
            Hash256::digest(b"orphan"),
            Some(Hash256::digest(b"nowhere")),
            hashes[0],
            9,
            2000,
        );
        assert!(matches!(graph.insert(orphan), Err(Error::MissingPrev(_))));
    }

    #[test]
    fn branch_point_uses_timestamps() {
        let (mut graph, hashes) = graph_with_chain(3);
        let origin = hashes[0];
        // side branch at the same height as hashes[1] but a later stamp
        let side1 = index_node(
            Hash256::digest(b"side-1"),
            Some(origin),
            origin,
            1,
            1015,
        );
        let side1_hash = side1.hash;
        graph.insert(side1).unwrap();
        let side2 = index_node(
            Hash256::digest(b"side-2"),
            Some(side1_hash),
            origin,
            2,
            1025,
        );
        let side2_hash = side2.hash;
        graph.insert(side2).unwrap();

        let (ancestor, path) = graph.branch_point(hashes[2], side2_hash).unwrap();
        assert_eq!(ancestor, origin);
        assert_eq!(path, vec![side1_hash, side2_hash]);

        let retract = graph.descent_path(hashes[2], ancestor).unwrap();
        assert_eq!(retract, vec![hashes[2], hashes[1]]);
    }

    #[test]
    fn canonical_chain_repair_rewrites_next_links() {
        let (mut graph, hashes) = graph_with_chain(3);
        graph.set_canonical_chain(hashes[2]);
        assert_eq!(graph.get(&hashes[0]).unwrap().next, Some(hashes[1]));
        assert_eq!(graph.get(&hashes[1]).unwrap().next, Some(hashes[2]));

        let side = index_node(
            Hash256::digest(b"side"),
            Some(hashes[0]),
            hashes[0],
            1,
            1099,
        );
        let side_hash = side.hash;
        graph.insert(side).unwrap();
        graph.set_canonical_chain(side_hash);
        assert_eq!(graph.get(&hashes[0]).unwrap().next, Some(side_hash));
        assert_eq!(graph.get(&hashes[1]).unwrap().next, None);
        assert_eq!(graph.get(&hashes[2]).unwrap().next, None);

        // switching back restores the long chain and clears the side link
        graph.set_canonical_chain(hashes[2]);
        assert_eq!(graph.get(&hashes[0]).unwrap().next, Some(hashes[1]));
        assert_eq!(graph.get(&hashes[1]).unwrap().next, Some(hashes[2]));
        assert_eq!(graph.get(&side_hash).unwrap().next, None);
    }

    #[test]
    fn repeat_mint_at_same_height_is_rejected() {
        let (graph, hashes) = graph_with_chain(3);
        let dest = graph.get(&hashes[1]).unwrap().dest_mint;
        let err = graph.verify_repeat_block(
            &hashes[0],
            1,
            Hash256::digest(b"competing"),
            BlockType::Primary,
            &dest,
            1012,
            None,
        );
        assert!(matches!(err, Err(Error::ProofOfStakeInvalid(_))));

        // a different producer at the same height is fine
        graph
            .verify_repeat_block(
                &hashes[0],
                1,
                Hash256::digest(b"competing"),
                BlockType::Primary,
                &Destination::from_bytes([0xEE; 32]),
                1012,
                None,
            )
            .unwrap();
    }

    #[test]
    fn chain_membership_by_height() {
        let (graph, hashes) = graph_with_chain(4);
        assert!(graph.is_on_chain(&hashes[3], &hashes[1]));
        assert!(graph.same_chain(&hashes[1], &hashes[3]));
        assert!(!graph.is_on_chain(&hashes[1], &hashes[3]));
        assert_eq!(
            graph.block_at_height(&hashes[3], 2).map(|n| n.hash),
            Some(hashes[2])
        );
    }
}
