// SPDX-License-Identifier: MIT

//! The orphan ring (§3, §4.5 case 3): a small fixed-size array with a
//! cursor, not a linked structure (§9's note on avoiding pointer graphs).

use ledgercore_common::prelude::Vec;
use ledgercore_common::MAX_ORPHAN_CACHE;

use crate::block::Block;

/// A bounded ring buffer of blocks whose parent isn't yet known.
/// Inserting past capacity overwrites the oldest entry (§4.5 case 3:
/// "advancing cursor with wraparound, overwriting the oldest orphan").
#[derive(Debug, Clone)]
pub struct OrphanRing {
    slots: [Option<Block>; MAX_ORPHAN_CACHE],
    /// The slot the next inserted orphan will occupy.
    next: u8,
}

impl Default for OrphanRing {
    fn default() -> Self {
        OrphanRing {
            slots: Default::default(),
            next: 0,
        }
    }
}

impl OrphanRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `block` at the cursor, evicting whatever previously
    /// occupied that slot, and returns the evicted block if any.
    pub fn insert(&mut self, block: Block) -> Option<Block> {
        let slot = self.next as usize;
        let evicted = self.slots[slot].take();
        self.slots[slot] = Some(block);
        self.next = ((self.next as usize + 1) % MAX_ORPHAN_CACHE) as u8;
        evicted
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    /// Removes and returns every orphan whose header's `prev_hash`
    /// matches `parent_hash`, draining them out of the ring (§4.5: "the
    /// orphan ring never contains a block whose parent has become
    /// known").
    pub fn drain_children_of(&mut self, parent_hash: &ledgercore_common::Hash256) -> Vec<Block> {
        let mut out = Vec::new();
        for slot in self.slots.iter_mut() {
            let matches = slot
                .as_ref()
                .map(|b| &b.header.prev_hash == parent_hash)
                .unwrap_or(false);
            if matches {
                if let Some(block) = slot.take() {
                    out.push(block);
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every slot alongside its index, for persisting the ring to the
    /// `orphan` index (§4.3) one slot at a time.
    pub fn slots_with_index(&self) -> impl Iterator<Item = (u8, Option<&Block>)> {
        self.slots.iter().enumerate().map(|(i, s)| (i as u8, s.as_ref()))
    }

    /// The slot the next insertion will occupy, persisted alongside the
    /// basic-validator sentinel record so a restart resumes the same
    /// wraparound position instead of starting the ring over.
    pub fn cursor(&self) -> u8 {
        self.next
    }

    /// Restores a slot's contents and the insertion cursor when
    /// reconstructing the ring from storage at startup.
    pub fn restore_slot(&mut self, slot: u8, block: Option<Block>) {
        self.slots[slot as usize] = block;
    }

    pub fn set_cursor(&mut self, next: u8) {
        self.next = next;
    }
}

#[cfg(test)]
mod tests {
    use ledgercore_common::Hash256;

    use super::*;
    use crate::block::BlockHeader;
    use crate::transaction::OutPoint;
    use crate::transaction::Transaction;
    use crate::transaction::TxIn;
    use crate::transaction::TxOut;

    fn block_with_prev(prev: Hash256) -> Block {
        Block {
            header: BlockHeader {
                version: 1,
                prev_hash: prev,
                merkle_root: Hash256::ZERO,
                time: 0,
                bits: 0x1d00ffff,
                nonce: 0,
            },
            transactions: vec![Transaction {
                version: 1,
                input: vec![TxIn {
                    previous_output: OutPoint::COINBASE,
                    script_sig: vec![0],
                    sequence: 0xFFFF_FFFF,
                }],
                output: vec![TxOut {
                    value: 0,
                    script_pubkey: vec![],
                }],
                lock_time: 0,
            }],
        }
    }

    #[test]
    fn insert_and_count() {
        let mut ring = OrphanRing::new();
        assert!(ring.is_empty());
        ring.insert(block_with_prev(Hash256::ZERO));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn wraps_around_and_evicts_oldest() {
        let mut ring = OrphanRing::new();
        for i in 0..MAX_ORPHAN_CACHE {
            ring.insert(block_with_prev(Hash256([i as u8; 32])));
        }
        assert_eq!(ring.len(), MAX_ORPHAN_CACHE);
        // One more insertion should evict slot 0's original occupant.
        let evicted = ring.insert(block_with_prev(Hash256([99; 32])));
        assert_eq!(evicted.unwrap().header.prev_hash, Hash256([0; 32]));
        assert_eq!(ring.len(), MAX_ORPHAN_CACHE);
    }

    #[test]
    fn drains_children_of_known_parent() {
        let mut ring = OrphanRing::new();
        let parent = Hash256([5; 32]);
        ring.insert(block_with_prev(parent));
        ring.insert(block_with_prev(Hash256([6; 32])));
        let drained = ring.drain_children_of(&parent);
        assert_eq!(drained.len(), 1);
        assert_eq!(ring.len(), 1);
    }
}
