// SPDX-License-Identifier: MIT

//! The branch table (§3, §4.5): up to `MAX_BRANCH_CACHE` concurrently
//! cached chain branches, referencing each other by index rather than
//! pointer (§9's note on arena-style indices).

use core::cmp::Ordering;

use ledgercore_common::prelude::Vec;
use ledgercore_common::BigUint;
use ledgercore_common::BlockLocation;
use ledgercore_common::BranchRecord;
use ledgercore_common::MAX_BRANCH_CACHE;

/// Where a new block attaches, decided purely from branch-table state
/// and the location its parent hash resolved to (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    /// The parent is the tip of `branch`; the new block extends it.
    ExtendsTip(u8),
    /// The parent is mid-branch (not its tip); a new branch forks here.
    ForksMidBranch {
        parent_branch: u8,
        parent_block_index: u32,
    },
}

/// The up-to-`MAX_BRANCH_CACHE` chain branches tracked by the validator,
/// and which of them currently holds the most work.
#[derive(Debug, Clone)]
pub struct BranchTable {
    slots: [Option<BranchRecord>; MAX_BRANCH_CACHE],
    main_branch: u8,
}

impl BranchTable {
    /// Seeds the table with a single genesis branch occupying slot 0,
    /// self-referential per §3 ("self-referential for the genesis
    /// branch").
    pub fn new_with_genesis(genesis_work: BigUint, genesis_time: u32) -> Self {
        let genesis = BranchRecord {
            num_blocks: 1,
            start_height: 0,
            parent_branch: 0,
            parent_block_index: 0,
            last_retarget_time: genesis_time,
            last_validation: ledgercore_common::NO_VALIDATION,
            work: genesis_work,
        };
        let mut slots: [Option<BranchRecord>; MAX_BRANCH_CACHE] = Default::default();
        slots[0] = Some(genesis);
        BranchTable {
            slots,
            main_branch: 0,
        }
    }

    pub fn main_branch(&self) -> u8 {
        self.main_branch
    }

    pub fn main_work(&self) -> &BigUint {
        &self.branch(self.main_branch).expect("main branch always occupied").work
    }

    pub fn branch(&self, idx: u8) -> Option<&BranchRecord> {
        self.slots.get(idx as usize).and_then(|s| s.as_ref())
    }

    pub fn branch_mut(&mut self, idx: u8) -> Option<&mut BranchRecord> {
        self.slots.get_mut(idx as usize).and_then(|s| s.as_mut())
    }

    pub fn set_branch(&mut self, idx: u8, record: BranchRecord) {
        self.slots[idx as usize] = Some(record);
    }

    pub fn remove_branch(&mut self, idx: u8) {
        self.slots[idx as usize] = None;
    }

    pub fn set_main_branch(&mut self, idx: u8) {
        self.main_branch = idx;
    }

    pub fn occupied_branches(&self) -> impl Iterator<Item = u8> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i as u8))
    }

    /// The location of `branch`'s current tip.
    pub fn tip_location(&self, branch: u8) -> Option<BlockLocation> {
        let rec = self.branch(branch)?;
        Some(BlockLocation {
            branch,
            block_index: rec.num_blocks - 1,
        })
    }

    /// Classifies where a block whose parent resolved to `parent_location`
    /// attaches (§4.5 cases 1-2; case 3, parent unknown, is handled by the
    /// caller before this is reached — see [`crate::orphans`]).
    pub fn classify(&self, parent_location: BlockLocation) -> Attachment {
        if self.tip_location(parent_location.branch) == Some(parent_location) {
            Attachment::ExtendsTip(parent_location.branch)
        } else {
            Attachment::ForksMidBranch {
                parent_branch: parent_location.branch,
                parent_block_index: parent_location.block_index,
            }
        }
    }

    /// A free slot, if any, ignoring occupied ones.
    pub fn free_slot(&self) -> Option<u8> {
        self.slots
            .iter()
            .position(|s| s.is_none())
            .map(|i| i as u8)
    }

    /// The full ancestry of `branch`: every branch index appearing on its
    /// chain path, including itself.
    fn ancestor_branches(&self, branch: u8) -> Vec<u8> {
        let mut out = Vec::new();
        let mut current = branch;
        loop {
            out.push(current);
            let rec = self.branch(current).expect("branch in ancestry exists");
            if rec.parent_branch == current {
                break;
            }
            current = rec.parent_branch;
        }
        out
    }

    /// The branch with least work that is not an ancestor of the current
    /// main-branch tip, i.e. safe to evict to make room for a new branch
    /// (§4.5 case 2). `None` if every occupied branch is an ancestor of
    /// the main tip.
    pub fn evictable_branch(&self) -> Option<u8> {
        let ancestors = self.ancestor_branches(self.main_branch);
        self.occupied_branches()
            .filter(|b| !ancestors.contains(b))
            .min_by(|a, b| {
                let wa = &self.branch(*a).unwrap().work;
                let wb = &self.branch(*b).unwrap().work;
                wa.compare(wb)
            })
    }

    /// The sequence of (branch, block index) locations from the genesis
    /// branch up to `branch`'s current tip (§4.5 step 1, §8's reorg
    /// invariant). Built by walking the branch's ancestry and
    /// concatenating each ancestor's own block range.
    pub fn chain_path(&self, branch: u8) -> Vec<BlockLocation> {
        let mut out = Vec::new();
        self.chain_path_into(branch, &mut out);
        out
    }

    fn chain_path_into(&self, branch: u8, out: &mut Vec<BlockLocation>) {
        let rec = self.branch(branch).expect("branch exists");
        if rec.parent_branch != branch {
            self.chain_path_into(rec.parent_branch, out);
            out.truncate(rec.parent_block_index as usize + 1);
        }
        for i in 0..rec.num_blocks {
            out.push(BlockLocation {
                branch,
                block_index: i,
            });
        }
    }

    /// The last location common to both paths — the fork point a reorg
    /// pivots on (§4.5 step 1). Both paths always share at least the
    /// genesis location at index 0.
    pub fn intersection(path_a: &[BlockLocation], path_b: &[BlockLocation]) -> BlockLocation {
        let mut common = path_a[0];
        for (a, b) in path_a.iter().zip(path_b.iter()) {
            if a == b {
                common = *a;
            } else {
                break;
            }
        }
        common
    }

    /// Whether `branch`'s work exceeds the current main branch's.
    pub fn exceeds_main_work(&self, branch: u8) -> bool {
        let candidate = &self.branch(branch).expect("branch exists").work;
        candidate.compare(self.main_work()) == Ordering::Greater
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> BranchTable {
        BranchTable::new_with_genesis(BigUint::from_u64(100), 0)
    }

    #[test]
    fn genesis_branch_occupies_slot_zero() {
        let t = table();
        assert_eq!(t.main_branch(), 0);
        assert_eq!(t.branch(0).unwrap().num_blocks, 1);
    }

    #[test]
    fn extending_tip_is_classified_as_extends_tip() {
        let t = table();
        let tip = t.tip_location(0).unwrap();
        assert_eq!(t.classify(tip), Attachment::ExtendsTip(0));
    }

    #[test]
    fn forking_mid_branch_is_classified_as_fork() {
        let mut t = table();
        t.branch_mut(0).unwrap().num_blocks = 3;
        let mid = BlockLocation {
            branch: 0,
            block_index: 0,
        };
        assert_eq!(
            t.classify(mid),
            Attachment::ForksMidBranch {
                parent_branch: 0,
                parent_block_index: 0
            }
        );
    }

    #[test]
    fn chain_path_of_genesis_is_its_own_blocks() {
        let mut t = table();
        t.branch_mut(0).unwrap().num_blocks = 3;
        let path = t.chain_path(0);
        assert_eq!(path.len(), 3);
        assert_eq!(path[2].block_index, 2);
    }

    #[test]
    fn chain_path_of_fork_includes_truncated_parent_prefix() {
        let mut t = table();
        t.branch_mut(0).unwrap().num_blocks = 5;
        t.set_branch(
            1,
            BranchRecord {
                num_blocks: 2,
                start_height: 3,
                parent_branch: 0,
                parent_block_index: 1,
                last_retarget_time: 0,
                last_validation: ledgercore_common::NO_VALIDATION,
                work: BigUint::from_u64(10),
            },
        );
        let path = t.chain_path(1);
        // parent prefix truncated to index 0,1 of branch 0, then branch 1's own two blocks.
        assert_eq!(path.len(), 4);
        assert_eq!(path[0], BlockLocation { branch: 0, block_index: 0 });
        assert_eq!(path[1], BlockLocation { branch: 0, block_index: 1 });
        assert_eq!(path[2], BlockLocation { branch: 1, block_index: 0 });
        assert_eq!(path[3], BlockLocation { branch: 1, block_index: 1 });
    }

    #[test]
    fn intersection_finds_fork_point() {
        let mut t = table();
        t.branch_mut(0).unwrap().num_blocks = 5;
        t.set_branch(
            1,
            BranchRecord {
                num_blocks: 2,
                start_height: 3,
                parent_branch: 0,
                parent_block_index: 2,
                last_retarget_time: 0,
                last_validation: ledgercore_common::NO_VALIDATION,
                work: BigUint::from_u64(10),
            },
        );
        let main_path = t.chain_path(0);
        let side_path = t.chain_path(1);
        let fork = BranchTable::intersection(&main_path, &side_path);
        assert_eq!(fork, BlockLocation { branch: 0, block_index: 2 });
    }

    #[test]
    fn evictable_branch_excludes_main_ancestry() {
        let mut t = table();
        t.branch_mut(0).unwrap().num_blocks = 3;
        // A side branch forking off branch 0, not on the main ancestry.
        t.set_branch(
            1,
            BranchRecord {
                num_blocks: 1,
                start_height: 1,
                parent_branch: 0,
                parent_block_index: 0,
                last_retarget_time: 0,
                last_validation: ledgercore_common::NO_VALIDATION,
                work: BigUint::from_u64(1),
            },
        );
        assert_eq!(t.evictable_branch(), Some(1));
    }

    #[test]
    fn no_evictable_branch_when_only_ancestry_occupied() {
        let t = table();
        assert_eq!(t.evictable_branch(), None);
    }

    #[test]
    fn exceeds_main_work_compares_against_main_branch() {
        let mut t = table();
        t.set_branch(
            1,
            BranchRecord {
                num_blocks: 1,
                start_height: 1,
                parent_branch: 0,
                parent_block_index: 0,
                last_retarget_time: 0,
                last_validation: ledgercore_common::NO_VALIDATION,
                work: BigUint::from_u64(1000),
            },
        );
        assert!(t.exceeds_main_work(1));
    }
}
