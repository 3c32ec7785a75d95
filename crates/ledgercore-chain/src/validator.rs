// SPDX-License-Identifier: MIT

//! The validator façade (§4.5, §4.6): the single `process_block` entry
//! point that ties the branch table, the orphan ring, the pure rule
//! checks of [`crate::validation`], and an injected [`ChainStore`]
//! together into the state machine described by §4.5's diagram.
//!
//! Everything this crate cannot or should not implement itself —
//! cryptography, wall-clock time, logging, the signature-hash protocol —
//! is bundled into [`Dependencies`] and handed in at construction, the
//! same shape cbitcoin's `CBDependencies.h` weak symbols played, just
//! resolved once instead of at link time (see
//! [`ledgercore_common::deps`]).

use ledgercore_common::prelude::format;
use ledgercore_common::prelude::Box;
use ledgercore_common::prelude::HashMap;
use ledgercore_common::prelude::Vec;
use ledgercore_common::BigUint;
use ledgercore_common::BlockLocation;
use ledgercore_common::BranchRecord;
use ledgercore_common::ChainStore;
use ledgercore_common::Clock;
use ledgercore_common::Crypto;
use ledgercore_common::Hash256;
use ledgercore_common::LogLevel;
use ledgercore_common::Logger;
use ledgercore_common::StorageError;
use ledgercore_common::StoreKey;
use ledgercore_common::TxRef;
use ledgercore_common::UnspentRef;
use ledgercore_common::MAX_BRANCH_CACHE;
use ledgercore_common::MAX_ORPHAN_CACHE;
use ledgercore_common::NO_VALIDATION;

use crate::block::Block;
use crate::block::BlockHeader;
use crate::branch::Attachment;
use crate::branch::BranchTable;
use crate::encoding::Decode;
use crate::encoding::Encode;
use crate::error::AttachedOrphans;
use crate::error::BlockProcessResult;
use crate::error::BlockProcessStatus;
use crate::error::BlockValidationErrors as Err_;
use crate::error::BlockchainError;
use crate::error::ReorgDescription;
use crate::error::TransactionError;
use crate::orphans::OrphanRing;
use crate::params::ChainParams;
use crate::script::sighash::SigHasher;
use crate::transaction::OutPoint;
use crate::transaction::Transaction;
use crate::transaction::TxOut;
use crate::validation;
use crate::varint;
use crate::work;

/// Every external capability `process_block` needs but this crate does
/// not implement, bundled at construction rather than threaded through
/// every call (§9's design note against the original's weak-linked
/// globals). `sighasher` lives here rather than folded into `Crypto`
/// because the signature-hash protocol is parameterised over
/// [`Transaction`], a domain type `ledgercore-common` doesn't know.
pub struct Dependencies {
    pub crypto: Box<dyn Crypto>,
    pub clock: Box<dyn Clock>,
    pub logger: Box<dyn Logger>,
    pub sighasher: Box<dyn SigHasher>,
}

/// Runtime toggles for `process_block` (§10.9, supplementing cbitcoin's
/// `CBValidatorFlags`; its `CB_VALIDATOR_HEADERS_ONLY` flag map to
/// [`ValidatorFlags::HEADERS_ONLY`] here, and its P2P-only `working` gate
/// has no counterpart — this crate never suspends mid-block, §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValidatorFlags(u8);

impl ValidatorFlags {
    pub const NONE: ValidatorFlags = ValidatorFlags(0);
    /// Skip proof-of-work and target-range checks entirely. Meant for
    /// regtest-style networks and this crate's own tests, never for a
    /// block accepted from an untrusted peer.
    pub const DISABLE_POW_CHECK: ValidatorFlags = ValidatorFlags(1 << 0);
    /// Validate and store headers only: skip per-transaction script and
    /// value checks, and skip maintaining the `tx`/`unspent` indexes.
    pub const HEADERS_ONLY: ValidatorFlags = ValidatorFlags(1 << 1);

    pub fn contains(self, flag: ValidatorFlags) -> bool {
        self.0 & flag.0 == flag.0
    }
}

impl core::ops::BitOr for ValidatorFlags {
    type Output = ValidatorFlags;
    fn bitor(self, rhs: Self) -> Self {
        ValidatorFlags(self.0 | rhs.0)
    }
}

/// Ties the branch table, the orphan ring and a [`ChainStore`] together
/// behind the single `process_block` entry point (§4.5, §4.6).
pub struct Validator {
    deps: Dependencies,
    storage: Box<dyn ChainStore>,
    params: ChainParams,
    flags: ValidatorFlags,
    branches: BranchTable,
    orphans: OrphanRing,
}

impl Validator {
    /// Opens a validator against `storage`: resumes from a previously
    /// persisted branch table and orphan ring if the basic-validator
    /// sentinel record (`StoreKey::Branch(None)`) is present, otherwise
    /// bootstraps a fresh chain from `params.genesis`.
    pub fn new(
        deps: Dependencies,
        mut storage: Box<dyn ChainStore>,
        params: ChainParams,
        flags: ValidatorFlags,
    ) -> Result<Self, BlockchainError> {
        if let Some(sentinel) = storage.read(&StoreKey::Branch(None))? {
            let (main_branch, cursor) = decode_sentinel(&sentinel)?;
            let mut branches = BranchTable::new_with_genesis(BigUint::zero(), 0);
            branches.remove_branch(0);
            for idx in 0..MAX_BRANCH_CACHE as u8 {
                if let Some(bytes) = storage.read(&StoreKey::Branch(Some(idx)))? {
                    branches.set_branch(idx, decode_branch_record(&bytes)?);
                }
            }
            branches.set_main_branch(main_branch);
            let mut orphans = OrphanRing::new();
            for slot in 0..MAX_ORPHAN_CACHE as u8 {
                if let Some(bytes) = storage.read(&StoreKey::Orphan(slot))? {
                    let (block, _) = Block::decode_from(&bytes)
                        .map_err(|e| StorageError::Corrupt(format!("orphan slot {slot}: {e}")))?;
                    orphans.restore_slot(slot, Some(block));
                }
            }
            orphans.set_cursor(cursor);
            return Ok(Validator {
                deps,
                storage,
                params,
                flags,
                branches,
                orphans,
            });
        }

        let genesis = params.genesis.clone();
        let hash = genesis.block_hash(deps.crypto.as_ref());
        let genesis_work = work::work_for_bits(genesis.header.bits);
        let branches = BranchTable::new_with_genesis(genesis_work, genesis.header.time);
        let mut validator = Validator {
            deps,
            storage,
            params,
            flags,
            branches,
            orphans: OrphanRing::new(),
        };
        let location = BlockLocation { branch: 0, block_index: 0 };
        let regions = validator.store_block(location, &genesis, &hash);
        validator.apply_block_forward(location, &genesis, &regions)?;
        validator.persist_branch(0);
        validator.persist_sentinel();
        validator.storage.commit()?;
        Ok(validator)
    }

    /// Read-only access to the branch table, for an embedder that wants
    /// to report the current tip without going through `process_block`.
    pub fn branches(&self) -> &BranchTable {
        &self.branches
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// Consumes the validator and hands back its storage handle, for an
    /// embedder that is shutting down cleanly and wants to reopen a new
    /// `Validator` against the same backing store later.
    pub fn into_storage(self) -> Box<dyn ChainStore> {
        self.storage
    }

    /// Validates and attempts to attach `block` to the chain (§4.5,
    /// §4.6). `network_time` is the caller's current Unix time, used for
    /// the future-drift half of the timestamp check — not read from
    /// `self.deps.clock` directly, so a caller validating a batch of
    /// historical blocks can pin it once instead of drifting across the
    /// batch.
    pub fn process_block(&mut self, block: &Block, network_time: u64) -> BlockProcessResult {
        let hash = block.block_hash(self.deps.crypto.as_ref());

        if self.lookup_block_location(&hash)?.is_some() || self.is_known_orphan(&hash) {
            self.log(LogLevel::Debug, &format!("duplicate block {hash}"));
            return Ok(BlockProcessStatus::Duplicate);
        }

        if let Err(e) = validation::check_basic_block(block) {
            self.log(LogLevel::Warn, &format!("block {hash} failed basic checks: {e}"));
            return Ok(BlockProcessStatus::Bad(e));
        }

        if !self.flags.contains(ValidatorFlags::DISABLE_POW_CHECK) {
            if let Err(e) = validation::check_target_within_limit(&block.header, &self.params) {
                self.log(LogLevel::Warn, &format!("block {hash}: {e}"));
                return Ok(BlockProcessStatus::Bad(e));
            }
            if let Err(e) = validation::check_proof_of_work(&hash, &block.header) {
                self.log(LogLevel::Warn, &format!("block {hash}: {e}"));
                return Ok(BlockProcessStatus::Bad(e));
            }
        }

        if let Err(e) = validation::check_merkle_root(block, self.deps.crypto.as_ref()) {
            self.log(LogLevel::Warn, &format!("block {hash}: {e}"));
            return Ok(BlockProcessStatus::Bad(e));
        }

        let Some(parent_location) = self.lookup_block_location(&block.header.prev_hash)? else {
            self.log(LogLevel::Debug, &format!("block {hash} is an orphan, parent unknown"));
            self.insert_orphan(block.clone());
            self.persist_sentinel();
            self.storage.commit()?;
            self.record_metric_orphan();
            return Ok(BlockProcessStatus::Orphan);
        };

        let median_time_past = self.median_time_past(parent_location)?;
        if let Err(e) = validation::check_timestamp(&block.header, median_time_past, network_time) {
            self.log(LogLevel::Warn, &format!("block {hash}: {e}"));
            return Ok(BlockProcessStatus::BadTime);
        }

        let parent_header = self.read_block_header(parent_location)?;
        let new_height = self.location_height(parent_location)? + 1;
        let expected_bits = self.expected_bits(parent_location.branch, new_height, &parent_header)?;
        if !self.flags.contains(ValidatorFlags::DISABLE_POW_CHECK) && block.header.bits != expected_bits {
            self.log(
                LogLevel::Warn,
                &format!("block {hash}: bits {:#x}, expected {expected_bits:#x}", block.header.bits),
            );
            return Ok(BlockProcessStatus::Bad(Err_::TargetOutOfBounds));
        }

        let attachment = self.branches.classify(parent_location);
        let result = match attachment {
            Attachment::ExtendsTip(branch) if branch == self.branches.main_branch() => {
                self.extend_main(branch, block, &hash, new_height)
            }
            Attachment::ExtendsTip(branch) => self.extend_side(branch, block, &hash, new_height),
            Attachment::ForksMidBranch { parent_branch, parent_block_index } => {
                self.fork_new_branch(parent_branch, parent_block_index, block, &hash, new_height)
            }
        };

        match &result {
            Ok(status) => self.record_metric_status(status),
            Err(_) => self.record_metric_error(),
        }
        result
    }

    // ---- branch attachment ------------------------------------------

    fn extend_main(
        &mut self,
        branch: u8,
        block: &Block,
        hash: &Hash256,
        height: u32,
    ) -> BlockProcessResult {
        let location = BlockLocation { branch, block_index: self.branches.branch(branch).unwrap().num_blocks };
        match self.validate_and_apply(branch, location, block, height) {
            Ok(ValidateOutcome::Applied) => {}
            Ok(ValidateOutcome::Rejected(e)) => {
                self.storage.reset();
                self.log(LogLevel::Warn, &format!("block {hash}: {e}"));
                return Ok(BlockProcessStatus::Bad(e));
            }
            Err(e) => {
                self.storage.reset();
                return Err(e);
            }
        }
        self.persist_sentinel();
        self.storage.commit()?;
        self.log(LogLevel::Info, &format!("block {hash} extends the main chain at height {height}"));

        let orphans = self.drain_orphans_onto_main(hash)?;
        if orphans.is_empty() {
            Ok(BlockProcessStatus::Main)
        } else {
            Ok(BlockProcessStatus::MainWithOrphans(orphans))
        }
    }

    fn extend_side(&mut self, branch: u8, block: &Block, hash: &Hash256, height: u32) -> BlockProcessResult {
        let location =
            BlockLocation { branch, block_index: self.branches.branch(branch).unwrap().num_blocks };
        self.store_block(location, block, hash);
        {
            let rec = self.branches.branch_mut(branch).expect("branch exists");
            rec.num_blocks += 1;
            rec.work.add_assign(&work::work_for_bits(block.header.bits));
            if height % self.params.difficulty_adjustment_interval == 0 {
                rec.last_retarget_time = block.header.time;
            }
        }
        self.persist_branch(branch);
        self.persist_sentinel();
        self.storage.commit()?;
        self.log(LogLevel::Debug, &format!("block {hash} extends side branch {branch} at height {height}"));
        self.maybe_reorg(branch, hash)
    }

    fn fork_new_branch(
        &mut self,
        parent_branch: u8,
        parent_block_index: u32,
        block: &Block,
        hash: &Hash256,
        height: u32,
    ) -> BlockProcessResult {
        let new_branch = match self.branches.free_slot() {
            Some(idx) => idx,
            None => match self.branches.evictable_branch() {
                Some(idx) => {
                    self.evict_branch(idx);
                    idx
                }
                None => {
                    self.log(LogLevel::Warn, &format!("no evictable branch slot for fork at block {hash}"));
                    return Ok(BlockProcessStatus::NoNew);
                }
            },
        };

        let fork_point = BlockLocation { branch: parent_branch, block_index: parent_block_index };
        let mut work = self.cumulative_work_to(fork_point)?;
        work.add_assign(&work::work_for_bits(block.header.bits));

        let record = BranchRecord {
            num_blocks: 1,
            start_height: height,
            parent_branch,
            parent_block_index,
            last_retarget_time: self.branches.branch(parent_branch).unwrap().last_retarget_time,
            last_validation: NO_VALIDATION,
            work,
        };
        self.branches.set_branch(new_branch, record);
        let location = BlockLocation { branch: new_branch, block_index: 0 };
        self.store_block(location, block, hash);
        self.persist_branch(new_branch);
        self.persist_sentinel();
        self.storage.commit()?;
        self.log(
            LogLevel::Debug,
            &format!("block {hash} forks new branch {new_branch} off branch {parent_branch} at height {height}"),
        );
        self.maybe_reorg(new_branch, hash)
    }

    /// Removes a branch evicted to free its table slot (§4.5 case 2). Its
    /// blocks were never applied to the `tx`/`unspent` indexes (only a
    /// branch that has been, or becomes, main ever is — see the module
    /// documentation), so reclaiming its slot is a plain delete of the
    /// `block`/`blockHash` records it owns, no `tx`/`unspent` bookkeeping
    /// to undo.
    fn evict_branch(&mut self, idx: u8) {
        let Some(rec) = self.branches.branch(idx).cloned() else { return };
        for i in 0..rec.num_blocks {
            let location = BlockLocation { branch: idx, block_index: i };
            if let Ok(Some(stored)) = self.storage.read(&StoreKey::Block(location)) {
                if stored.len() >= 32 {
                    let mut hash = [0u8; 32];
                    hash.copy_from_slice(&stored[..32]);
                    self.storage.remove(StoreKey::BlockHash(Hash256(hash).index_prefix()));
                }
            }
            self.storage.remove(StoreKey::Block(location));
        }
        self.storage.remove(StoreKey::BranchWork(idx));
        self.branches.remove_branch(idx);
        self.log(LogLevel::Debug, &format!("evicted branch {idx} to free its slot"));
    }

    /// If `branch`'s work now exceeds the main branch's, performs the
    /// reorg described by §4.5 step 1-5. Otherwise reports `Side`.
    fn maybe_reorg(&mut self, branch: u8, hash: &Hash256) -> BlockProcessResult {
        if !self.branches.exceeds_main_work(branch) {
            return Ok(BlockProcessStatus::Side(branch));
        }

        let old_main = self.branches.main_branch();
        let old_path = self.branches.chain_path(old_main);
        let new_path = self.branches.chain_path(branch);
        let fork_point = BranchTable::intersection(&old_path, &new_path);
        let fork_index = new_path.iter().position(|l| *l == fork_point).expect("fork point is on the new path");
        let reorg_len = new_path.len() - (fork_index + 1);

        for location in old_path.iter().rev() {
            if *location == fork_point {
                break;
            }
            let block = self.read_block(*location)?;
            self.revert_block_backward(&block)?;
        }

        let mut height = self.location_height(fork_point)?;
        for location in &new_path[fork_index + 1..] {
            height += 1;
            let block = self.read_block(*location)?;
            match self.validate_and_apply(location.branch, *location, &block, height) {
                Ok(ValidateOutcome::Applied) => {}
                Ok(ValidateOutcome::Rejected(e)) => {
                    self.storage.reset();
                    self.log(LogLevel::Error, &format!("reorg to branch {branch} aborted: {e}"));
                    return Ok(BlockProcessStatus::Bad(e));
                }
                Err(e) => {
                    self.storage.reset();
                    return Err(e);
                }
            }
        }

        // Mark `branch` main before renumbering so `evictable_branch`
        // (consulted if a displaced segment needs a fresh slot) treats it
        // and its current ancestry as protected, the same way it already
        // protects the chain a fork is never allowed to evict (§4.5 case
        // 2).
        self.branches.set_main_branch(branch);
        self.renumber_after_reorg(branch)?;

        // §4.5 step 4 folds the old chain's shared prefix into `branch`'s
        // own record, so every location on its path beyond the fork may
        // have moved; recompute it rather than trust the pre-renumbering
        // `new_path`/`fork_point`. The number of newly-main blocks
        // (`reorg_len`) is unchanged by renumbering, only their locations.
        let final_path = self.branches.chain_path(branch);
        let new_chain_path = final_path[final_path.len() - reorg_len..].to_vec();
        let final_fork_point = final_path[final_path.len() - reorg_len - 1];

        self.persist_sentinel();
        self.storage.commit()?;
        self.log(
            LogLevel::Info,
            &format!("reorg: new main branch {branch} via block {hash}, fork at {final_fork_point:?}"),
        );
        self.record_metric_reorg(reorg_len);

        Ok(BlockProcessStatus::Reorg(ReorgDescription {
            new_chain_path,
            fork_point: final_fork_point,
        }))
    }

    /// §4.5 step 4: after a reorg, folds the shared prefix that used to
    /// live on an ancestor branch directly into `child`'s own record via
    /// `change_key` — a rename, never a rewrite of block payload bytes —
    /// so a branch that won a reorg ends up self-contained instead of
    /// leaving its history split across the table the way it happened to
    /// attach. Walks upward: a non-root ancestor that's fully absorbed is
    /// dissolved and the loop continues against its own parent; the
    /// self-referential root only ever gives up the prefix strictly
    /// between genesis and the fork point, since genesis must stay put at
    /// branch 0.
    fn renumber_after_reorg(&mut self, mut child: u8) -> Result<(), BlockchainError> {
        loop {
            let rec = self.branches.branch(child).expect("branch exists").clone();
            if rec.parent_branch == child {
                break;
            }
            let parent = rec.parent_branch;
            let parent_rec = self.branches.branch(parent).expect("parent branch exists").clone();
            let is_root = parent_rec.parent_branch == parent;
            let merge_from: u32 = if is_root { 1 } else { 0 };
            let prefix_len = rec.parent_block_index + 1 - merge_from;

            // Shift `child`'s own blocks back to make room for the
            // absorbed prefix, highest index first so no relocation
            // overwrites a block not yet moved.
            for i in (0..rec.num_blocks).rev() {
                self.relocate_block(
                    BlockLocation { branch: child, block_index: i },
                    BlockLocation { branch: child, block_index: i + prefix_len },
                )?;
            }
            for i in merge_from..=rec.parent_block_index {
                self.relocate_block(
                    BlockLocation { branch: parent, block_index: i },
                    BlockLocation { branch: child, block_index: i - merge_from },
                )?;
            }

            // Any other branch forking off `parent` within the absorbed
            // range now forks off `child` at the shifted local index.
            let others: Vec<u8> =
                self.branches.occupied_branches().filter(|b| *b != child && *b != parent).collect();
            for other in others {
                let mut other_rec = self.branches.branch(other).expect("branch exists").clone();
                if other_rec.parent_branch == parent && other_rec.parent_block_index >= merge_from {
                    other_rec.parent_branch = child;
                    other_rec.parent_block_index -= merge_from;
                    self.branches.set_branch(other, other_rec);
                    self.persist_branch(other);
                }
            }

            // Content that was on `parent` beyond the fork point (its old
            // tip, if `parent` was main) has no branch record of its own
            // yet and needs one before `parent` shrinks or disappears.
            let leftover_start = rec.parent_block_index + 1;
            if leftover_start < parent_rec.num_blocks {
                let (leftover_parent_branch, leftover_parent_index) = if prefix_len > 0 {
                    (child, prefix_len - 1)
                } else {
                    // Nothing was absorbed into `child`; the leftover's
                    // real parent is still `parent`'s own kept prefix.
                    (parent, rec.parent_block_index)
                };
                self.rehome_leftover_tail(
                    parent,
                    leftover_start,
                    &parent_rec,
                    leftover_parent_branch,
                    leftover_parent_index,
                )?;
            }

            if is_root {
                let mut root_work = BigUint::zero();
                for i in 0..merge_from {
                    let header = self.read_block_header(BlockLocation { branch: parent, block_index: i })?;
                    root_work.add_assign(&work::work_for_bits(header.bits));
                }
                let root_rec = self.branches.branch_mut(parent).expect("root branch exists");
                root_rec.num_blocks = merge_from;
                root_rec.work = root_work;
                self.persist_branch(parent);
            } else {
                self.storage.remove(StoreKey::Branch(Some(parent)));
                self.storage.remove(StoreKey::BranchWork(parent));
                self.branches.remove_branch(parent);
            }

            let child_rec = self.branches.branch_mut(child).expect("branch exists");
            child_rec.num_blocks = rec.num_blocks + prefix_len;
            child_rec.start_height = rec.start_height - prefix_len;
            child_rec.parent_branch = parent_rec.parent_branch;
            child_rec.parent_block_index = if is_root { 0 } else { parent_rec.parent_block_index };
            child_rec.last_validation = if rec.last_validation == NO_VALIDATION {
                NO_VALIDATION
            } else {
                rec.last_validation + prefix_len
            };
            self.persist_branch(child);

            if is_root {
                break;
            }
        }
        Ok(())
    }

    /// Gives a new branch slot to the tail of `old_branch` beyond
    /// `leftover_start` — content that was never a branch of its own
    /// (it was simply the rest of `old_branch`'s own blocks) but can no
    /// longer stay there once `old_branch` shrinks or dissolves during
    /// [`Validator::renumber_after_reorg`]. Falls back to eviction, then
    /// to pruning the content outright, the same two-step fallback
    /// `fork_new_branch` already uses when the table is full.
    fn rehome_leftover_tail(
        &mut self,
        old_branch: u8,
        leftover_start: u32,
        old_rec_before: &BranchRecord,
        new_parent_branch: u8,
        new_parent_block_index: u32,
    ) -> Result<(), BlockchainError> {
        let dest = match self.branches.free_slot() {
            Some(idx) => idx,
            None => match self.branches.evictable_branch() {
                Some(idx) => {
                    self.evict_branch(idx);
                    idx
                }
                None => {
                    for i in leftover_start..old_rec_before.num_blocks {
                        let location = BlockLocation { branch: old_branch, block_index: i };
                        if let Ok(Some(stored)) = self.storage.read(&StoreKey::Block(location)) {
                            if stored.len() >= 32 {
                                let mut hash = [0u8; 32];
                                hash.copy_from_slice(&stored[..32]);
                                self.storage.remove(StoreKey::BlockHash(Hash256(hash).index_prefix()));
                            }
                        }
                        self.storage.remove(StoreKey::Block(location));
                    }
                    self.log(
                        LogLevel::Warn,
                        "no branch slot available to preserve a displaced chain segment after a reorg; it was pruned",
                    );
                    return Ok(());
                }
            },
        };

        for (offset, i) in (leftover_start..old_rec_before.num_blocks).enumerate() {
            self.relocate_block(
                BlockLocation { branch: old_branch, block_index: i },
                BlockLocation { branch: dest, block_index: offset as u32 },
            )?;
        }

        // The leftover's tip is the exact same block it always was, so
        // its cumulative-to-tip work and last retarget time — both
        // properties of actual chain content, not of how the branch
        // table happens to partition it — carry over unchanged.
        let last_validation = if old_rec_before.last_validation == NO_VALIDATION
            || old_rec_before.last_validation < leftover_start
        {
            NO_VALIDATION
        } else {
            old_rec_before.last_validation - leftover_start
        };
        let record = BranchRecord {
            num_blocks: old_rec_before.num_blocks - leftover_start,
            start_height: old_rec_before.start_height + leftover_start,
            parent_branch: new_parent_branch,
            parent_block_index: new_parent_block_index,
            last_retarget_time: old_rec_before.last_retarget_time,
            last_validation,
            work: old_rec_before.work.clone(),
        };
        self.branches.set_branch(dest, record);
        self.persist_branch(dest);
        Ok(())
    }

    /// Moves a stored block from `from` to `to` via `change_key` — a
    /// rename, the value's bytes are never touched — and fixes up the two
    /// places that point at it by value rather than by reference: the
    /// `blockHash` index (whose value *is* the encoded location) and any
    /// `tx` record the block's own transactions own (`TxRef::location`).
    fn relocate_block(&mut self, from: BlockLocation, to: BlockLocation) -> Result<(), BlockchainError> {
        if from == to {
            return Ok(());
        }
        let block = self.read_block(from)?;
        for tx in &block.transactions {
            let txid = tx.txid(self.deps.crypto.as_ref());
            if let Some(mut tx_ref) = self.read_tx_ref(&txid)? {
                if tx_ref.location == from {
                    tx_ref.location = to;
                    self.storage.write(StoreKey::Tx(txid), encode_tx_ref(&tx_ref));
                }
            }
        }
        let hash = block.block_hash(self.deps.crypto.as_ref());
        self.storage.write(StoreKey::BlockHash(hash.index_prefix()), encode_location(to));
        self.storage.change_key(StoreKey::Block(from), StoreKey::Block(to));
        Ok(())
    }

    /// Drains every orphan whose parent is `parent_hash`, feeding each
    /// back through `process_block` in case it itself unblocks further
    /// orphans (§4.5: "the orphan ring never contains a block whose
    /// parent has become known").
    fn drain_orphans_onto_main(&mut self, parent_hash: &Hash256) -> Result<AttachedOrphans, BlockchainError> {
        let mut attached = Vec::new();
        let mut frontier = vec![*parent_hash];
        while let Some(parent) = frontier.pop() {
            let children = self.orphans.drain_children_of(&parent);
            if !children.is_empty() {
                self.persist_sentinel();
                self.storage.commit()?;
            }
            for child in children {
                let child_hash = child.block_hash(self.deps.crypto.as_ref());
                let now = self.deps.clock.now_unix();
                match self.process_block(&child, now)? {
                    BlockProcessStatus::Main | BlockProcessStatus::Side(_) | BlockProcessStatus::Reorg(_) => {
                        attached.push(child_hash);
                        frontier.push(child_hash);
                    }
                    BlockProcessStatus::MainWithOrphans(mut more) => {
                        attached.push(child_hash);
                        attached.append(&mut more);
                        frontier.push(child_hash);
                    }
                    _ => {}
                }
            }
        }
        Ok(attached)
    }

    fn insert_orphan(&mut self, block: Block) {
        self.orphans.insert(block);
    }

    fn is_known_orphan(&self, hash: &Hash256) -> bool {
        self.orphans.iter().any(|b| b.block_hash(self.deps.crypto.as_ref()) == *hash)
    }

    // ---- full transaction-level validation ----------------------------

    /// Runs full transaction-level validation (unless `HEADERS_ONLY`) and
    /// applies its effects to the `tx`/`unspent` indexes, all staged —
    /// nothing here commits. Shared by `extend_main` and the reorg
    /// forward-revalidation pass (§4.5 step 2/§4.6 step 3), since both
    /// ultimately mean "this block becomes part of the main chain".
    fn validate_and_apply(
        &mut self,
        branch: u8,
        location: BlockLocation,
        block: &Block,
        height: u32,
    ) -> Result<ValidateOutcome, BlockchainError> {
        let hash = block.block_hash(self.deps.crypto.as_ref());
        let regions = self.store_block(location, block, &hash);

        if !self.flags.contains(ValidatorFlags::HEADERS_ONLY) {
            if let Err(e) = self.complete_block_validation(block, height) {
                return match e {
                    BlockchainError::Storage(_) => Err(e),
                    BlockchainError::Invalid(ve) => Ok(ValidateOutcome::Rejected(ve)),
                    BlockchainError::Transaction(te) => Ok(ValidateOutcome::Rejected(te.error)),
                };
            }
            self.apply_block_forward(location, block, &regions)?;
        }

        let rec = self.branches.branch_mut(branch).expect("branch exists");
        // `location.block_index == rec.num_blocks` is the "this block is
        // genuinely new to this branch record" case (a fresh tip
        // extension). The reorg forward-revalidation pass in
        // `maybe_reorg` calls this same function again for blocks whose
        // work and block count were already folded in when they were
        // first attached via `extend_side`/`fork_new_branch`; for those,
        // only `last_validation` needs touching, or the branch's work
        // and block count would be counted twice.
        let is_new_to_branch = location.block_index == rec.num_blocks;
        if is_new_to_branch {
            rec.num_blocks += 1;
            rec.work.add_assign(&work::work_for_bits(block.header.bits));
            if height % self.params.difficulty_adjustment_interval == 0 {
                rec.last_retarget_time = block.header.time;
            }
        }
        rec.last_validation = if self.flags.contains(ValidatorFlags::HEADERS_ONLY) {
            NO_VALIDATION
        } else {
            location.block_index
        };
        self.persist_branch(branch);
        Ok(ValidateOutcome::Applied)
    }

    /// Full per-transaction validation for a block about to join the
    /// main chain (§4.4's input-check/subsidy rules, composed): coinbase
    /// shape, BIP34, the block's sig-op budget, every non-coinbase
    /// transaction against the outputs it spends, and the coinbase's
    /// value against subsidy plus fees.
    fn complete_block_validation(&self, block: &Block, height: u32) -> Result<(), BlockchainError> {
        let coinbase = block.coinbase().ok_or(Err_::EmptyBlock)?;
        validation::check_coinbase_script_sig_size(coinbase)?;
        validation::check_bip34_height(coinbase, height, &self.params)?;
        validation::check_sig_op_budget(block)?;

        let mut prevouts: Vec<(OutPoint, TxOut, bool, u32)> = Vec::new();
        for tx in &block.transactions[1..] {
            for input in &tx.input {
                let op = input.previous_output;
                if prevouts.iter().any(|(o, _, _, _)| *o == op) {
                    continue;
                }
                let still_unspent = self.storage.read(&StoreKey::Unspent(op.txid, op.index))?.is_some();
                let tx_ref = self.read_tx_ref(&op.txid)?.filter(|_| still_unspent);
                let Some(tx_ref) = tx_ref else {
                    return Err(TransactionError {
                        txid: tx.txid(self.deps.crypto.as_ref()),
                        error: Err_::UtxoAlreadySpent(op.txid),
                    }
                    .into());
                };
                let (output, _) = self.locate_output(&tx_ref, op.index)?;
                let confirmed_height = self.location_height(tx_ref.location)?;
                prevouts.push((op, output, tx_ref.is_coinbase, confirmed_height));
            }
        }

        let mut lookup: validation::SpentOutputLookup = HashMap::new();
        for (op, output, is_coinbase, confirmed_height) in &prevouts {
            lookup.insert(
                *op,
                validation::SpentOutput { output, is_coinbase: *is_coinbase, confirmed_height: *confirmed_height },
            );
        }

        let fees = validation::verify_block_transactions(
            block,
            height,
            &lookup,
            self.deps.crypto.as_ref(),
            self.deps.sighasher.as_ref(),
        )?;
        let subsidy = self.params.subsidy_at_height(height);
        validation::check_coinbase_value(coinbase, subsidy, fees)?;
        Ok(())
    }

    /// Spends every input of every non-coinbase transaction and creates a
    /// `tx`/`unspent` record for every transaction in the block,
    /// including the coinbase (§4.3, §4.6 step 4).
    fn apply_block_forward(
        &mut self,
        location: BlockLocation,
        block: &Block,
        regions: &[(u32, u32)],
    ) -> Result<(), BlockchainError> {
        for tx in &block.transactions[1..] {
            for input in &tx.input {
                let op = input.previous_output;
                self.storage.remove(StoreKey::Unspent(op.txid, op.index));
                if let Some(mut tx_ref) = self.read_tx_ref(&op.txid)? {
                    tx_ref.unspent_count = tx_ref.unspent_count.saturating_sub(1);
                    self.storage.write(StoreKey::Tx(op.txid), encode_tx_ref(&tx_ref));
                }
            }
        }

        for (tx, (offset, length)) in block.transactions.iter().zip(regions) {
            let txid = tx.txid(self.deps.crypto.as_ref());
            match self.read_tx_ref(&txid)? {
                Some(mut existing) => {
                    // Historical duplicate-transaction-hash case (§3,
                    // §9): a second confirming block of the same tx hash
                    // only bumps the instance count; its own outputs
                    // aren't re-indexed under the already-occupied key.
                    existing.instance_count += 1;
                    self.storage.write(StoreKey::Tx(txid), encode_tx_ref(&existing));
                }
                None => {
                    let tx_ref = TxRef {
                        location,
                        outputs_offset: *offset,
                        outputs_length: *length,
                        is_coinbase: tx.is_coinbase(),
                        instance_count: 1,
                        unspent_count: tx.output.len() as u32,
                    };
                    self.storage.write(StoreKey::Tx(txid), encode_tx_ref(&tx_ref));
                    for (index, (pos, len)) in output_positions(tx).into_iter().enumerate() {
                        let unspent = UnspentRef { position: *offset + pos, length: len };
                        self.storage.write(StoreKey::Unspent(txid, index as u32), encode_unspent_ref(&unspent));
                    }
                }
            }
        }
        Ok(())
    }

    /// The inverse of [`Validator::apply_block_forward`]: restores the
    /// outputs a reverted block's inputs had spent, and removes the
    /// block's own transactions from the `tx`/`unspent` indexes (§4.5
    /// step 2, "revert the old chain back to the intersection").
    ///
    /// Never deletes a `tx` record purely because its `unspent_count`
    /// reaches zero (only when `instance_count` does, mirroring
    /// `apply_block_forward`'s increment) — an open question (§9)
    /// resolved in favour of cheap, correct-by-construction reverts over
    /// reclaiming the record a touch earlier.
    fn revert_block_backward(&mut self, block: &Block) -> Result<(), BlockchainError> {
        for tx in &block.transactions[1..] {
            for input in &tx.input {
                let op = input.previous_output;
                if let Some(mut spent_ref) = self.read_tx_ref(&op.txid)? {
                    let (_, unspent) = self.locate_output(&spent_ref, op.index)?;
                    self.storage.write(StoreKey::Unspent(op.txid, op.index), encode_unspent_ref(&unspent));
                    spent_ref.unspent_count += 1;
                    self.storage.write(StoreKey::Tx(op.txid), encode_tx_ref(&spent_ref));
                }
            }
        }

        for tx in &block.transactions {
            let txid = tx.txid(self.deps.crypto.as_ref());
            if let Some(mut tx_ref) = self.read_tx_ref(&txid)? {
                for index in 0..tx.output.len() as u32 {
                    self.storage.remove(StoreKey::Unspent(txid, index));
                }
                if tx_ref.instance_count <= 1 {
                    self.storage.remove(StoreKey::Tx(txid));
                } else {
                    tx_ref.instance_count -= 1;
                    self.storage.write(StoreKey::Tx(txid), encode_tx_ref(&tx_ref));
                }
            }
        }
        Ok(())
    }

    // ---- storage-backed lookups ---------------------------------------

    fn store_block(&mut self, location: BlockLocation, block: &Block, hash: &Hash256) -> Vec<(u32, u32)> {
        let (bytes, regions) = encode_stored_block(block, hash);
        self.storage.write(StoreKey::Block(location), bytes);
        self.storage.write(StoreKey::BlockHash(hash.index_prefix()), encode_location(location));
        regions
    }

    fn lookup_block_location(&self, hash: &Hash256) -> Result<Option<BlockLocation>, BlockchainError> {
        match self.storage.read(&StoreKey::BlockHash(hash.index_prefix()))? {
            Some(bytes) => Ok(Some(decode_location(&bytes)?)),
            None => Ok(None),
        }
    }

    fn read_block(&self, location: BlockLocation) -> Result<Block, BlockchainError> {
        let stored = self
            .storage
            .read(&StoreKey::Block(location))?
            .ok_or_else(|| StorageError::MissingKey(format!("block({},{})", location.branch, location.block_index)))?;
        let (block, _) = Block::decode_from(&stored[32..])
            .map_err(|e| StorageError::Corrupt(format!("block({},{}): {e}", location.branch, location.block_index)))?;
        Ok(block)
    }

    fn read_block_header(&self, location: BlockLocation) -> Result<BlockHeader, BlockchainError> {
        let stored = self
            .storage
            .read(&StoreKey::Block(location))?
            .ok_or_else(|| StorageError::MissingKey(format!("block({},{})", location.branch, location.block_index)))?;
        let (header, _) = BlockHeader::decode_from(&stored[32..])
            .map_err(|e| StorageError::Corrupt(format!("block({},{}) header: {e}", location.branch, location.block_index)))?;
        Ok(header)
    }

    fn read_tx_ref(&self, txid: &Hash256) -> Result<Option<TxRef>, BlockchainError> {
        match self.storage.read(&StoreKey::Tx(*txid))? {
            Some(bytes) => Ok(Some(decode_tx_ref(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Decodes the output at `index` of `tx_ref`'s transaction, along
    /// with the `unspent` record that addresses it — both derived from
    /// the same byte slice this transaction's outputs were written to
    /// (§4.3), so nothing here needs to re-decode the whole block or
    /// search its transaction list by hash.
    fn locate_output(&self, tx_ref: &TxRef, index: u32) -> Result<(TxOut, UnspentRef), BlockchainError> {
        let stored = self
            .storage
            .read(&StoreKey::Block(tx_ref.location))?
            .ok_or_else(|| StorageError::MissingKey(format!("block({},{})", tx_ref.location.branch, tx_ref.location.block_index)))?;
        let start = tx_ref.outputs_offset as usize;
        let end = start + tx_ref.outputs_length as usize;
        let region = stored
            .get(start..end)
            .ok_or_else(|| StorageError::Corrupt("tx outputs region out of bounds".into()))?;
        let (_, mut offset) =
            varint::decode_var_int(region).ok_or_else(|| StorageError::Corrupt("tx outputs region: bad count".into()))?;
        for _ in 0..index {
            let (_, consumed) = TxOut::decode_from(&region[offset..])
                .map_err(|e| StorageError::Corrupt(format!("tx outputs region: {e}")))?;
            offset += consumed;
        }
        let position = offset as u32;
        let (output, consumed) = TxOut::decode_from(&region[offset..])
            .map_err(|e| StorageError::Corrupt(format!("tx outputs region: {e}")))?;
        Ok((
            output,
            UnspentRef { position: tx_ref.outputs_offset + position, length: consumed as u32 },
        ))
    }

    /// Walks backward from `location`'s branch ancestry to collect up to
    /// `n` recent headers, without materialising the whole chain path
    /// (§4.4's timestamp check only ever needs the last 11).
    fn recent_headers(&self, mut location: BlockLocation, n: usize) -> Result<Vec<BlockHeader>, BlockchainError> {
        let mut out = Vec::with_capacity(n);
        loop {
            if out.len() >= n {
                break;
            }
            out.push(self.read_block_header(location)?);
            let rec = self
                .branches
                .branch(location.branch)
                .ok_or_else(|| StorageError::Corrupt(format!("branch {} missing from table", location.branch)))?;
            if location.block_index == 0 {
                if rec.parent_branch == location.branch {
                    break;
                }
                location = BlockLocation { branch: rec.parent_branch, block_index: rec.parent_block_index };
            } else {
                location.block_index -= 1;
            }
        }
        Ok(out)
    }

    fn median_time_past(&self, parent_location: BlockLocation) -> Result<u32, BlockchainError> {
        let mut times: Vec<u32> = self.recent_headers(parent_location, 11)?.iter().map(|h| h.time).collect();
        times.sort_unstable();
        Ok(times[times.len() / 2])
    }

    fn location_height(&self, location: BlockLocation) -> Result<u32, BlockchainError> {
        let rec = self
            .branches
            .branch(location.branch)
            .ok_or_else(|| StorageError::Corrupt(format!("branch {} missing from table", location.branch)))?;
        Ok(rec.start_height + location.block_index)
    }

    /// The total chain work accumulated from genesis up to and including
    /// `location`, found by walking `location.branch`'s chain path and
    /// summing `work_for_bits` over every header on it (§3's work
    /// invariant). Used where a branch's own `.work` field — cumulative to
    /// that branch's current *tip* — would overcount or undercount a point
    /// that isn't the tip, such as a `ForksMidBranch` fork point.
    fn cumulative_work_to(&self, location: BlockLocation) -> Result<BigUint, BlockchainError> {
        let path = self.branches.chain_path(location.branch);
        let cut = path
            .iter()
            .position(|l| *l == location)
            .expect("location is on its own branch's chain path");
        let mut total = BigUint::zero();
        for loc in &path[..=cut] {
            let header = self.read_block_header(*loc)?;
            total.add_assign(&work::work_for_bits(header.bits));
        }
        Ok(total)
    }

    /// The `nBits` a block at `new_height`, atop `parent_header`, must
    /// carry: unchanged within a retarget interval, or the
    /// [`ChainParams::next_work_required`] recompute at an interval
    /// boundary (§6). Testnet's "allow minimum difficulty after a gap"
    /// rule is the one piece of `next_work_required`'s callers this
    /// crate does not special-case; mainnet parameters never exercise
    /// it (§10.7).
    fn expected_bits(&self, branch: u8, new_height: u32, parent_header: &BlockHeader) -> Result<u32, BlockchainError> {
        if new_height != 0 && new_height % self.params.difficulty_adjustment_interval == 0 {
            let rec = self
                .branches
                .branch(branch)
                .ok_or_else(|| StorageError::Corrupt(format!("branch {branch} missing from table")))?;
            Ok(self.params.next_work_required(rec.last_retarget_time, parent_header.bits, parent_header.time))
        } else {
            Ok(parent_header.bits)
        }
    }

    // ---- persistence of branch table / orphan ring --------------------

    fn persist_branch(&mut self, idx: u8) {
        let rec = self.branches.branch(idx).expect("branch exists").clone();
        self.storage.write(StoreKey::Branch(Some(idx)), encode_branch_record(&rec));
        self.storage.write(StoreKey::BranchWork(idx), rec.work.to_bytes_le().to_vec());
    }

    fn persist_sentinel(&mut self) {
        let sentinel = vec![self.branches.main_branch(), self.orphans.cursor()];
        self.storage.write(StoreKey::Branch(None), sentinel);
        for (slot, block) in self.orphans_snapshot() {
            match block {
                Some(bytes) => self.storage.write(StoreKey::Orphan(slot), bytes),
                None => self.storage.remove(StoreKey::Orphan(slot)),
            }
        }
    }

    fn orphans_snapshot(&self) -> Vec<(u8, Option<Vec<u8>>)> {
        self.orphans.slots_with_index().map(|(i, b)| (i, b.map(|b| b.encode()))).collect()
    }

    fn log(&self, level: LogLevel, message: &str) {
        self.deps.logger.log(level, message);
    }

    #[cfg(feature = "metrics")]
    fn record_metric_status(&self, status: &BlockProcessStatus) {
        let label = match status {
            BlockProcessStatus::Main => "main",
            BlockProcessStatus::MainWithOrphans(_) => "main_with_orphans",
            BlockProcessStatus::Side(_) => "side",
            BlockProcessStatus::Reorg(_) => "reorg",
            BlockProcessStatus::Orphan => "orphan",
            BlockProcessStatus::Duplicate => "duplicate",
            BlockProcessStatus::Bad(_) => "bad",
            BlockProcessStatus::BadTime => "bad_time",
            BlockProcessStatus::NoNew => "no_new",
        };
        metrics::counter!("ledgercore_blocks_processed_total", "status" => label).increment(1);
        metrics::gauge!("ledgercore_branch_count").set(self.branches.occupied_branches().count() as f64);
        metrics::gauge!("ledgercore_orphan_count").set(self.orphans.len() as f64);
    }

    #[cfg(not(feature = "metrics"))]
    fn record_metric_status(&self, _status: &BlockProcessStatus) {}

    #[cfg(feature = "metrics")]
    fn record_metric_orphan(&self) {
        metrics::counter!("ledgercore_blocks_processed_total", "status" => "orphan").increment(1);
        metrics::gauge!("ledgercore_orphan_count").set(self.orphans.len() as f64);
    }

    #[cfg(not(feature = "metrics"))]
    fn record_metric_orphan(&self) {}

    #[cfg(feature = "metrics")]
    fn record_metric_error(&self) {
        metrics::counter!("ledgercore_blocks_processed_total", "status" => "error").increment(1);
    }

    #[cfg(not(feature = "metrics"))]
    fn record_metric_error(&self) {}

    #[cfg(feature = "metrics")]
    fn record_metric_reorg(&self, depth: usize) {
        metrics::counter!("ledgercore_reorg_total").increment(1);
        metrics::gauge!("ledgercore_last_reorg_depth").set(depth as f64);
    }

    #[cfg(not(feature = "metrics"))]
    fn record_metric_reorg(&self, _depth: usize) {}
}

enum ValidateOutcome {
    Applied,
    Rejected(Err_),
}

// ---- byte encodings for the durable branch/tx/unspent records ---------
//
// None of these are part of the wire protocol (§6); they're this
// validator's own choice of persisted layout for data `ledgercore-common`
// defines but doesn't itself know how to serialise (it has no opinion on
// storage format, only on the `ChainStore` contract).

fn encode_location(loc: BlockLocation) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    out.push(loc.branch);
    out.extend_from_slice(&loc.block_index.to_le_bytes());
    out
}

fn decode_location(bytes: &[u8]) -> Result<BlockLocation, BlockchainError> {
    if bytes.len() < 5 {
        return Err(StorageError::Corrupt("blockHash record too short".into()).into());
    }
    Ok(BlockLocation {
        branch: bytes[0],
        block_index: u32::from_le_bytes(bytes[1..5].try_into().unwrap()),
    })
}

fn encode_branch_record(r: &BranchRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(25 + r.work.to_bytes_le().len());
    out.extend_from_slice(&r.num_blocks.to_le_bytes());
    out.extend_from_slice(&r.start_height.to_le_bytes());
    out.push(r.parent_branch);
    out.extend_from_slice(&r.parent_block_index.to_le_bytes());
    out.extend_from_slice(&r.last_retarget_time.to_le_bytes());
    out.extend_from_slice(&r.last_validation.to_le_bytes());
    let work = r.work.to_bytes_le();
    out.extend_from_slice(&(work.len() as u32).to_le_bytes());
    out.extend_from_slice(work);
    out
}

fn decode_branch_record(bytes: &[u8]) -> Result<BranchRecord, BlockchainError> {
    if bytes.len() < 25 {
        return Err(StorageError::Corrupt("branch record too short".into()).into());
    }
    let num_blocks = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let start_height = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    let parent_branch = bytes[8];
    let parent_block_index = u32::from_le_bytes(bytes[9..13].try_into().unwrap());
    let last_retarget_time = u32::from_le_bytes(bytes[13..17].try_into().unwrap());
    let last_validation = u32::from_le_bytes(bytes[17..21].try_into().unwrap());
    let work_len = u32::from_le_bytes(bytes[21..25].try_into().unwrap()) as usize;
    let work_bytes = bytes
        .get(25..25 + work_len)
        .ok_or_else(|| StorageError::Corrupt("branch record: truncated work bytes".into()))?;
    Ok(BranchRecord {
        num_blocks,
        start_height,
        parent_branch,
        parent_block_index,
        last_retarget_time,
        last_validation,
        work: BigUint::from_bytes_le(work_bytes.to_vec()),
    })
}

fn encode_tx_ref(r: &TxRef) -> Vec<u8> {
    let mut out = Vec::with_capacity(22);
    out.push(r.location.branch);
    out.extend_from_slice(&r.location.block_index.to_le_bytes());
    out.extend_from_slice(&r.outputs_offset.to_le_bytes());
    out.extend_from_slice(&r.outputs_length.to_le_bytes());
    out.push(r.is_coinbase as u8);
    out.extend_from_slice(&r.instance_count.to_le_bytes());
    out.extend_from_slice(&r.unspent_count.to_le_bytes());
    out
}

fn decode_tx_ref(bytes: &[u8]) -> Result<TxRef, BlockchainError> {
    if bytes.len() < 22 {
        return Err(StorageError::Corrupt("tx record too short".into()).into());
    }
    Ok(TxRef {
        location: BlockLocation { branch: bytes[0], block_index: u32::from_le_bytes(bytes[1..5].try_into().unwrap()) },
        outputs_offset: u32::from_le_bytes(bytes[5..9].try_into().unwrap()),
        outputs_length: u32::from_le_bytes(bytes[9..13].try_into().unwrap()),
        is_coinbase: bytes[13] != 0,
        instance_count: u32::from_le_bytes(bytes[14..18].try_into().unwrap()),
        unspent_count: u32::from_le_bytes(bytes[18..22].try_into().unwrap()),
    })
}

fn encode_unspent_ref(r: &UnspentRef) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.extend_from_slice(&r.position.to_le_bytes());
    out.extend_from_slice(&r.length.to_le_bytes());
    out
}

fn decode_sentinel(bytes: &[u8]) -> Result<(u8, u8), BlockchainError> {
    if bytes.len() < 2 {
        return Err(StorageError::Corrupt("sentinel record too short".into()).into());
    }
    Ok((bytes[0], bytes[1]))
}

/// Encodes a block for storage under `StoreKey::Block` as `hash ‖
/// serialised block` (§4.3), additionally tracking the byte offset and
/// length of each transaction's outputs region within the result — the
/// exact slice [`Validator::locate_output`] later reads back, so an
/// unspent output's position can be resolved without decoding the whole
/// block.
fn encode_stored_block(block: &Block, hash: &Hash256) -> (Vec<u8>, Vec<(u32, u32)>) {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(hash.as_le_bytes());
    block.header.encode_to(&mut bytes);
    varint::encode_var_int(block.transactions.len() as u64, &mut bytes);
    let mut regions = Vec::with_capacity(block.transactions.len());
    for tx in &block.transactions {
        regions.push(append_tx_tracking_outputs(tx, &mut bytes));
    }
    (bytes, regions)
}

fn append_tx_tracking_outputs(tx: &Transaction, out: &mut Vec<u8>) -> (u32, u32) {
    out.extend_from_slice(&tx.version.to_le_bytes());
    varint::encode_var_int(tx.input.len() as u64, out);
    for input in &tx.input {
        input.encode_to(out);
    }
    let outputs_offset = out.len() as u32;
    varint::encode_var_int(tx.output.len() as u64, out);
    for output in &tx.output {
        output.encode_to(out);
    }
    let outputs_length = out.len() as u32 - outputs_offset;
    out.extend_from_slice(&tx.lock_time.to_le_bytes());
    (outputs_offset, outputs_length)
}

/// The (offset, length) of each output's own encoding within the
/// var-int-prefixed outputs region a freshly-created `tx` record points
/// at — used once, right after [`Validator::store_block`], to seed the
/// `unspent` index for a newly confirmed transaction.
fn output_positions(tx: &Transaction) -> Vec<(u32, u32)> {
    let mut region = Vec::new();
    varint::encode_var_int(tx.output.len() as u64, &mut region);
    let mut out = Vec::with_capacity(tx.output.len());
    for output in &tx.output {
        let start = region.len() as u32;
        output.encode_to(&mut region);
        out.push((start, region.len() as u32 - start));
    }
    out
}

#[cfg(test)]
mod tests {
    use ledgercore_common::test_utils::FixedClock;
    use ledgercore_common::test_utils::ReferenceCrypto;

    use super::*;
    use crate::storage::MemoryChainStore;
    use crate::transaction::TxIn;

    struct NullSigHasher;
    impl SigHasher for NullSigHasher {
        fn sighash(&self, _tx: &Transaction, _input_index: usize, _sub_script: &[u8], _hash_type: u8) -> [u8; 32] {
            [0u8; 32]
        }
    }

    fn deps() -> Dependencies {
        Dependencies {
            crypto: Box::new(ReferenceCrypto),
            clock: Box::new(FixedClock(2_000_000_000)),
            logger: Box::new(ledgercore_common::TracingLogger),
            sighasher: Box::new(NullSigHasher),
        }
    }

    fn coinbase(height: u32, extra_nonce: u8) -> Transaction {
        Transaction {
            version: 1,
            input: vec![TxIn {
                previous_output: OutPoint::COINBASE,
                script_sig: vec![height as u8, extra_nonce],
                sequence: 0xFFFF_FFFF,
            }],
            output: vec![TxOut { value: 50_0000_0000, script_pubkey: vec![0xac] }],
            lock_time: 0,
        }
    }

    fn genesis_block() -> Block {
        let tx = coinbase(0, 0);
        let mut header = BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            time: 1_600_000_000,
            bits: 0x207fffff,
            nonce: 0,
        };
        header.merkle_root = crate::merkle::merkle_root(&[tx.txid(&ReferenceCrypto)], &ReferenceCrypto);
        Block { header, transactions: vec![tx] }
    }

    fn child_block(parent: &Block, time: u32, extra_nonce: u8) -> Block {
        let crypto = ReferenceCrypto;
        let tx = coinbase(1, extra_nonce);
        let mut header = BlockHeader {
            version: 1,
            prev_hash: parent.block_hash(&crypto),
            merkle_root: Hash256::ZERO,
            time,
            bits: 0x207fffff,
            nonce: 0,
        };
        header.merkle_root = crate::merkle::merkle_root(&[tx.txid(&crypto)], &crypto);
        Block { header, transactions: vec![tx] }
    }

    fn fresh_validator() -> Validator {
        let genesis = genesis_block();
        let params = ChainParams::mainnet(genesis);
        Validator::new(
            deps(),
            Box::new(MemoryChainStore::new()),
            params,
            ValidatorFlags::DISABLE_POW_CHECK,
        )
        .unwrap()
    }

    #[test]
    fn genesis_only_validator_has_empty_main_branch_of_one() {
        let validator = fresh_validator();
        assert_eq!(validator.branches.main_branch(), 0);
        assert_eq!(validator.branches.branch(0).unwrap().num_blocks, 1);
    }

    #[test]
    fn extending_the_main_chain_reports_main() {
        let mut validator = fresh_validator();
        let genesis = validator.params.genesis.clone();
        let block = child_block(&genesis, 1_600_000_700, 1);
        let status = validator.process_block(&block, 2_000_000_000).unwrap();
        assert_eq!(status, BlockProcessStatus::Main);
        assert_eq!(validator.branches.branch(0).unwrap().num_blocks, 2);
    }

    #[test]
    fn duplicate_block_is_rejected() {
        let mut validator = fresh_validator();
        let genesis = validator.params.genesis.clone();
        let block = child_block(&genesis, 1_600_000_700, 1);
        validator.process_block(&block, 2_000_000_000).unwrap();
        let status = validator.process_block(&block, 2_000_000_000).unwrap();
        assert_eq!(status, BlockProcessStatus::Duplicate);
    }

    #[test]
    fn block_with_unknown_parent_is_an_orphan() {
        let mut validator = fresh_validator();
        let genesis = validator.params.genesis.clone();
        let dangling_parent = child_block(&genesis, 1_600_000_700, 9);
        let orphan = child_block(&dangling_parent, 1_600_001_400, 10);
        let status = validator.process_block(&orphan, 2_000_000_000).unwrap();
        assert_eq!(status, BlockProcessStatus::Orphan);
        assert_eq!(validator.orphan_count(), 1);
    }

    #[test]
    fn attaching_the_missing_parent_drains_the_orphan() {
        let mut validator = fresh_validator();
        let genesis = validator.params.genesis.clone();
        let parent = child_block(&genesis, 1_600_000_700, 9);
        let orphan = child_block(&parent, 1_600_001_400, 10);
        validator.process_block(&orphan, 2_000_000_000).unwrap();

        let status = validator.process_block(&parent, 2_000_000_000).unwrap();
        match status {
            BlockProcessStatus::MainWithOrphans(attached) => assert_eq!(attached.len(), 1),
            other => panic!("expected MainWithOrphans, got {other:?}"),
        }
        assert_eq!(validator.orphan_count(), 0);
        assert_eq!(validator.branches.branch(0).unwrap().num_blocks, 3);
    }

    #[test]
    fn a_second_child_of_the_tip_is_a_side_branch() {
        let mut validator = fresh_validator();
        let genesis = validator.params.genesis.clone();
        let first = child_block(&genesis, 1_600_000_700, 1);
        validator.process_block(&first, 2_000_000_000).unwrap();

        let rival = child_block(&genesis, 1_600_000_800, 2);
        let status = validator.process_block(&rival, 2_000_000_000).unwrap();
        match status {
            BlockProcessStatus::Side(branch) => assert_ne!(branch, 0),
            other => panic!("expected Side, got {other:?}"),
        }
    }

    #[test]
    fn a_longer_side_branch_triggers_a_reorg() {
        let mut validator = fresh_validator();
        let genesis = validator.params.genesis.clone();

        let main_1 = child_block(&genesis, 1_600_000_700, 1);
        validator.process_block(&main_1, 2_000_000_000).unwrap();

        let side_1 = child_block(&genesis, 1_600_000_800, 2);
        validator.process_block(&side_1, 2_000_000_000).unwrap();
        let side_2 = child_block(&side_1, 1_600_001_500, 3);
        let status = validator.process_block(&side_2, 2_000_000_000).unwrap();

        match status {
            BlockProcessStatus::Reorg(desc) => assert_eq!(desc.new_chain_path.len(), 2),
            other => panic!("expected Reorg, got {other:?}"),
        }
        assert_ne!(validator.branches.main_branch(), 0);
        assert_eq!(validator.lookup_block_location(&side_2.block_hash(&ReferenceCrypto)).unwrap().is_some(), true);
    }

    #[test]
    fn reopening_a_validator_resumes_the_persisted_branch_table() {
        let genesis = genesis_block();
        let params = ChainParams::mainnet(genesis.clone());

        fn deps() -> Dependencies {
            Dependencies {
                crypto: Box::new(ReferenceCrypto),
                clock: Box::new(FixedClock(2_000_000_000)),
                logger: Box::new(ledgercore_common::TracingLogger),
                sighasher: Box::new(NullSigHasher),
            }
        }

        let storage = {
            let mut validator = Validator::new(
                deps(),
                Box::new(MemoryChainStore::new()),
                params.clone(),
                ValidatorFlags::DISABLE_POW_CHECK,
            )
            .unwrap();
            let block = child_block(&genesis, 1_600_000_700, 1);
            validator.process_block(&block, 2_000_000_000).unwrap();
            validator.into_storage()
        };

        let validator = Validator::new(deps(), storage, params, ValidatorFlags::DISABLE_POW_CHECK).unwrap();

        assert_eq!(validator.branches.main_branch(), 0);
        assert_eq!(validator.branches.branch(0).unwrap().num_blocks, 2);
        assert!(validator.lookup_block_location(&genesis.block_hash(&ReferenceCrypto)).unwrap().is_some());
    }
}
