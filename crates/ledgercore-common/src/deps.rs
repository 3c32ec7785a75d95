// SPDX-License-Identifier: MIT

//! The injected-dependency surface: cryptography, wall-clock time, logging,
//! and durable storage. None of these are implemented by this crate for
//! production use (cryptography and storage are explicitly out of scope,
//! §1); the one reference implementation this crate does ship
//! ([`crate::test_utils`]) is feature-gated behind `test-utils` and exists
//! only so this workspace's own tests don't need an embedding application.
//!
//! This mirrors cbitcoin's `CBDependencies.h`, which declared the same
//! surface as weak-linked C symbols resolved by whoever embeds the
//! library; here it's ordinary trait objects passed in at construction
//! (see `ledgercore_chain::validator::Dependencies`), per §9's design note
//! against global mutable state.

use core::fmt;

use crate::bigint::BigUint;
use crate::hash::Hash256;
use crate::prelude::Vec;
use crate::StorageError;

/// Cryptographic primitives the core needs but never implements itself.
///
/// A default-provided method is only ever a composition of the required
/// methods (`sha256d` = `SHA256(SHA256(_))`, `hash160` =
/// `RIPEMD160(SHA256(_))`) — composing them here, instead of leaving every
/// call site to do it, is what `CBDependencies.h`'s `CBSha256`/
/// `CBRipemd160` split forced each caller in cbitcoin to do by hand.
pub trait Crypto: Send + Sync {
    fn sha256(&self, data: &[u8]) -> [u8; 32];
    fn sha1(&self, data: &[u8]) -> [u8; 20];
    fn ripemd160(&self, data: &[u8]) -> [u8; 20];

    /// `HASH256` — double SHA-256, used for block/transaction identifiers.
    fn sha256d(&self, data: &[u8]) -> [u8; 32] {
        self.sha256(&self.sha256(data))
    }

    /// `HASH160` — RIPEMD160(SHA256(_)), used for P2PKH/P2SH scripts.
    fn hash160(&self, data: &[u8]) -> [u8; 20] {
        self.ripemd160(&self.sha256(data))
    }

    /// Verifies a DER-encoded ECDSA signature over `hash` against
    /// `pubkey` (compressed or uncompressed SEC1 encoding).
    fn ecdsa_verify(&self, signature: &[u8], hash: &[u8; 32], pubkey: &[u8]) -> bool;
}

/// Wall-clock access, injected so tests can fix "now" instead of reading
/// the system clock (used for the `BAD_TIME` check of §4.4).
pub trait Clock: Send + Sync {
    /// Unix time, in seconds.
    fn now_unix(&self) -> u64;
}

/// Severity levels for [`Logger`], mirroring the handful of levels the
/// teacher crate logs at through `tracing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A thin facade over a logging sink, so call sites don't have to assume a
/// global `tracing` subscriber is installed. The default implementation
/// (`TracingLogger`, always available) simply forwards to `tracing`.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Forwards to the `tracing` crate, which is this crate's own logging
/// dependency (mirroring the teacher, which logs through `tracing`
/// directly rather than a home-grown sink abstraction).
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Warn => tracing::warn!("{message}"),
            LogLevel::Error => tracing::error!("{message}"),
        }
    }
}

/// A block's location: which branch it's in, and its index within that
/// branch's segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockLocation {
    pub branch: u8,
    pub block_index: u32,
}

/// Durable metadata for one branch (§3's `Branch`), as stored under the
/// `branch`/`branchWork` indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRecord {
    pub num_blocks: u32,
    pub start_height: u32,
    pub parent_branch: u8,
    pub parent_block_index: u32,
    pub last_retarget_time: u32,
    pub last_validation: u32,
    pub work: BigUint,
}

/// A confirmed transaction's reference record, stored under the `tx`
/// index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRef {
    pub location: BlockLocation,
    pub outputs_offset: u32,
    pub outputs_length: u32,
    pub is_coinbase: bool,
    /// Number of distinct confirmed blocks, across all branches, whose
    /// transaction list contains a transaction with this hash.
    pub instance_count: u32,
    /// Number of this transaction's outputs that are currently unspent.
    pub unspent_count: u32,
}

/// The location of an unspent output's bytes inside its containing block,
/// stored under the `unspent` index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnspentRef {
    pub position: u32,
    pub length: u32,
}

/// A key into one of the seven indices of §4.3. `ChainStore`'s generic
/// verbs (`read`/`write`/...) are parameterised by this, rather than the
/// trait exposing nine near-identical methods per index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreKey {
    /// `blockHash` index: 20-byte prefix of a block hash → `BlockLocation`.
    BlockHash([u8; 20]),
    /// `block` index: location → hash ‖ serialised block.
    Block(BlockLocation),
    /// `branch` index: branch number, or `None` for the basic-validator
    /// sentinel record (`mainBranch`/`numBranches`/orphan cursor).
    Branch(Option<u8>),
    /// `branchWork` index: branch number → big-integer work bytes.
    BranchWork(u8),
    /// `orphan` index: ring slot number → serialised block.
    Orphan(u8),
    /// `tx` index: transaction hash → `TxRef`.
    Tx(Hash256),
    /// `unspent` index: (transaction hash, output index) → `UnspentRef`.
    Unspent(Hash256, u32),
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKey::BlockHash(prefix) => write!(f, "blockHash({:02x}{:02x}..)", prefix[0], prefix[1]),
            StoreKey::Block(loc) => write!(f, "block({},{})", loc.branch, loc.block_index),
            StoreKey::Branch(None) => write!(f, "branch(basic)"),
            StoreKey::Branch(Some(b)) => write!(f, "branch({b})"),
            StoreKey::BranchWork(b) => write!(f, "branchWork({b})"),
            StoreKey::Orphan(slot) => write!(f, "orphan({slot})"),
            StoreKey::Tx(hash) => write!(f, "tx({})", crate::hash::to_hex_be(hash)),
            StoreKey::Unspent(hash, vout) => write!(f, "unspent({},{vout})", crate::hash::to_hex_be(hash)),
        }
    }
}

/// The block-chain storage contract (§4.3): an atomically-committed
/// key/value store over the seven indices above, with a staged-write
/// model. No method here ever partially applies: mutating methods stage
/// their effect, and only `commit` makes it durable and visible to `read`.
///
/// Implementations must guarantee that `commit` is all-or-nothing — on
/// crash and restart, either every staged write from the last `commit`
/// call is visible or none are, never a mix (§4.3, §5).
pub trait ChainStore: Send + Sync {
    /// Reads the current value of `key`, or `None` if it has never been
    /// written (or has been `remove`d and committed).
    fn read(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StorageError>;

    /// The byte length of the value at `key`, without reading it.
    fn get_length(&self, key: &StoreKey) -> Result<Option<u32>, StorageError>;

    /// Stages a full overwrite of `key`'s value.
    fn write(&mut self, key: StoreKey, value: Vec<u8>);

    /// Stages an overwrite of `data.len()` bytes of `key`'s value starting
    /// at `offset`, leaving the rest of the value untouched. `offset +
    /// data.len()` must not exceed the value's current length.
    fn write_subsection(&mut self, key: StoreKey, offset: u32, data: Vec<u8>);

    /// Stages appending `data` to the end of `key`'s current value (or
    /// creating it, if absent).
    fn append(&mut self, key: StoreKey, data: Vec<u8>);

    /// Stages deleting `key` entirely.
    fn remove(&mut self, key: StoreKey);

    /// Stages renaming `old` to `new` without touching the stored bytes —
    /// the mechanism reorgs use to "move" a block or transaction between
    /// branches (§3's Lifecycles, §4.5 step 4).
    fn change_key(&mut self, old: StoreKey, new: StoreKey);

    /// Applies every staged write atomically. On success, subsequent
    /// `read`s observe the new state; on failure, no staged write is
    /// visible and the caller should treat this as infrastructure failure
    /// (`ERROR`, §7).
    fn commit(&mut self) -> Result<(), StorageError>;

    /// Discards every staged write since the last `commit`, without
    /// touching already-committed state.
    fn reset(&mut self);
}
