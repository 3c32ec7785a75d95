// SPDX-License-Identifier: MIT

//! Common types and the injected-dependency traits for `ledgercore`.
//!
//! This crate holds everything the consensus core needs that isn't itself
//! part of the Bitcoin domain model: the big-integer type used to accumulate
//! chain work, the var-int codec used by block/transaction serialisation,
//! small hash newtypes, and the capability traits (`Crypto`, `Clock`,
//! `Logger`, `ChainStore`) through which the core reaches cryptography,
//! wall-clock time, logging, and durable storage without ever depending on
//! a concrete implementation of any of them.

pub mod bigint;
pub mod deps;
pub mod error;
pub mod hash;
pub mod prelude;
pub mod varint;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use bigint::BigUint;
pub use deps::BlockLocation;
pub use deps::BranchRecord;
pub use deps::ChainStore;
pub use deps::Clock;
pub use deps::Crypto;
pub use deps::LogLevel;
pub use deps::Logger;
pub use deps::StoreKey;
pub use deps::TracingLogger;
pub use deps::TxRef;
pub use deps::UnspentRef;
pub use error::StorageError;
pub use hash::BlockHash;
pub use hash::Hash160;
pub use hash::Hash256;
pub use hash::Txid;

/// Maximum number of cached chain branches (`CB_MAX_BRANCH_CACHE` in the
/// original implementation). Extending past this requires evicting the
/// least-worked branch that isn't an ancestor of the current main tip.
pub const MAX_BRANCH_CACHE: usize = 5;

/// Size of the orphan ring buffer (`CB_MAX_ORPHAN_CACHE`).
pub const MAX_ORPHAN_CACHE: usize = 20;

/// Sentinel for `Branch::last_validation` meaning "only the header chain is
/// validated, no transaction has been checked yet" (`CB_NO_VALIDATION`).
pub const NO_VALIDATION: u32 = u32::MAX;

/// Number of confirmations a coinbase output must have before it can be
/// spent (`CB_COINBASE_MATURITY`).
pub const COINBASE_MATURITY: u32 = 100;

/// Maximum signature operations allowed in a single block (`CB_MAX_SIG_OPS`).
pub const MAX_SIG_OPS: u32 = 20_000;

/// Maximum permitted drift, in seconds, between a block's timestamp and the
/// network time observed by the node (`CB_BLOCK_ALLOWED_TIME_DRIFT`).
pub const ALLOWED_TIME_DRIFT: u64 = 7_200;

/// Maximum serialised block size in bytes.
pub const MAX_BLOCK_SIZE: usize = 1_024 * 1_024;

/// Maximum size of a single script stack item.
pub const MAX_SCRIPT_ITEM_SIZE: usize = 520;

/// A single coin in satoshis.
pub const COIN_VALUE: u64 = 100_000_000;

/// Maximum money that can ever exist, in satoshis.
pub const MAX_MONEY: u64 = 21_000_000 * COIN_VALUE;
