// SPDX-License-Identifier: MIT

//! A consensus-core library for Bitcoin-style blockchains.
//!
//! This crate is a thin aggregator: `ledgercore-common` defines the
//! capability traits an embedder implements (`Crypto`, `Clock`,
//! `Logger`, `ChainStore`) and the small value types shared across the
//! workspace, and `ledgercore-chain` is where block/transaction
//! validation, branch tracking, and the derived indexes actually live.
//! Depending on `ledgercore` alone pulls in both under one name.
//!
//! ```ignore
//! use ledgercore::{ChainParams, Dependencies, Validator, ValidatorFlags};
//!
//! let deps = Dependencies { crypto, clock, logger, sighasher };
//! let mut validator = Validator::new(deps, storage, params, ValidatorFlags::NONE)?;
//! let status = validator.process_block(&block, network_time)?;
//! ```
//!
//! See `demos/` at the workspace root for a worked example.

pub use ledgercore_chain as chain;
pub use ledgercore_common as common;

pub use ledgercore_chain::Block;
pub use ledgercore_chain::BlockHeader;
pub use ledgercore_chain::BlockProcessResult;
pub use ledgercore_chain::BlockProcessStatus;
pub use ledgercore_chain::BlockValidationErrors;
pub use ledgercore_chain::BlockchainError;
pub use ledgercore_chain::ChainParams;
pub use ledgercore_chain::Dependencies;
pub use ledgercore_chain::MemoryChainStore;
pub use ledgercore_chain::OutPoint;
pub use ledgercore_chain::SigHasher;
pub use ledgercore_chain::Transaction;
pub use ledgercore_chain::TxIn;
pub use ledgercore_chain::TxOut;
pub use ledgercore_chain::Validator;
pub use ledgercore_chain::ValidatorFlags;

#[cfg(feature = "flat-chainstore")]
pub use ledgercore_chain::FlatChainStore;

pub use ledgercore_common::BlockLocation;
pub use ledgercore_common::ChainStore;
pub use ledgercore_common::Clock;
pub use ledgercore_common::Crypto;
pub use ledgercore_common::Hash256;
pub use ledgercore_common::LogLevel;
pub use ledgercore_common::Logger;
pub use ledgercore_common::StorageError;
pub use ledgercore_common::TracingLogger;
pub use ledgercore_common::Txid;
