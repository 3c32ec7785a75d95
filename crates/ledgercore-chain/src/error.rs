// SPDX-License-Identifier: MIT

//! Consensus-rule errors and the `process_block` result type (§7, §9).
//!
//! No `thiserror` here, matching the teacher crate's own choice of
//! hand-rolled `Display`/`Error` impls over a derive macro for its
//! consensus error types.

use core::fmt;

use ledgercore_common::prelude::String;
use ledgercore_common::prelude::Vec;
use ledgercore_common::BlockLocation;
use ledgercore_common::StorageError;
use ledgercore_common::Txid;

/// A single transaction's rule violation, carrying which transaction
/// failed alongside why (mirrors the teacher's `TransactionError`, which
/// pairs a `txid` with a `BlockValidationErrors`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionError {
    pub txid: Txid,
    pub error: BlockValidationErrors,
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transaction {}: {}", self.txid, self.error)
    }
}

/// The specific consensus rule a block or one of its transactions
/// violated (§4.4, §7's `BAD` kind).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockValidationErrors {
    EmptyBlock,
    FirstTxIsNotCoinbase,
    MultipleCoinbases,
    InvalidCoinbase(String),
    BlockTooBig,
    InvalidMerkleRoot,
    InvalidProofOfWork,
    TargetOutOfBounds,
    BadTimestamp,
    InvalidOutput,
    NotEnoughMoney,
    TooManyCoins,
    TooManySigOps,
    UtxoAlreadySpent(Txid),
    ImmatureCoinbaseSpend,
    ScriptError,
    ScriptValidationError(String),
    BadCoinbaseOutValue,
}

impl fmt::Display for BlockValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockValidationErrors::EmptyBlock => write!(f, "block contains no transactions"),
            BlockValidationErrors::FirstTxIsNotCoinbase => {
                write!(f, "the first transaction in a block isn't a coinbase")
            }
            BlockValidationErrors::MultipleCoinbases => {
                write!(f, "more than one coinbase transaction in block")
            }
            BlockValidationErrors::InvalidCoinbase(msg) => write!(f, "invalid coinbase: {msg:?}"),
            BlockValidationErrors::BlockTooBig => write!(f, "block exceeds the maximum size"),
            BlockValidationErrors::InvalidMerkleRoot => {
                write!(f, "merkle root does not match the transaction list")
            }
            BlockValidationErrors::InvalidProofOfWork => {
                write!(f, "block hash does not meet its target")
            }
            BlockValidationErrors::TargetOutOfBounds => {
                write!(f, "target is outside the protocol-allowed range")
            }
            BlockValidationErrors::BadTimestamp => write!(f, "block timestamp out of range"),
            BlockValidationErrors::InvalidOutput => write!(f, "output has a non-positive value"),
            BlockValidationErrors::NotEnoughMoney => {
                write!(f, "transaction spends more than it is given")
            }
            BlockValidationErrors::TooManyCoins => write!(f, "output exceeds the money supply"),
            BlockValidationErrors::TooManySigOps => {
                write!(f, "block exceeds the signature operation budget")
            }
            BlockValidationErrors::UtxoAlreadySpent(txid) => {
                write!(f, "utxo {txid} already spent or never existed")
            }
            BlockValidationErrors::ImmatureCoinbaseSpend => {
                write!(f, "spend of a coinbase output before maturity")
            }
            BlockValidationErrors::ScriptError => write!(f, "script evaluation failed"),
            BlockValidationErrors::ScriptValidationError(msg) => {
                write!(f, "script evaluation failed: {msg}")
            }
            BlockValidationErrors::BadCoinbaseOutValue => {
                write!(f, "coinbase pays out more than subsidy plus fees")
            }
        }
    }
}

/// Top-level error from the validator façade: either a rule violation
/// (`Invalid`, surfaced as `BAD`/`BAD_TIME`) or an infrastructure fault
/// (`Storage`, surfaced as `ERROR`). §7 requires these stay
/// distinguishable to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockchainError {
    Invalid(BlockValidationErrors),
    Transaction(TransactionError),
    Storage(StorageError),
}

impl From<BlockValidationErrors> for BlockchainError {
    fn from(e: BlockValidationErrors) -> Self {
        BlockchainError::Invalid(e)
    }
}

impl From<TransactionError> for BlockchainError {
    fn from(e: TransactionError) -> Self {
        BlockchainError::Transaction(e)
    }
}

impl From<StorageError> for BlockchainError {
    fn from(e: StorageError) -> Self {
        BlockchainError::Storage(e)
    }
}

impl fmt::Display for BlockchainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockchainError::Invalid(e) => write!(f, "{e}"),
            BlockchainError::Transaction(e) => write!(f, "{e}"),
            BlockchainError::Storage(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for BlockchainError {}

/// Whether a `BlockchainError` represents a sender-fault rule violation
/// (`BAD`) or a local infrastructure fault (`ERROR`) — the distinction
/// §7 calls mandatory.
impl BlockchainError {
    pub fn is_infrastructure_failure(&self) -> bool {
        matches!(self, BlockchainError::Storage(_))
    }
}

/// A chain path: the sequence of (branch, block index) locations from a
/// branch tip back to the genesis branch, used to describe a reorg (§4.5
/// step 1, §9's note on sum-type error returns).
pub type ChainPath = Vec<BlockLocation>;

/// The orphans that were drained and successfully attached in the same
/// `process_block` call that attached their parent (§4.5's "drain the
/// orphan ring").
pub type AttachedOrphans = Vec<ledgercore_common::Hash256>;

/// Describes a completed reorganisation: the new chain's path from the
/// fork point to its tip, and the location at which the two chains
/// diverged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgDescription {
    pub new_chain_path: ChainPath,
    pub fork_point: BlockLocation,
}

/// The successful outcomes `process_block` can report (§7's table),
/// each carrying the data a caller needs instead of relying on
/// out-parameters (§9's design note).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockProcessStatus {
    /// Extended the main branch by exactly this block.
    Main,
    /// Extended the main branch by this block, then drained these
    /// previously-orphaned blocks onto it as well.
    MainWithOrphans(AttachedOrphans),
    /// Extended or created a non-main branch; carries its index.
    Side(u8),
    /// The main branch changed as a result of this block.
    Reorg(ReorgDescription),
    /// Parent unknown; buffered in the orphan ring.
    Orphan,
    /// This exact block is already known.
    Duplicate,
    /// A rule violation (§4.4-§4.6); see the error for which rule.
    Bad(BlockValidationErrors),
    /// Timestamp outside the acceptable window (§4.4's timestamp check).
    BadTime,
    /// The branch table was full and no branch was evictable (§4.5
    /// case 2).
    NoNew,
}

/// The result of one `process_block` call. Only infrastructure failure
/// is a `Result::Err`; every rule-level outcome, success or failure, is
/// an `Ok` variant of [`BlockProcessStatus`] (§7, §9).
pub type BlockProcessResult = Result<BlockProcessStatus, BlockchainError>;
