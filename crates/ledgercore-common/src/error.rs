// SPDX-License-Identifier: MIT

//! Infrastructure-level errors from the injected [`crate::deps::ChainStore`]
//! contract. These always surface to callers of `process_block` as the
//! `ERROR` status (§7) — never as `BAD` — since they indicate a fault in
//! the local node, not in the block sender.

use core::fmt;

use crate::prelude::String;

/// An error raised by a `ChainStore` implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The backing medium (disk, mapped file, ...) reported a failure.
    Io(String),
    /// A key that every invariant guarantees should exist was missing.
    /// Surfacing this as an error rather than panicking lets a corrupted
    /// on-disk store be reported through the normal `ERROR` path instead
    /// of crashing the embedding process.
    MissingKey(String),
    /// The value stored under a key was the wrong shape to decode.
    Corrupt(String),
    /// `commit` was called with no staged writes, or `write_subsection`/
    /// `append` referenced an offset past the current value length.
    InvalidOperation(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io(msg) => write!(f, "storage I/O error: {msg}"),
            StorageError::MissingKey(key) => write!(f, "storage key missing: {key}"),
            StorageError::Corrupt(msg) => write!(f, "corrupt storage record: {msg}"),
            StorageError::InvalidOperation(msg) => write!(f, "invalid storage operation: {msg}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for StorageError {}
