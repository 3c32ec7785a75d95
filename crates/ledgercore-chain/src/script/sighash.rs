// SPDX-License-Identifier: MIT

//! The signature-hash callback (§4.2, §6's "Signature-hash protocol").
//!
//! Left as an injected capability rather than implemented here: the
//! exact byte layout hashed for a signature check is deeply
//! protocol-specific (and has grown new variants — BIP143, Taproot —
//! since the original scheme), so the interpreter only ever calls
//! through this trait. It lives in this crate rather than
//! `ledgercore-common` because it's parameterised over [`Transaction`],
//! a domain type the common crate doesn't know about.

use crate::transaction::Transaction;

/// Computes the 32-byte message hash a signature over transaction input
/// `input_index` is checked against, given the *sub-script* (the locking
/// script from the most recent `OP_CODESEPARATOR` onward, with the
/// signature itself removed — see [`super::interpreter`]) and the
/// signature's trailing hash-type byte.
pub trait SigHasher: Send + Sync {
    fn sighash(
        &self,
        tx: &Transaction,
        input_index: usize,
        sub_script: &[u8],
        hash_type: u8,
    ) -> [u8; 32];
}
