// SPDX-License-Identifier: MIT

//! The script interpreter (§4.2): a small stack machine that evaluates
//! one transaction input's unlocking script against its matching
//! previous output's locking script.

pub mod interpreter;
pub mod opcode;
pub mod parse;
pub mod sighash;
pub mod stack;

pub use interpreter::verify_script;
pub use sighash::SigHasher;

use ledgercore_common::prelude::String;

use opcode::is_disabled;
use opcode::small_int_value;
use opcode::OP_1;
use opcode::OP_16;
use opcode::OP_CHECKMULTISIG;
use opcode::OP_CHECKMULTISIGVERIFY;
use opcode::OP_CHECKSIG;
use opcode::OP_CHECKSIGVERIFY;
use parse::Instruction;
use parse::Instructions;

/// Every way evaluating a script can fail (§4.2's "Failure modes").
/// A script failure is never an infrastructure failure: it's folded into
/// [`crate::error::BlockValidationErrors::ScriptValidationError`] by the
/// caller, not propagated as a [`crate::error::BlockchainError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    /// An opcode needed more items on the stack than were present.
    StackUnderflow,
    /// Combined stack and alt-stack depth exceeded the reference client's
    /// limit of 1000 items.
    StackOverflow,
    /// A push exceeded the maximum stack item size (§4.2, 520 bytes).
    OversizedItem,
    /// `IF`/`NOTIF` without a matching `ENDIF`, or a stray `ELSE`/`ENDIF`.
    UnbalancedIf,
    /// `OP_VERIFY`, `OP_EQUALVERIFY`, `OP_NUMEQUALVERIFY`,
    /// `OP_CHECKSIGVERIFY`, or `OP_CHECKMULTISIGVERIFY` saw a falsy top of
    /// stack.
    VerifyFailed,
    /// `OP_RETURN` was executed.
    EarlyReturn,
    /// One of the opcodes permanently disabled in the reference client
    /// was encountered, executed or not.
    DisabledOpcode(u8),
    /// `OP_RESERVED` or `OP_VER` was executed.
    ReservedOpcode(u8),
    /// The script's non-push opcode count exceeded 201
    /// (`MAX_OPS_PER_SCRIPT`), the reference client's per-script op-count
    /// cap.
    TooManyOps,
    /// A numeric stack item exceeded [`stack::MAX_NUM_SIZE`], or a
    /// `CHECKMULTISIG` arity byte was out of range.
    InvalidNumber,
    /// A push opcode's declared length ran past the end of the script.
    InvalidPush,
    /// Catch-all for an opcode this interpreter doesn't implement.
    UnknownOpcode(u8),
    /// A human-readable detail for failures not otherwise distinguished.
    Other(String),
}

impl core::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ScriptError::StackUnderflow => write!(f, "stack underflow"),
            ScriptError::StackOverflow => write!(f, "stack exceeds maximum size"),
            ScriptError::OversizedItem => write!(f, "pushed item exceeds maximum size"),
            ScriptError::UnbalancedIf => write!(f, "unbalanced IF/ELSE/ENDIF"),
            ScriptError::VerifyFailed => write!(f, "VERIFY-style opcode saw a falsy value"),
            ScriptError::EarlyReturn => write!(f, "OP_RETURN"),
            ScriptError::DisabledOpcode(op) => write!(f, "disabled opcode {op:#04x}"),
            ScriptError::ReservedOpcode(op) => write!(f, "reserved opcode {op:#04x}"),
            ScriptError::TooManyOps => write!(f, "script exceeds the maximum opcode count"),
            ScriptError::InvalidNumber => write!(f, "invalid script number encoding"),
            ScriptError::InvalidPush => write!(f, "push operand runs past the end of the script"),
            ScriptError::UnknownOpcode(op) => write!(f, "unimplemented opcode {op:#04x}"),
            ScriptError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

/// Counts the signature operations a script contributes toward a block's
/// sig-op budget (§4.4): `CHECKSIG`/`CHECKSIGVERIFY` count as one each;
/// `CHECKMULTISIG`/`CHECKMULTISIGVERIFY` count as the small-integer
/// operand immediately preceding them (`OP_1`..`OP_16`), or as 20 if no
/// such operand precedes them. This is a purely static count over the
/// script's opcodes — it never executes anything, so it can't see the
/// actual `n` popped off the stack at run time.
pub fn count_sig_ops(script: &[u8]) -> u32 {
    let mut count = 0u32;
    let mut preceding_small_int: Option<u8> = None;
    for instr in Instructions::new(script) {
        let Ok(instr) = instr else { break };
        match instr {
            Instruction::Push(_) => preceding_small_int = None,
            Instruction::Op(op) => {
                match op {
                    OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
                    OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                        count += preceding_small_int.map(|n| n as u32).unwrap_or(20);
                    }
                    _ => {}
                }
                preceding_small_int = if (OP_1..=OP_16).contains(&op) {
                    small_int_value(op)
                } else {
                    None
                };
            }
        }
    }
    count
}

/// Whether `script` contains an opcode permanently disabled by the
/// reference client, used by basic-sanity checks that reject such
/// scripts before even attempting execution.
pub fn contains_disabled_opcode(script: &[u8]) -> bool {
    Instructions::new(script).any(|instr| matches!(instr, Ok(Instruction::Op(op)) if is_disabled(op)))
}
