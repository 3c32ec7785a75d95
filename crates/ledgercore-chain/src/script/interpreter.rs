// SPDX-License-Identifier: MIT

//! The script stack machine (§4.2): evaluates an unlocking script
//! followed by a locking script against one transaction input.

use ledgercore_common::prelude::Vec;
use ledgercore_common::Crypto;
use ledgercore_common::MAX_SCRIPT_ITEM_SIZE;

use super::opcode::*;
use super::parse::Instruction;
use super::parse::Instructions;
use super::sighash::SigHasher;
use super::stack::decode_script_num as decode_num;
use super::stack::encode_num;
use super::stack::is_truthy;
use super::stack::MAX_NUM_SIZE;
use super::ScriptError;
use crate::transaction::Transaction;

/// The reference client's cap on non-push opcodes per script
/// (`MAX_OPS_PER_SCRIPT`), distinct from the block-wide sig-op budget
/// of §4.4.
const MAX_OPS_PER_SCRIPT: u32 = 201;

/// Maximum stack depth the reference client allows during execution.
const MAX_STACK_SIZE: usize = 1000;

/// Evaluates `unlocking ‖ locking` against one transaction input and
/// reports whether the script pair succeeds (§4.2).
pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    crypto: &dyn Crypto,
    sighasher: &dyn SigHasher,
    tx: &Transaction,
    input_index: usize,
) -> Result<bool, ScriptError> {
    let mut stack = Vec::new();
    let mut alt_stack = Vec::new();
    execute(script_sig, &mut stack, &mut alt_stack, crypto, sighasher, tx, input_index)?;
    execute(script_pubkey, &mut stack, &mut alt_stack, crypto, sighasher, tx, input_index)?;
    match stack.last() {
        Some(top) => Ok(is_truthy(top)),
        None => Ok(false),
    }
}

/// Executes one script against a shared stack/alt-stack. Returns `Ok(())`
/// if the script ran to completion without a rule violation; the caller
/// inspects the stack afterward to decide overall success.
fn execute(
    script: &[u8],
    stack: &mut Vec<Vec<u8>>,
    alt_stack: &mut Vec<Vec<u8>>,
    crypto: &dyn Crypto,
    sighasher: &dyn SigHasher,
    tx: &Transaction,
    input_index: usize,
) -> Result<(), ScriptError> {
    let mut vf_exec: Vec<bool> = Vec::new();
    let mut op_count: u32 = 0;
    let mut last_codeseparator: usize = 0;

    let mut instructions = Instructions::new(script);
    while let Some(instr) = instructions.next() {
        let instr = instr?;
        let executing = vf_exec.iter().all(|&b| b);

        match instr {
            Instruction::Push(data) => {
                if data.len() > MAX_SCRIPT_ITEM_SIZE {
                    return Err(ScriptError::OversizedItem);
                }
                if executing {
                    stack.push(data.to_vec());
                    check_stack_size(stack, alt_stack)?;
                }
            }
            Instruction::Op(op) => {
                if op > OP_16 {
                    op_count += 1;
                    if op_count > MAX_OPS_PER_SCRIPT {
                        return Err(ScriptError::TooManyOps);
                    }
                }
                if is_disabled(op) {
                    return Err(ScriptError::DisabledOpcode(op));
                }

                match op {
                    OP_IF | OP_NOTIF => {
                        let mut value = false;
                        if executing {
                            let top = pop(stack)?;
                            value = is_truthy(&top);
                            if op == OP_NOTIF {
                                value = !value;
                            }
                        }
                        vf_exec.push(value);
                        continue;
                    }
                    OP_ELSE => {
                        let top = vf_exec.last_mut().ok_or(ScriptError::UnbalancedIf)?;
                        *top = !*top;
                        continue;
                    }
                    OP_ENDIF => {
                        vf_exec.pop().ok_or(ScriptError::UnbalancedIf)?;
                        continue;
                    }
                    _ => {}
                }

                if !executing {
                    continue;
                }

                match op {
                    OP_0 => stack.push(Vec::new()),
                    OP_1NEGATE => stack.push(encode_num(-1)),
                    op if small_int_value(op).is_some() => {
                        stack.push(encode_num(small_int_value(op).unwrap() as i64))
                    }
                    OP_NOP | OP_NOP1..=OP_NOP10 => {}
                    OP_RESERVED | OP_VER => return Err(ScriptError::ReservedOpcode(op)),
                    OP_VERIFY => {
                        let top = pop(stack)?;
                        if !is_truthy(&top) {
                            return Err(ScriptError::VerifyFailed);
                        }
                    }
                    OP_RETURN => return Err(ScriptError::EarlyReturn),
                    OP_TOALTSTACK => {
                        let top = pop(stack)?;
                        alt_stack.push(top);
                    }
                    OP_FROMALTSTACK => {
                        let top = alt_stack.pop().ok_or(ScriptError::StackUnderflow)?;
                        stack.push(top);
                    }
                    OP_DEPTH => stack.push(encode_num(stack.len() as i64)),
                    OP_DROP => {
                        pop(stack)?;
                    }
                    OP_2DROP => {
                        pop(stack)?;
                        pop(stack)?;
                    }
                    OP_DUP => {
                        let top = top(stack)?.clone();
                        stack.push(top);
                    }
                    OP_2DUP => {
                        require_depth(stack, 2)?;
                        let len = stack.len();
                        let a = stack[len - 2].clone();
                        let b = stack[len - 1].clone();
                        stack.push(a);
                        stack.push(b);
                    }
                    OP_3DUP => {
                        require_depth(stack, 3)?;
                        let len = stack.len();
                        let a = stack[len - 3].clone();
                        let b = stack[len - 2].clone();
                        let c = stack[len - 1].clone();
                        stack.push(a);
                        stack.push(b);
                        stack.push(c);
                    }
                    OP_NIP => {
                        require_depth(stack, 2)?;
                        let len = stack.len();
                        stack.remove(len - 2);
                    }
                    OP_2OVER => {
                        require_depth(stack, 4)?;
                        let len = stack.len();
                        stack.push(stack[len - 4].clone());
                        stack.push(stack[len - 3].clone());
                    }
                    OP_2ROT => {
                        require_depth(stack, 6)?;
                        let a = stack.remove(stack.len() - 6);
                        let b = stack.remove(stack.len() - 5);
                        stack.push(a);
                        stack.push(b);
                    }
                    OP_2SWAP => {
                        require_depth(stack, 4)?;
                        let len = stack.len();
                        stack.swap(len - 4, len - 2);
                        stack.swap(len - 3, len - 1);
                    }
                    OP_OVER => {
                        require_depth(stack, 2)?;
                        let len = stack.len();
                        stack.push(stack[len - 2].clone());
                    }
                    OP_SWAP => {
                        require_depth(stack, 2)?;
                        let len = stack.len();
                        stack.swap(len - 1, len - 2);
                    }
                    OP_TUCK => {
                        require_depth(stack, 2)?;
                        let len = stack.len();
                        let top = stack[len - 1].clone();
                        stack.insert(len - 2, top);
                    }
                    OP_IFDUP => {
                        let t = top(stack)?.clone();
                        if is_truthy(&t) {
                            stack.push(t);
                        }
                    }
                    OP_PICK | OP_ROLL => {
                        let n = decode_num(&pop(stack)?, MAX_NUM_SIZE)?;
                        if n < 0 || n as usize >= stack.len() {
                            return Err(ScriptError::StackUnderflow);
                        }
                        let idx = stack.len() - 1 - n as usize;
                        let value = stack[idx].clone();
                        if op == OP_ROLL {
                            stack.remove(idx);
                        }
                        stack.push(value);
                    }
                    OP_ROT => {
                        require_depth(stack, 3)?;
                        let len = stack.len();
                        stack.swap(len - 3, len - 2);
                        stack.swap(len - 2, len - 1);
                    }
                    OP_SIZE => {
                        let t = top(stack)?;
                        stack.push(encode_num(t.len() as i64));
                    }
                    OP_EQUAL | OP_EQUALVERIFY => {
                        let b = pop(stack)?;
                        let a = pop(stack)?;
                        let eq = a == b;
                        if op == OP_EQUALVERIFY {
                            if !eq {
                                return Err(ScriptError::VerifyFailed);
                            }
                        } else {
                            stack.push(encode_num(eq as i64));
                        }
                    }
                    OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                        let n = decode_num(&pop(stack)?, MAX_NUM_SIZE)?;
                        let result = match op {
                            OP_1ADD => n + 1,
                            OP_1SUB => n - 1,
                            OP_NEGATE => -n,
                            OP_ABS => n.abs(),
                            OP_NOT => (n == 0) as i64,
                            OP_0NOTEQUAL => (n != 0) as i64,
                            _ => unreachable!(),
                        };
                        stack.push(encode_num(result));
                    }
                    OP_ADD
                    | OP_SUB
                    | OP_BOOLAND
                    | OP_BOOLOR
                    | OP_NUMEQUAL
                    | OP_NUMEQUALVERIFY
                    | OP_NUMNOTEQUAL
                    | OP_LESSTHAN
                    | OP_GREATERTHAN
                    | OP_LESSTHANOREQUAL
                    | OP_GREATERTHANOREQUAL
                    | OP_MIN
                    | OP_MAX => {
                        let b = decode_num(&pop(stack)?, MAX_NUM_SIZE)?;
                        let a = decode_num(&pop(stack)?, MAX_NUM_SIZE)?;
                        let result = match op {
                            OP_ADD => a + b,
                            OP_SUB => a - b,
                            OP_BOOLAND => ((a != 0) && (b != 0)) as i64,
                            OP_BOOLOR => ((a != 0) || (b != 0)) as i64,
                            OP_NUMEQUAL | OP_NUMEQUALVERIFY => (a == b) as i64,
                            OP_NUMNOTEQUAL => (a != b) as i64,
                            OP_LESSTHAN => (a < b) as i64,
                            OP_GREATERTHAN => (a > b) as i64,
                            OP_LESSTHANOREQUAL => (a <= b) as i64,
                            OP_GREATERTHANOREQUAL => (a >= b) as i64,
                            OP_MIN => a.min(b),
                            OP_MAX => a.max(b),
                            _ => unreachable!(),
                        };
                        if op == OP_NUMEQUALVERIFY {
                            if result == 0 {
                                return Err(ScriptError::VerifyFailed);
                            }
                        } else {
                            stack.push(encode_num(result));
                        }
                    }
                    OP_WITHIN => {
                        let max = decode_num(&pop(stack)?, MAX_NUM_SIZE)?;
                        let min = decode_num(&pop(stack)?, MAX_NUM_SIZE)?;
                        let x = decode_num(&pop(stack)?, MAX_NUM_SIZE)?;
                        stack.push(encode_num((x >= min && x < max) as i64));
                    }
                    OP_RIPEMD160 => {
                        let data = pop(stack)?;
                        stack.push(crypto.ripemd160(&data).to_vec());
                    }
                    OP_SHA1 => {
                        let data = pop(stack)?;
                        stack.push(crypto.sha1(&data).to_vec());
                    }
                    OP_SHA256 => {
                        let data = pop(stack)?;
                        stack.push(crypto.sha256(&data).to_vec());
                    }
                    OP_HASH160 => {
                        let data = pop(stack)?;
                        stack.push(crypto.hash160(&data).to_vec());
                    }
                    OP_HASH256 => {
                        let data = pop(stack)?;
                        stack.push(crypto.sha256d(&data).to_vec());
                    }
                    OP_CODESEPARATOR => {
                        last_codeseparator = script.len() - instructions.remaining();
                    }
                    OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                        let pubkey = pop(stack)?;
                        let sig = pop(stack)?;
                        let ok = check_sig(
                            &sig,
                            &pubkey,
                            script,
                            last_codeseparator,
                            crypto,
                            sighasher,
                            tx,
                            input_index,
                        );
                        if op == OP_CHECKSIGVERIFY {
                            if !ok {
                                return Err(ScriptError::VerifyFailed);
                            }
                        } else {
                            stack.push(encode_num(ok as i64));
                        }
                    }
                    OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                        let ok = check_multisig(
                            stack,
                            script,
                            last_codeseparator,
                            crypto,
                            sighasher,
                            tx,
                            input_index,
                        )?;
                        if op == OP_CHECKMULTISIGVERIFY {
                            if !ok {
                                return Err(ScriptError::VerifyFailed);
                            }
                        } else {
                            stack.push(encode_num(ok as i64));
                        }
                    }
                    _ => return Err(ScriptError::UnknownOpcode(op)),
                }
                check_stack_size(stack, alt_stack)?;
            }
        }
    }

    if !vf_exec.is_empty() {
        return Err(ScriptError::UnbalancedIf);
    }
    Ok(())
}

fn pop(stack: &mut Vec<Vec<u8>>) -> Result<Vec<u8>, ScriptError> {
    stack.pop().ok_or(ScriptError::StackUnderflow)
}

fn top(stack: &[Vec<u8>]) -> Result<&Vec<u8>, ScriptError> {
    stack.last().ok_or(ScriptError::StackUnderflow)
}

fn require_depth(stack: &[Vec<u8>], depth: usize) -> Result<(), ScriptError> {
    if stack.len() < depth {
        Err(ScriptError::StackUnderflow)
    } else {
        Ok(())
    }
}

fn check_stack_size(stack: &[Vec<u8>], alt_stack: &[Vec<u8>]) -> Result<(), ScriptError> {
    if stack.len() + alt_stack.len() > MAX_STACK_SIZE {
        Err(ScriptError::StackOverflow)
    } else {
        Ok(())
    }
}

/// Removes every occurrence of `signature` from `script`, matching whole
/// push instructions by exact byte content (Bitcoin Core's
/// `CScript::FindAndDelete`, not a raw substring search — §9's note that
/// this should "match the Bitcoin reference rule" rather than naive byte
/// matching).
fn find_and_delete(script: &[u8], signature: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(script.len());
    let mut instructions = Instructions::new(script);
    let mut prev_end = 0usize;
    while let Some(instr) = instructions.next() {
        let end = script.len() - instructions.remaining();
        let Ok(instr) = instr else { break };
        let is_match = matches!(instr, Instruction::Push(data) if data == signature);
        if !is_match {
            out.extend_from_slice(&script[prev_end..end]);
        }
        prev_end = end;
    }
    out.extend_from_slice(&script[prev_end..]);
    out
}

#[allow(clippy::too_many_arguments)]
fn check_sig(
    sig: &[u8],
    pubkey: &[u8],
    script: &[u8],
    last_codeseparator: usize,
    crypto: &dyn Crypto,
    sighasher: &dyn SigHasher,
    tx: &Transaction,
    input_index: usize,
) -> bool {
    let Some((&hash_type, raw_sig)) = sig.split_last() else {
        return false;
    };
    let sub_script = find_and_delete(&script[last_codeseparator..], sig);
    let digest = sighasher.sighash(tx, input_index, &sub_script, hash_type);
    crypto.ecdsa_verify(raw_sig, &digest, pubkey)
}

#[allow(clippy::too_many_arguments)]
fn check_multisig(
    stack: &mut Vec<Vec<u8>>,
    script: &[u8],
    last_codeseparator: usize,
    crypto: &dyn Crypto,
    sighasher: &dyn SigHasher,
    tx: &Transaction,
    input_index: usize,
) -> Result<bool, ScriptError> {
    let pubkey_count = decode_num(&pop(stack)?, MAX_NUM_SIZE)?;
    if pubkey_count < 0 || pubkey_count > 20 {
        return Err(ScriptError::InvalidNumber);
    }
    let mut pubkeys = Vec::with_capacity(pubkey_count as usize);
    for _ in 0..pubkey_count {
        pubkeys.push(pop(stack)?);
    }
    let sig_count = decode_num(&pop(stack)?, MAX_NUM_SIZE)?;
    if sig_count < 0 || sig_count > pubkey_count {
        return Err(ScriptError::InvalidNumber);
    }
    let mut sigs = Vec::with_capacity(sig_count as usize);
    for _ in 0..sig_count {
        sigs.push(pop(stack)?);
    }
    // The historical off-by-one: CHECKMULTISIG always consumes one item
    // beyond its documented arity (§4.2).
    pop(stack)?;

    // Signatures must match pubkeys in order, each pubkey usable by at
    // most one signature (the reference client's two-pointer algorithm).
    let mut sig_iter = sigs.iter().rev();
    let mut current_sig = sig_iter.next();
    let mut matched = 0;
    for pubkey in pubkeys.iter().rev() {
        let Some(sig) = current_sig else { break };
        if check_sig(sig, pubkey, script, last_codeseparator, crypto, sighasher, tx, input_index) {
            matched += 1;
            current_sig = sig_iter.next();
        }
    }
    Ok(matched == sigs.len() && current_sig.is_none())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use ledgercore_common::Txid;

    use super::*;
    use crate::transaction::OutPoint;
    use crate::transaction::TxIn;
    use crate::transaction::TxOut;

    /// A `Crypto` double whose only honest method is `ecdsa_verify`,
    /// defined so a "signature" is just its matching pubkey's bytes plus
    /// a trailing hash-type byte — enough to drive the interpreter's
    /// control flow without a real secp256k1 keypair.
    struct FakeCrypto;

    impl Crypto for FakeCrypto {
        fn sha256(&self, data: &[u8]) -> [u8; 32] {
            let mut out = [0u8; 32];
            for (i, &b) in data.iter().enumerate() {
                out[i % 32] ^= b;
            }
            out
        }
        fn sha1(&self, data: &[u8]) -> [u8; 20] {
            let mut out = [0u8; 20];
            for (i, &b) in data.iter().enumerate() {
                out[i % 20] ^= b;
            }
            out
        }
        fn ripemd160(&self, data: &[u8]) -> [u8; 20] {
            self.sha1(data)
        }
        fn ecdsa_verify(&self, signature: &[u8], _hash: &[u8; 32], pubkey: &[u8]) -> bool {
            signature == pubkey
        }
    }

    #[derive(Default)]
    struct FakeSigHasher {
        last_sub_script: RefCell<Vec<u8>>,
    }

    impl SigHasher for FakeSigHasher {
        fn sighash(&self, _tx: &Transaction, _input_index: usize, sub_script: &[u8], _hash_type: u8) -> [u8; 32] {
            *self.last_sub_script.borrow_mut() = sub_script.to_vec();
            [0u8; 32]
        }
    }

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid([1u8; 32]),
                    index: 0,
                },
                script_sig: Vec::new(),
                sequence: 0xFFFF_FFFF,
            }],
            output: vec![TxOut {
                value: 1,
                script_pubkey: Vec::new(),
            }],
            lock_time: 0,
        }
    }

    /// Builds a direct-push instruction for up to 75 bytes of data.
    fn push(data: &[u8]) -> Vec<u8> {
        assert!(data.len() <= 0x4b);
        let mut out = vec![data.len() as u8];
        out.extend_from_slice(data);
        out
    }

    /// A "signature" the `FakeCrypto` above accepts against `pubkey`.
    fn fake_sig(pubkey: &[u8], hash_type: u8) -> Vec<u8> {
        let mut sig = pubkey.to_vec();
        sig.push(hash_type);
        sig
    }

    #[test]
    fn multisig_requires_the_off_by_one_dummy_item() {
        let pubkey = [0xaau8; 33];
        let sig = fake_sig(&pubkey, 0x01);
        let mut script_pubkey = Vec::new();
        script_pubkey.extend(push(&sig));
        script_pubkey.push(OP_1); // m = 1
        script_pubkey.extend(push(&pubkey));
        script_pubkey.push(OP_1); // n = 1
        script_pubkey.push(OP_CHECKMULTISIG);

        // Without the extra dummy item beneath the signatures, the
        // unconditional extra pop underflows the stack.
        let result = verify_script(&[], &script_pubkey, &FakeCrypto, &FakeSigHasher::default(), &sample_tx(), 0);
        assert_eq!(result, Err(ScriptError::StackUnderflow));

        // With the dummy item (conventionally OP_0) pushed first, the
        // same multisig succeeds.
        let mut with_dummy = push(&[]);
        with_dummy.extend(script_pubkey);
        let result = verify_script(&[], &with_dummy, &FakeCrypto, &FakeSigHasher::default(), &sample_tx(), 0);
        assert_eq!(result, Ok(true));
    }

    #[test]
    fn codeseparator_limits_the_signed_subscript() {
        let pubkey = [0xbbu8; 33];
        let sig = fake_sig(&pubkey, 0x01);
        let script_sig = push(&sig);
        let mut script_pubkey = vec![OP_CODESEPARATOR];
        script_pubkey.extend(push(&pubkey));
        script_pubkey.push(OP_CHECKSIG);

        let sighasher = FakeSigHasher::default();
        let result = verify_script(&script_sig, &script_pubkey, &FakeCrypto, &sighasher, &sample_tx(), 0);
        assert_eq!(result, Ok(true));
        // The sub-script handed to the sig-hasher starts after the
        // OP_CODESEPARATOR byte, not from the top of the script.
        assert_eq!(*sighasher.last_sub_script.borrow(), script_pubkey[1..].to_vec());
    }

    #[test]
    fn op_return_fails_unconditionally() {
        let result = verify_script(&[], &[OP_RETURN], &FakeCrypto, &FakeSigHasher::default(), &sample_tx(), 0);
        assert_eq!(result, Err(ScriptError::EarlyReturn));
    }

    #[test]
    fn minimal_push_encoding_is_enforced_for_arithmetic_operands() {
        // 0x01 0x00 is a non-minimal encoding of 1 (the trailing zero is
        // redundant), so OP_1ADD must reject it even though decode_num
        // alone would happily read it as 1.
        let script = [0x02, 0x01, 0x00, OP_1ADD];
        let result = execute(&script, &mut Vec::new(), &mut Vec::new(), &FakeCrypto, &FakeSigHasher::default(), &sample_tx(), 0);
        assert_eq!(result, Err(ScriptError::InvalidNumber));
    }

    #[test]
    fn negative_zero_top_of_stack_evaluates_falsy() {
        // Push the single byte 0x80: negative zero, and nothing else.
        let script = [0x01, 0x80];
        let result = verify_script(&[], &script, &FakeCrypto, &FakeSigHasher::default(), &sample_tx(), 0);
        assert_eq!(result, Ok(false));
    }

    #[test]
    fn disabled_opcode_fails_even_inside_a_not_taken_branch() {
        let script = [OP_0, OP_IF, OP_CAT, OP_ENDIF];
        let result = verify_script(&[], &script, &FakeCrypto, &FakeSigHasher::default(), &sample_tx(), 0);
        assert_eq!(result, Err(ScriptError::DisabledOpcode(OP_CAT)));
    }

    #[test]
    fn unbalanced_if_is_rejected() {
        let script = [OP_1, OP_IF];
        let result = verify_script(&[], &script, &FakeCrypto, &FakeSigHasher::default(), &sample_tx(), 0);
        assert_eq!(result, Err(ScriptError::UnbalancedIf));
    }
}
