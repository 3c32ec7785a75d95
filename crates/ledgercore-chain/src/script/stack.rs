// SPDX-License-Identifier: MIT

//! Script numbers: sign-magnitude little-endian, distinct from the
//! two's-complement integers the rest of the crate uses (§4.2).

use ledgercore_common::prelude::Vec;

use super::ScriptError;

/// The largest script number encoding the interpreter accepts as an
/// operand to an arithmetic opcode (Bitcoin Core's `nMaxNumSize`).
pub const MAX_NUM_SIZE: usize = 4;

/// Decodes a stack item as a sign-magnitude little-endian integer
/// (§4.2). `max_size` bounds how many bytes are acceptable (arithmetic
/// opcodes restrict this to [`MAX_NUM_SIZE`]; equality/threshold opcodes
/// that merely compare encoded forms don't call this at all).
pub fn decode_num(bytes: &[u8], max_size: usize) -> Result<i64, ScriptError> {
    if bytes.len() > max_size {
        return Err(ScriptError::InvalidNumber);
    }
    if bytes.is_empty() {
        return Ok(0);
    }
    let mut result: i64 = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        result |= (byte as i64) << (8 * i);
    }
    let top = bytes.len() - 1;
    if bytes[top] & 0x80 != 0 {
        result &= !(0x80i64 << (8 * top));
        result = -result;
    }
    Ok(result)
}

/// Encodes `n` as a minimal sign-magnitude little-endian byte string.
/// Zero encodes to the empty stack item.
pub fn encode_num(n: i64) -> Vec<u8> {
    if n == 0 {
        return Vec::new();
    }
    let negative = n < 0;
    let mut magnitude = n.unsigned_abs();
    let mut out = Vec::new();
    while magnitude > 0 {
        out.push((magnitude & 0xff) as u8);
        magnitude >>= 8;
    }
    if out.last().copied().unwrap_or(0) & 0x80 != 0 {
        out.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        *out.last_mut().unwrap() |= 0x80;
    }
    out
}

/// Whether `bytes` is the canonical minimal encoding of the number it
/// represents (BIP62's "minimal push"-style rule applied to numeric
/// encodings, enforced for opcode operands the reference client treats
/// strictly).
pub fn is_minimally_encoded(bytes: &[u8]) -> bool {
    let Some(&last) = bytes.last() else {
        return true;
    };
    // A trailing zero byte (ignoring the sign bit) is redundant unless
    // the second-to-last byte's high bit is set, in which case it's
    // needed to keep that byte from being misread as a sign.
    if last & 0x7f == 0 && (bytes.len() == 1 || bytes[bytes.len() - 2] & 0x80 == 0) {
        return false;
    }
    true
}

/// Decodes a numeric operand the strict way the interpreter requires:
/// the encoding must both fit within `max_size` bytes and be the
/// canonical minimal form (BIP62), unlike [`decode_num`] which only
/// checks size.
pub fn decode_script_num(bytes: &[u8], max_size: usize) -> Result<i64, ScriptError> {
    if !is_minimally_encoded(bytes) {
        return Err(ScriptError::InvalidNumber);
    }
    decode_num(bytes, max_size)
}

/// Whether a stack item evaluates truthy as a boolean condition (`IF`,
/// the final top-of-stack check): non-zero and not negative zero (§4.2).
pub fn is_truthy(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    for (i, &b) in bytes.iter().enumerate() {
        if b != 0 {
            // The final byte's sign bit doesn't count toward magnitude.
            if i == bytes.len() - 1 && b == 0x80 {
                return false;
            }
            return true;
        }
    }
    false
}
