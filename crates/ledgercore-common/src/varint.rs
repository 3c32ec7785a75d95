// SPDX-License-Identifier: MIT

//! The variable-length integer encoding used inside block and transaction
//! serialisation (§6). This is distinct from, and simpler than, the
//! peer-to-peer message codec, which stays out of scope: every block/
//! transaction byte-exactness requirement (hashing, Merkle roots) bottoms
//! out in this encoding, so it lives in the core rather than behind the
//! injected dependency surface.

use crate::prelude::Vec;

/// Number of bytes `encode_var_int` will write for `v`.
pub fn encoded_len(v: u64) -> usize {
    if v < 0xFD {
        1
    } else if v <= 0xFFFF {
        3
    } else if v <= 0xFFFF_FFFF {
        5
    } else {
        9
    }
}

/// Appends the var-int encoding of `v` to `out`.
pub fn encode_var_int(v: u64, out: &mut Vec<u8>) {
    if v < 0xFD {
        out.push(v as u8);
    } else if v <= 0xFFFF {
        out.push(0xFD);
        out.extend_from_slice(&(v as u16).to_le_bytes());
    } else if v <= 0xFFFF_FFFF {
        out.push(0xFE);
        out.extend_from_slice(&(v as u32).to_le_bytes());
    } else {
        out.push(0xFF);
        out.extend_from_slice(&v.to_le_bytes());
    }
}

/// Decodes a var-int from the front of `data`, returning the value and the
/// number of bytes consumed.
pub fn decode_var_int(data: &[u8]) -> Option<(u64, usize)> {
    let prefix = *data.first()?;
    match prefix {
        0xFF => {
            let bytes = data.get(1..9)?;
            Some((u64::from_le_bytes(bytes.try_into().ok()?), 9))
        }
        0xFE => {
            let bytes = data.get(1..5)?;
            Some((u32::from_le_bytes(bytes.try_into().ok()?) as u64, 5))
        }
        0xFD => {
            let bytes = data.get(1..3)?;
            Some((u16::from_le_bytes(bytes.try_into().ok()?) as u64, 3))
        }
        v => Some((v as u64, 1)),
    }
}
