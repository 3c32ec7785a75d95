// SPDX-License-Identifier: MIT

//! Compact-target expansion and chain-work accounting (§6, §4.1, glossary
//! entries "Target"/"Work").

use core::cmp::Ordering;

use ledgercore_common::prelude::Vec;
use ledgercore_common::BigUint;

/// Expands a 32-bit compact target (`nBits`) to its full value:
/// `256^(c>>24 - 3) * (c & 0x00FFFFFF)` (§6).
///
/// Mirrors Bitcoin Core's `arith_uint256::SetCompact`: a negative-bit or
/// overflowing exponent/mantissa combination collapses to zero rather
/// than panicking, since a malicious or malformed header must fail the
/// ordinary "hash exceeds target" comparison, not crash the validator.
pub fn expand_compact_target(bits: u32) -> BigUint {
    let exponent = (bits >> 24) as i32;
    let mut mantissa = bits & 0x007f_ffff;

    // The 0x00800000 bit of the mantissa is the sign bit in Bitcoin
    // Core's encoding; a negative target is invalid and expands to zero.
    if bits & 0x0080_0000 != 0 {
        return BigUint::zero();
    }
    if mantissa == 0 {
        return BigUint::zero();
    }

    if exponent <= 3 {
        let shift = (3 - exponent) * 8;
        mantissa >>= shift.min(24);
        return BigUint::from_u64(mantissa as u64);
    }

    let mut value = BigUint::from_u64(mantissa as u64);
    let shift_bytes = (exponent - 3) as u32;
    if shift_bytes > 32 {
        // Larger than any value a 256-bit target could hold.
        return BigUint::zero();
    }
    value.shl_assign(shift_bytes * 8);
    value
}

/// The largest value a 256-bit unsigned integer can hold, `2^256 - 1`.
fn max_u256() -> BigUint {
    BigUint::from_bytes_le(vec![0xff; 32])
}

/// The proof-of-work "work" contributed by a block mined at `target`:
/// `floor(2^256 / (target + 1))`, computed as
/// `floor((2^256 - 1 - target) / (target + 1)) + 1` (the standard
/// `GetBlockProof` trick, which avoids needing a 257-bit numerator).
///
/// A zero target (malformed `bits`) contributes no work.
pub fn work_for_target(target: &BigUint) -> BigUint {
    if target.is_zero() {
        return BigUint::zero();
    }
    let mut target_plus_one = target.clone();
    target_plus_one.add_assign(&BigUint::from_u64(1));

    let mut numerator = max_u256();
    numerator.sub_assign(target);

    let (mut quotient, _remainder) = numerator.div_rem(&target_plus_one);
    quotient.add_assign(&BigUint::from_u64(1));
    quotient
}

/// Work contributed by a block whose header carries compact target
/// `bits`.
pub fn work_for_bits(bits: u32) -> BigUint {
    work_for_target(&expand_compact_target(bits))
}

/// Checks a block hash against its header's compact target (§4.4's header
/// check): the hash, read little-endian, must not exceed the expanded
/// target.
pub fn hash_meets_target(hash_le: &ledgercore_common::Hash256, bits: u32) -> bool {
    let target = expand_compact_target(bits);
    let hash_value = BigUint::from_bytes_le(hash_le.as_le_bytes().to_vec());
    hash_value.compare(&target) != Ordering::Greater
}
