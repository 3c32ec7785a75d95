// SPDX-License-Identifier: MIT

//! The Merkle tree over a block's transaction hashes (§4.4's basic block
//! check: "Merkle root matches tree over tx hashes").

use ledgercore_common::prelude::Vec;
use ledgercore_common::Crypto;
use ledgercore_common::Hash256;

/// Computes the Merkle root of `hashes` by repeatedly pairing and
/// `HASH256`-ing adjacent elements, duplicating the last element of an
/// odd-length level (the historical Bitcoin convention — also the root
/// cause of CVE-2012-2459, which this core does not attempt to detect or
/// special-case, matching the reference behaviour it re-implements).
///
/// Returns the zero hash for an empty input; a single input returns
/// itself unchanged.
pub fn merkle_root(hashes: &[Hash256], crypto: &dyn Crypto) -> Hash256 {
    if hashes.is_empty() {
        return Hash256::ZERO;
    }
    let mut level: Vec<Hash256> = hashes.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().unwrap());
        }
        let mut next = Vec::with_capacity(level.len() / 2);
        for pair in level.chunks_exact(2) {
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(pair[0].as_le_bytes());
            buf[32..].copy_from_slice(pair[1].as_le_bytes());
            next.push(Hash256(crypto.sha256d(&buf)));
        }
        level = next;
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use ledgercore_common::test_utils::ReferenceCrypto;

    use super::*;

    #[test]
    fn empty_input_is_zero_hash() {
        let crypto = ReferenceCrypto;
        assert_eq!(merkle_root(&[], &crypto), Hash256::ZERO);
    }

    #[test]
    fn single_hash_is_its_own_root() {
        let crypto = ReferenceCrypto;
        let h = Hash256([9u8; 32]);
        assert_eq!(merkle_root(&[h], &crypto), h);
    }

    #[test]
    fn two_hashes_combine_via_hash256() {
        let crypto = ReferenceCrypto;
        let a = Hash256([1u8; 32]);
        let b = Hash256([2u8; 32]);
        let mut buf = [0u8; 64];
        buf[..32].copy_from_slice(a.as_le_bytes());
        buf[32..].copy_from_slice(b.as_le_bytes());
        let expected = Hash256(crypto.sha256d(&buf));
        assert_eq!(merkle_root(&[a, b], &crypto), expected);
    }

    #[test]
    fn odd_count_duplicates_last_element() {
        let crypto = ReferenceCrypto;
        let a = Hash256([1u8; 32]);
        let b = Hash256([2u8; 32]);
        let c = Hash256([3u8; 32]);
        // Level 1: [a, b, c, c] -> pairs (a,b) (c,c)
        let ab = {
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(a.as_le_bytes());
            buf[32..].copy_from_slice(b.as_le_bytes());
            Hash256(crypto.sha256d(&buf))
        };
        let cc = {
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(c.as_le_bytes());
            buf[32..].copy_from_slice(c.as_le_bytes());
            Hash256(crypto.sha256d(&buf))
        };
        let expected = {
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(ab.as_le_bytes());
            buf[32..].copy_from_slice(cc.as_le_bytes());
            Hash256(crypto.sha256d(&buf))
        };
        assert_eq!(merkle_root(&[a, b, c], &crypto), expected);
    }
}
