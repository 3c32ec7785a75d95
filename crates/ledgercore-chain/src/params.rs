// SPDX-License-Identifier: MIT

//! Network parameters (§10.7 of the expanded spec): the handful of
//! constants that differ between Bitcoin mainnet, testnet, and a
//! regression-test network. Passed into the validator façade at
//! construction — there is no CLI/config-file surface of its own (§6).

use ledgercore_common::prelude::Vec;
use ledgercore_common::BigUint;

use crate::block::Block;
use crate::block::BlockHeader;

/// Difficulty-retarget and subsidy parameters for one network.
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub genesis: Block,
    /// The loosest allowed proof-of-work target (compact form).
    pub pow_limit_bits: u32,
    /// Target number of seconds between retargets (2 weeks on mainnet).
    pub pow_target_timespan: u64,
    /// Target number of seconds between blocks (10 minutes on mainnet).
    pub pow_target_spacing: u64,
    /// Number of blocks between retargets (`pow_target_timespan /
    /// pow_target_spacing`, 2016 on mainnet).
    pub difficulty_adjustment_interval: u32,
    /// Whether `pow_limit_bits` applies unconditionally after a long gap
    /// between blocks (testnet's "allow minimum difficulty" rule). Not
    /// exercised by mainnet parameters.
    pub allow_min_difficulty_after_gap: bool,
    /// Number of blocks between subsidy halvings (210,000 on mainnet).
    pub subsidy_halving_interval: u32,
    /// Height at which BIP34 (coinbase must encode height) activates.
    pub bip34_height: u32,
}

impl ChainParams {
    /// Parameters for Bitcoin mainnet, as a worked-example configuration;
    /// the genesis block's transactions are intentionally left for the
    /// embedder to supply alongside the real genesis coinbase script,
    /// since hand-copying it here would be one more unverifiable
    /// hard-coded constant this crate cannot check without running a
    /// hasher against a known answer.
    pub fn mainnet(genesis: Block) -> Self {
        ChainParams {
            genesis,
            pow_limit_bits: 0x1d00ffff,
            pow_target_timespan: 14 * 24 * 60 * 60,
            pow_target_spacing: 10 * 60,
            difficulty_adjustment_interval: 2016,
            allow_min_difficulty_after_gap: false,
            subsidy_halving_interval: 210_000,
            bip34_height: 227_931,
        }
    }

    pub fn genesis_header(&self) -> &BlockHeader {
        &self.genesis.header
    }

    /// The block subsidy at `height`, in satoshis: 50 BTC halved every
    /// `subsidy_halving_interval` blocks, floored to zero once the reward
    /// has halved away entirely (mirrors Bitcoin Core's
    /// `GetBlockSubsidy`).
    pub fn subsidy_at_height(&self, height: u32) -> u64 {
        let halvings = height / self.subsidy_halving_interval;
        if halvings >= 64 {
            return 0;
        }
        (50 * ledgercore_common::COIN_VALUE) >> halvings
    }

    /// Whether `bits` is numerically no looser than `pow_limit_bits`,
    /// part of the "target within protocol bounds" header check (§4.4).
    pub fn bits_within_limit(&self, bits: u32) -> bool {
        let target = crate::work::expand_compact_target(bits);
        let limit = crate::work::expand_compact_target(self.pow_limit_bits);
        target.compare(&limit) != core::cmp::Ordering::Greater && !target.is_zero()
    }

    /// `CompactTarget::from_next_work_required`-style retarget (§6):
    /// given the timestamps bounding the last `difficulty_adjustment_interval`
    /// blocks, recomputes the next interval's target, clamped to a factor
    /// of four per Bitcoin Core's `CalculateNextWorkRequired`.
    pub fn next_work_required(&self, first_block_time: u32, last_bits: u32, last_block_time: u32) -> u32 {
        let mut actual_timespan = last_block_time.saturating_sub(first_block_time) as u64;
        let min_timespan = self.pow_target_timespan / 4;
        let max_timespan = self.pow_target_timespan * 4;
        actual_timespan = actual_timespan.clamp(min_timespan, max_timespan);

        let target = crate::work::expand_compact_target(last_bits);
        let scaled_up = scale_by_u64(&target, actual_timespan);
        let (scaled, _) = scaled_up.div_rem(&BigUint::from_u64(self.pow_target_timespan));

        let limit = crate::work::expand_compact_target(self.pow_limit_bits);
        let bounded = if scaled.compare(&limit) == core::cmp::Ordering::Greater {
            limit
        } else {
            scaled
        };
        compact_from_target(&bounded)
    }
}

/// `value * multiplier`, built from the single-byte multiply primitive
/// (§4.1 restricts `BigUint` to byte-wise multiply/divide): multiplies by
/// each byte of `multiplier` in turn and accumulates the shifted partial
/// products, schoolbook-style.
fn scale_by_u64(value: &BigUint, multiplier: u64) -> BigUint {
    let mut total = BigUint::zero();
    for (i, byte) in multiplier.to_le_bytes().iter().enumerate() {
        if *byte == 0 {
            continue;
        }
        let mut partial = value.clone();
        partial.mul_u8_assign(*byte);
        partial.shl_assign((i as u32) * 8);
        total.add_assign(&partial);
    }
    total
}

/// The inverse of [`crate::work::expand_compact_target`]: packs a target
/// back into the 32-bit compact (`nBits`) form.
fn compact_from_target(target: &BigUint) -> u32 {
    let be = target.to_bytes_be_fixed(32);
    let first_nonzero = be.iter().position(|&b| b != 0);
    let Some(first_nonzero) = first_nonzero else {
        return 0;
    };
    let mut size = (32 - first_nonzero) as u32;
    let mut mantissa_bytes: Vec<u8> = be[first_nonzero..].to_vec();
    // If the high bit of the first mantissa byte is set, it would be
    // misread as the sign bit; shift the window right by one byte and
    // bump the size, matching Bitcoin Core's `arith_uint256::GetCompact`.
    if mantissa_bytes[0] & 0x80 != 0 {
        mantissa_bytes.insert(0, 0);
        size += 1;
    }
    mantissa_bytes.truncate(3);
    while mantissa_bytes.len() < 3 {
        mantissa_bytes.push(0);
    }
    let mantissa = ((mantissa_bytes[0] as u32) << 16)
        | ((mantissa_bytes[1] as u32) << 8)
        | (mantissa_bytes[2] as u32);
    (size << 24) | mantissa
}
