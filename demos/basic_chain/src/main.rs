// SPDX-License-Identifier: MIT

//! A worked example driving [`ledgercore::Validator`] end to end: genesis,
//! a short linear extension, a competing side branch, the reorg that
//! follows once the side branch pulls ahead on work, and an orphan that
//! arrives before its parent and is attached once the parent does.
//!
//! Run with `cargo run -p basic-chain-demo`.

use ledgercore::chain::merkle::merkle_root;
use ledgercore::common::test_utils::FixedClock;
use ledgercore::common::test_utils::ReferenceCrypto;
use ledgercore::{
    Block, BlockHeader, BlockProcessStatus, ChainParams, Crypto, Dependencies, Hash256,
    MemoryChainStore, OutPoint, SigHasher, Transaction, TracingLogger, TxIn, TxOut, Validator,
    ValidatorFlags,
};

/// The sighash protocol is out of scope for this crate (§6); this demo's
/// coinbase-only blocks never execute `OP_CHECKSIG`, so the callback is
/// simply never invoked. A real embedder supplies BIP143/legacy hashing.
struct NoSignatureChecks;

impl SigHasher for NoSignatureChecks {
    fn sighash(&self, _tx: &Transaction, _input_index: usize, _sub_script: &[u8], _hash_type: u8) -> [u8; 32] {
        [0u8; 32]
    }
}

fn dependencies() -> Dependencies {
    Dependencies {
        crypto: Box::new(ReferenceCrypto),
        clock: Box::new(FixedClock(1_700_000_000)),
        logger: Box::new(TracingLogger),
        sighasher: Box::new(NoSignatureChecks),
    }
}

fn coinbase(height: u32, extra_nonce: u8) -> Transaction {
    Transaction {
        version: 1,
        input: vec![TxIn {
            previous_output: OutPoint::COINBASE,
            script_sig: vec![height as u8, extra_nonce],
            sequence: 0xFFFF_FFFF,
        }],
        output: vec![TxOut {
            value: 50_0000_0000,
            script_pubkey: vec![0xac],
        }],
        lock_time: 0,
    }
}

fn block(prev_hash: Hash256, height: u32, time: u32, extra_nonce: u8) -> Block {
    let crypto = ReferenceCrypto;
    let tx = coinbase(height, extra_nonce);
    let mut header = BlockHeader {
        version: 1,
        prev_hash,
        merkle_root: Hash256::ZERO,
        time,
        // A trivially loose target: this demo cares about branch/reorg
        // behaviour, not proof-of-work search, so the validator is opened
        // with `DISABLE_POW_CHECK` below.
        bits: 0x207fffff,
        nonce: 0,
    };
    header.merkle_root = merkle_root(&[tx.txid(&crypto)], &crypto);
    Block {
        header,
        transactions: vec![tx],
    }
}

fn report(label: &str, status: &BlockProcessStatus) {
    println!("{label}: {status:?}");
}

fn main() {
    let crypto = ReferenceCrypto;
    let genesis = block(Hash256::ZERO, 0, 1_600_000_000, 0);
    let params = ChainParams::mainnet(genesis.clone());

    let mut validator = Validator::new(
        dependencies(),
        Box::new(MemoryChainStore::new()),
        params,
        ValidatorFlags::DISABLE_POW_CHECK,
    )
    .expect("opening a fresh validator over an empty store cannot fail");

    // A short linear extension of the main branch.
    let a1 = block(genesis.block_hash(&crypto), 1, 1_600_000_600, 0);
    let status = validator.process_block(&a1, 1_700_000_000).unwrap();
    report("block a1 (extends main)", &status);

    let a2 = block(a1.block_hash(&crypto), 2, 1_600_001_200, 0);
    let status = validator.process_block(&a2, 1_700_000_000).unwrap();
    report("block a2 (extends main)", &status);

    // A competing block at the same height as a2, forking off a1: this
    // opens a side branch without yet reorganising the main chain.
    let b2 = block(a1.block_hash(&crypto), 2, 1_600_001_300, 1);
    let status = validator.process_block(&b2, 1_700_000_000).unwrap();
    report("block b2 (side branch)", &status);

    // Extending the side branch past the main branch's accumulated work
    // triggers a reorg: b2/b3 become the new main chain, a2 is demoted.
    let b3 = block(b2.block_hash(&crypto), 3, 1_600_001_900, 1);
    let status = validator.process_block(&b3, 1_700_000_000).unwrap();
    report("block b3 (triggers reorg)", &status);

    // c5's parent, c4, is built but deliberately not submitted yet.
    let c4 = block(b3.block_hash(&crypto), 4, 1_600_002_500, 2);
    let c5 = block(c4.block_hash(&crypto), 5, 1_600_003_100, 2);

    // Submitting c5 first caches it as an orphan: its parent is unknown.
    let status = validator.process_block(&c5, 1_700_000_000).unwrap();
    report("block c5 (orphan, parent unknown)", &status);
    println!("orphan cache occupancy: {}", validator.orphan_count());

    // Submitting c4 attaches it to the main tip and drains c5 off the
    // orphan cache in the same call.
    let status = validator.process_block(&c4, 1_700_000_000).unwrap();
    report("block c4 (parent arrives, c5 attaches)", &status);
    println!("orphan cache occupancy: {}", validator.orphan_count());

    println!("main branch: {:?}", validator.branches().main_branch());
}
