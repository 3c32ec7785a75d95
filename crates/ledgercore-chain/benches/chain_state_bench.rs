// SPDX-License-Identifier: MIT

//! Benchmarks `Validator::process_block` extending the main branch over a
//! synthetic chain, against the on-disk [`FlatChainStore`] backend —
//! gated the same way as the teacher's own `chain_state_bench`
//! (`flat-chainstore` for the backend, `test-utils` for the reference
//! `Crypto`/`Clock` fixtures).

use criterion::criterion_group;
use criterion::criterion_main;
use criterion::BatchSize;
use criterion::Criterion;

use ledgercore_chain::block::Block;
use ledgercore_chain::block::BlockHeader;
use ledgercore_chain::params::ChainParams;
use ledgercore_chain::storage::FlatChainStore;
use ledgercore_chain::transaction::OutPoint;
use ledgercore_chain::transaction::Transaction;
use ledgercore_chain::transaction::TxIn;
use ledgercore_chain::transaction::TxOut;
use ledgercore_chain::validator::Dependencies;
use ledgercore_chain::validator::Validator;
use ledgercore_chain::validator::ValidatorFlags;
use ledgercore_common::test_utils::FixedClock;
use ledgercore_common::test_utils::ReferenceCrypto;
use ledgercore_common::Crypto;
use ledgercore_common::Hash256;
use ledgercore_common::TracingLogger;

struct NullSigHasher;
impl ledgercore_chain::script::sighash::SigHasher for NullSigHasher {
    fn sighash(&self, _tx: &Transaction, _input_index: usize, _sub_script: &[u8], _hash_type: u8) -> [u8; 32] {
        [0u8; 32]
    }
}

fn dependencies() -> Dependencies {
    Dependencies {
        crypto: Box::new(ReferenceCrypto),
        clock: Box::new(FixedClock(2_000_000_000)),
        logger: Box::new(TracingLogger),
        sighasher: Box::new(NullSigHasher),
    }
}

fn coinbase(height: u32) -> Transaction {
    Transaction {
        version: 1,
        input: vec![TxIn {
            previous_output: OutPoint::COINBASE,
            script_sig: vec![height as u8, (height >> 8) as u8],
            sequence: 0xFFFF_FFFF,
        }],
        output: vec![TxOut {
            value: 50_0000_0000,
            script_pubkey: vec![0xac],
        }],
        lock_time: 0,
    }
}

fn block(prev_hash: Hash256, height: u32, time: u32) -> Block {
    let crypto = ReferenceCrypto;
    let tx = coinbase(height);
    let mut header = BlockHeader {
        version: 1,
        prev_hash,
        merkle_root: Hash256::ZERO,
        time,
        bits: 0x207fffff,
        nonce: 0,
    };
    header.merkle_root = ledgercore_chain::merkle::merkle_root(&[tx.txid(&crypto)], &crypto);
    Block {
        header,
        transactions: vec![tx],
    }
}

/// Builds `n` blocks extending a fresh genesis, for the benchmark's setup
/// phase (excluded from the measured time by `criterion`'s batched setup).
fn synthetic_chain(n: u32) -> (Block, Vec<Block>) {
    let crypto = ReferenceCrypto;
    let genesis = block(Hash256::ZERO, 0, 1_600_000_000);
    let mut blocks = Vec::with_capacity(n as usize);
    let mut prev = genesis.clone();
    for height in 1..=n {
        let next = block(prev.block_hash(&crypto), height, 1_600_000_000 + height * 600);
        blocks.push(next.clone());
        prev = next;
    }
    (genesis, blocks)
}

fn bench_extend_main_branch(c: &mut Criterion) {
    let (genesis, blocks) = synthetic_chain(200);

    c.bench_function("process_block/extend_main_branch", |b| {
        b.iter_batched(
            || {
                let dir = tempfile::tempdir().expect("tempdir");
                let storage = FlatChainStore::open(dir.path()).expect("open flat store");
                let params = ChainParams::mainnet(genesis.clone());
                let validator = Validator::new(
                    dependencies(),
                    Box::new(storage),
                    params,
                    ValidatorFlags::DISABLE_POW_CHECK,
                )
                .expect("open validator");
                (dir, validator)
            },
            |(dir, mut validator)| {
                for block in &blocks {
                    let status = validator.process_block(block, 2_000_000_000).expect("process_block");
                    debug_assert!(matches!(
                        status,
                        ledgercore_chain::error::BlockProcessStatus::Main
                    ));
                }
                drop(validator);
                drop(dir);
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, bench_extend_main_branch);
criterion_main!(benches);
