// SPDX-License-Identifier: MIT

//! The block data model and its bit-exact serialisation (§3, §6).

use ledgercore_common::prelude::Vec;
use ledgercore_common::BlockHash;
use ledgercore_common::Crypto;

use crate::encoding::take;
use crate::encoding::Decode;
use crate::encoding::DecodeError;
use crate::encoding::Encode;
use crate::merkle::merkle_root;
use crate::transaction::Transaction;
use crate::varint::decode_var_int;
use crate::varint::encode_var_int;

/// The 80-byte block header (§3, §6): everything proof-of-work and the
/// header chain need, independent of the block's transaction list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_hash: BlockHash,
    pub merkle_root: ledgercore_common::Hash256,
    pub time: u32,
    /// Compact (`nBits`) encoding of the proof-of-work target (§6).
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Double-SHA-256 of the 80-byte header; the block's identity.
    pub fn block_hash(&self, crypto: &dyn Crypto) -> BlockHash {
        BlockHash(crypto.sha256d(&self.encode()))
    }
}

impl Encode for BlockHeader {
    fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(self.prev_hash.as_le_bytes());
        out.extend_from_slice(self.merkle_root.as_le_bytes());
        out.extend_from_slice(&self.time.to_le_bytes());
        out.extend_from_slice(&self.bits.to_le_bytes());
        out.extend_from_slice(&self.nonce.to_le_bytes());
    }
}

impl Decode for BlockHeader {
    fn decode_from(data: &[u8]) -> Result<(Self, usize), DecodeError> {
        let (version_bytes, rest) = take(data, 4)?;
        let (prev_hash_bytes, rest) = take(rest, 32)?;
        let (merkle_root_bytes, rest) = take(rest, 32)?;
        let (time_bytes, rest) = take(rest, 4)?;
        let (bits_bytes, rest) = take(rest, 4)?;
        let (nonce_bytes, _) = take(rest, 4)?;

        let mut prev_hash = [0u8; 32];
        prev_hash.copy_from_slice(prev_hash_bytes);
        let mut merkle = [0u8; 32];
        merkle.copy_from_slice(merkle_root_bytes);

        Ok((
            BlockHeader {
                version: i32::from_le_bytes(version_bytes.try_into().unwrap()),
                prev_hash: BlockHash(prev_hash),
                merkle_root: ledgercore_common::Hash256(merkle),
                time: u32::from_le_bytes(time_bytes.try_into().unwrap()),
                bits: u32::from_le_bytes(bits_bytes.try_into().unwrap()),
                nonce: u32::from_le_bytes(nonce_bytes.try_into().unwrap()),
            },
            80,
        ))
    }
}

/// A full block: a header plus its transaction list (§3). The first
/// transaction, by convention, is the coinbase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn block_hash(&self, crypto: &dyn Crypto) -> BlockHash {
        self.header.block_hash(crypto)
    }

    /// Recomputes the Merkle root over this block's transactions, for
    /// comparison against `header.merkle_root` (§4.4's basic block check).
    pub fn computed_merkle_root(&self, crypto: &dyn Crypto) -> ledgercore_common::Hash256 {
        let txids: Vec<_> = self.transactions.iter().map(|tx| tx.txid(crypto)).collect();
        merkle_root(&txids, crypto)
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }
}

impl Encode for Block {
    fn encode_to(&self, out: &mut Vec<u8>) {
        self.header.encode_to(out);
        encode_var_int(self.transactions.len() as u64, out);
        for tx in &self.transactions {
            tx.encode_to(out);
        }
    }
}

impl Decode for Block {
    fn decode_from(data: &[u8]) -> Result<(Self, usize), DecodeError> {
        let (header, mut offset) = BlockHeader::decode_from(data)?;
        let (tx_count, consumed) =
            decode_var_int(&data[offset..]).ok_or(DecodeError::UnexpectedEof)?;
        offset += consumed;
        let tx_count = usize::try_from(tx_count).map_err(|_| DecodeError::InvalidLength)?;
        let mut transactions = Vec::with_capacity(tx_count.min(4096));
        for _ in 0..tx_count {
            let (tx, consumed) = Transaction::decode_from(&data[offset..])?;
            offset += consumed;
            transactions.push(tx);
        }
        Ok((
            Block {
                header,
                transactions,
            },
            offset,
        ))
    }
}
