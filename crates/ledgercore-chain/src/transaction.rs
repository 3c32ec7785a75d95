// SPDX-License-Identifier: MIT

//! The transaction data model and its bit-exact serialisation (§3, §6).

use ledgercore_common::prelude::Vec;
use ledgercore_common::Crypto;
use ledgercore_common::Txid;

use crate::encoding::decode_var_bytes;
use crate::encoding::encode_var_bytes;
use crate::encoding::take;
use crate::encoding::Decode;
use crate::encoding::DecodeError;
use crate::encoding::Encode;
use crate::varint::decode_var_int;
use crate::varint::encode_var_int;

/// A reference to the output an input spends: the producing transaction's
/// hash and an output index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutPoint {
    pub txid: Txid,
    pub index: u32,
}

impl OutPoint {
    /// The all-zero, index-`0xFFFFFFFF` marker a coinbase's sole input
    /// carries in place of a real previous output.
    pub const COINBASE: OutPoint = OutPoint {
        txid: Txid::ZERO,
        index: u32::MAX,
    };

    pub fn is_coinbase_marker(&self) -> bool {
        self.txid.is_zero() && self.index == u32::MAX
    }
}

impl Encode for OutPoint {
    fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.txid.as_le_bytes());
        out.extend_from_slice(&self.index.to_le_bytes());
    }
}

impl Decode for OutPoint {
    fn decode_from(data: &[u8]) -> Result<(Self, usize), DecodeError> {
        let (hash_bytes, rest) = take(data, 32)?;
        let (index_bytes, _) = take(rest, 4)?;
        let mut hash = [0u8; 32];
        hash.copy_from_slice(hash_bytes);
        let index = u32::from_le_bytes(index_bytes.try_into().unwrap());
        Ok((
            OutPoint {
                txid: Txid(hash),
                index,
            },
            36,
        ))
    }
}

/// One spend inside a transaction: which output it spends, the unlocking
/// script that proves the right to spend it, and a sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub previous_output: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl Encode for TxIn {
    fn encode_to(&self, out: &mut Vec<u8>) {
        self.previous_output.encode_to(out);
        encode_var_bytes(&self.script_sig, out);
        out.extend_from_slice(&self.sequence.to_le_bytes());
    }
}

impl Decode for TxIn {
    fn decode_from(data: &[u8]) -> Result<(Self, usize), DecodeError> {
        let (previous_output, mut offset) = OutPoint::decode_from(data)?;
        let (script_sig, consumed) = decode_var_bytes(&data[offset..])?;
        offset += consumed;
        let (seq_bytes, _) = take(&data[offset..], 4)?;
        let sequence = u32::from_le_bytes(seq_bytes.try_into().unwrap());
        offset += 4;
        Ok((
            TxIn {
                previous_output,
                script_sig,
                sequence,
            },
            offset,
        ))
    }
}

/// One new coin created by a transaction: an amount and the locking
/// script that must be satisfied to spend it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

impl Encode for TxOut {
    fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.value.to_le_bytes());
        encode_var_bytes(&self.script_pubkey, out);
    }
}

impl Decode for TxOut {
    fn decode_from(data: &[u8]) -> Result<(Self, usize), DecodeError> {
        let (value_bytes, rest) = take(data, 8)?;
        let value = u64::from_le_bytes(value_bytes.try_into().unwrap());
        let (script_pubkey, consumed) = decode_var_bytes(rest)?;
        Ok((
            TxOut {
                value,
                script_pubkey,
            },
            8 + consumed,
        ))
    }
}

/// A Bitcoin transaction (§3). No witness data: segregated witness is a
/// peer-to-peer relay optimisation layered on top of this serialisation,
/// and stays with the out-of-scope wire codec (§1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub input: Vec<TxIn>,
    pub output: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// A transaction is coinbase iff it has exactly one input and that
    /// input's previous output is the all-zero/`0xFFFFFFFF` marker.
    pub fn is_coinbase(&self) -> bool {
        self.input.len() == 1 && self.input[0].previous_output.is_coinbase_marker()
    }

    /// Double-SHA-256 of the serialisation; the transaction's identity.
    pub fn txid(&self, crypto: &dyn Crypto) -> Txid {
        Txid(crypto.sha256d(&self.encode()))
    }

    /// Sum of output values. Does not itself bound the result to
    /// `MAX_MONEY`; see `ledgercore_chain::validation`.
    pub fn total_output_value(&self) -> u64 {
        self.output.iter().map(|o| o.value).sum()
    }
}

impl Encode for Transaction {
    fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_le_bytes());
        encode_var_int(self.input.len() as u64, out);
        for input in &self.input {
            input.encode_to(out);
        }
        encode_var_int(self.output.len() as u64, out);
        for output in &self.output {
            output.encode_to(out);
        }
        out.extend_from_slice(&self.lock_time.to_le_bytes());
    }
}

impl Decode for Transaction {
    fn decode_from(data: &[u8]) -> Result<(Self, usize), DecodeError> {
        let (version_bytes, rest) = take(data, 4)?;
        let version = i32::from_le_bytes(version_bytes.try_into().unwrap());
        let mut offset = 4;

        let (input_count, consumed) =
            decode_var_int(&data[offset..]).ok_or(DecodeError::UnexpectedEof)?;
        offset += consumed;
        let input_count = usize::try_from(input_count).map_err(|_| DecodeError::InvalidLength)?;
        let mut input = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            let (txin, consumed) = TxIn::decode_from(&data[offset..])?;
            offset += consumed;
            input.push(txin);
        }

        let (output_count, consumed) =
            decode_var_int(&data[offset..]).ok_or(DecodeError::UnexpectedEof)?;
        offset += consumed;
        let output_count =
            usize::try_from(output_count).map_err(|_| DecodeError::InvalidLength)?;
        let mut output = Vec::with_capacity(output_count.min(1024));
        for _ in 0..output_count {
            let (txout, consumed) = TxOut::decode_from(&data[offset..])?;
            offset += consumed;
            output.push(txout);
        }

        let (lock_time_bytes, _) = take(&data[offset..], 4)?;
        let lock_time = u32::from_le_bytes(lock_time_bytes.try_into().unwrap());
        offset += 4;

        let _ = rest;
        Ok((
            Transaction {
                version,
                input,
                output,
                lock_time,
            },
            offset,
        ))
    }
}

#[cfg(test)]
mod tests {
    use ledgercore_common::test_utils::ReferenceCrypto;

    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid([7u8; 32]),
                    index: 3,
                },
                script_sig: vec![0x01, 0x02, 0x03],
                sequence: 0xFFFF_FFFF,
            }],
            output: vec![TxOut {
                value: 5_000_000_000,
                script_pubkey: vec![0x76, 0xa9, 0x14],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn roundtrips_through_encode_decode() {
        let tx = sample_tx();
        let bytes = tx.encode();
        let (decoded, consumed) = Transaction::decode_from(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, tx);
    }

    #[test]
    fn coinbase_input_is_recognised() {
        let mut tx = sample_tx();
        tx.input[0].previous_output = OutPoint::COINBASE;
        assert!(tx.is_coinbase());
        let not_coinbase = sample_tx();
        assert!(!not_coinbase.is_coinbase());
    }

    #[test]
    fn two_distinct_transactions_hash_differently() {
        let crypto = ReferenceCrypto;
        let a = sample_tx();
        let mut b = sample_tx();
        b.lock_time = 1;
        assert_ne!(a.txid(&crypto), b.txid(&crypto));
    }

    #[test]
    fn truncated_encoding_fails_to_decode() {
        let tx = sample_tx();
        let bytes = tx.encode();
        assert!(Transaction::decode_from(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn total_output_value_sums_outputs() {
        let mut tx = sample_tx();
        tx.output.push(TxOut {
            value: 1,
            script_pubkey: vec![],
        });
        assert_eq!(tx.total_output_value(), 5_000_000_001);
    }
}
