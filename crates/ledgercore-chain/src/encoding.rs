// SPDX-License-Identifier: MIT

//! The bit-exact wire encoding shared by [`crate::block`] and
//! [`crate::transaction`] (§6). Kept as a small trait pair rather than
//! pulling in a general-purpose serialisation framework: every format
//! rule here is fixed by the protocol, nothing is ever derived.

use ledgercore_common::prelude::Vec;

/// A value with a fixed, protocol-defined byte encoding.
pub trait Encode {
    /// Appends `self`'s encoding to `out`.
    fn encode_to(&self, out: &mut Vec<u8>);

    /// Convenience wrapper around [`Encode::encode_to`].
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_to(&mut out);
        out
    }
}

/// The converse of [`Encode`]: parses a value from the front of a byte
/// slice, returning it along with the number of bytes consumed.
pub trait Decode: Sized {
    fn decode_from(data: &[u8]) -> Result<(Self, usize), DecodeError>;
}

/// A malformed or truncated encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Ran out of bytes before a field was fully read.
    UnexpectedEof,
    /// A var-int, script length, or count field was internally
    /// inconsistent (e.g. overflowed `usize`).
    InvalidLength,
}

impl core::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DecodeError::UnexpectedEof => write!(f, "unexpected end of input"),
            DecodeError::InvalidLength => write!(f, "invalid length field"),
        }
    }
}

impl std::error::Error for DecodeError {}

pub(crate) fn take<'a>(data: &'a [u8], len: usize) -> Result<(&'a [u8], &'a [u8]), DecodeError> {
    if data.len() < len {
        return Err(DecodeError::UnexpectedEof);
    }
    Ok((&data[..len], &data[len..]))
}

/// Reads a var-int prefixed byte string (used for scripts).
pub(crate) fn decode_var_bytes(data: &[u8]) -> Result<(Vec<u8>, usize), DecodeError> {
    let (len, len_size) = crate::varint::decode_var_int(data).ok_or(DecodeError::UnexpectedEof)?;
    let len = usize::try_from(len).map_err(|_| DecodeError::InvalidLength)?;
    let (bytes, _) = take(&data[len_size..], len)?;
    Ok((bytes.to_vec(), len_size + len))
}

pub(crate) fn encode_var_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    crate::varint::encode_var_int(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}
