// SPDX-License-Identifier: MIT

//! Re-exports the var-int codec from `ledgercore-common`, where it lives
//! because the big-integer type and the storage contract need no notion of
//! it but block/transaction serialisation (this crate) does.

pub use ledgercore_common::varint::decode_var_int;
pub use ledgercore_common::varint::encode_var_int;
pub use ledgercore_common::varint::encoded_len;
