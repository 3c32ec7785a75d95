// SPDX-License-Identifier: MIT

//! A deterministic reference implementation of [`crate::deps::Crypto`] and
//! [`crate::deps::Clock`], for this workspace's own tests. Gated behind
//! `test-utils`; not wired up anywhere by default. A production embedder
//! brings its own, exactly as cbitcoin's `CBSha256`/`CBEcdsaVerify` weak
//! symbols were resolved by whoever linked the final binary.

use ripemd::Digest as _;
use ripemd::Ripemd160;
use secp256k1::ecdsa::Signature;
use secp256k1::Message;
use secp256k1::PublicKey;
use secp256k1::SECP256K1;
use sha1::Sha1;
use sha2::Sha256;

use crate::deps::Clock;
use crate::deps::Crypto;

/// `sha2`/`sha1`/`ripemd`/`secp256k1` backed [`Crypto`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceCrypto;

impl Crypto for ReferenceCrypto {
    fn sha256(&self, data: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn sha1(&self, data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn ripemd160(&self, data: &[u8]) -> [u8; 20] {
        let mut hasher = Ripemd160::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn ecdsa_verify(&self, signature: &[u8], hash: &[u8; 32], pubkey: &[u8]) -> bool {
        let Ok(sig) = Signature::from_der(signature) else {
            return false;
        };
        let Ok(msg) = Message::from_digest_slice(hash) else {
            return false;
        };
        let Ok(key) = PublicKey::from_slice(pubkey) else {
            return false;
        };
        SECP256K1.verify_ecdsa(&msg, &sig, &key).is_ok()
    }
}

/// Reads the system clock through `std::time::SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock is before the Unix epoch")
            .as_secs()
    }
}

/// A clock that always returns a fixed time, for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub u64);

impl Clock for FixedClock {
    fn now_unix(&self) -> u64 {
        self.0
    }
}
