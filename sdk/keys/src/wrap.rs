//! Round-key wrapping.
//!
//! The coordinator seals the current round key under each participant's
//! pairwise secret and publishes the result on the ledger as hex:
//!
//! ```text
//! ┌────────────┬──────────────────────┬───────────┐
//! │ nonce (12) │ ciphertext (32)      │ tag (16)  │
//! └────────────┴──────────────────────┴───────────┘
//! ```

use crate::aead::{KEY_LEN, Sealed, SymmetricKey};
use crate::error::{CryptoError, Result};
use crate::session::SharedSecret;

const WRAP_AAD: &[u8] = b"fedledger-wrap-v1";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrappedKey(Sealed);

impl WrappedKey {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim()).map_err(|_| CryptoError::DecryptionFailed)?;
        Ok(Self(Sealed::from_bytes(&bytes)?))
    }
}

pub fn wrap_key(key: &SymmetricKey, secret: &SharedSecret) -> Result<WrappedKey> {
    let sealed = secret.wrap_key().seal(WRAP_AAD, key.as_bytes())?;
    Ok(WrappedKey(sealed))
}

pub fn unwrap_key(wrapped: &WrappedKey, secret: &SharedSecret) -> Result<SymmetricKey> {
    let plain = secret.wrap_key().open(WRAP_AAD, &wrapped.0)?;
    let bytes: [u8; KEY_LEN] = plain
        .try_into()
        .map_err(|_| CryptoError::DecryptionFailed)?;
    Ok(SymmetricKey::from_bytes(bytes))
}
