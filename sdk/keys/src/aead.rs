use chacha20poly1305::{
    ChaCha20Poly1305,
    aead::{Aead, KeyInit, Payload},
};
use chacha20poly1305::aead::rand_core::{OsRng, RngCore};

use crate::error::{CryptoError, Result};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// A 256-bit symmetric key.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; KEY_LEN]);

/// Output of one AEAD seal: fresh nonce, ciphertext and detached tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

impl SymmetricKey {
    /// Draws a fresh key from the OS RNG.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Encrypts `plaintext` under a random nonce, binding `aad`.
    pub fn seal(&self, aad: &[u8], plaintext: &[u8]) -> Result<Sealed> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let cipher = ChaCha20Poly1305::new(&self.0.into());
        let encrypted = cipher
            .encrypt(
                &nonce.into(),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let split = encrypted.len() - TAG_LEN;
        let (ciphertext, tag) = encrypted.split_at(split);

        Ok(Sealed {
            nonce,
            ciphertext: ciphertext.to_vec(),
            tag: tag.try_into().map_err(|_| CryptoError::EncryptionFailed)?,
        })
    }

    pub fn open(&self, aad: &[u8], sealed: &Sealed) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(&self.0.into());

        let mut combined = sealed.ciphertext.clone();
        combined.extend_from_slice(&sealed.tag);

        cipher
            .decrypt(
                &sealed.nonce.into(),
                Payload {
                    msg: &combined,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKey").finish_non_exhaustive()
    }
}

impl Sealed {
    /// `nonce || ciphertext || tag`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_LEN + self.ciphertext.len() + TAG_LEN);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::DecryptionFailed);
        }
        let (nonce, rest) = bytes.split_at(NONCE_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);

        Ok(Self {
            nonce: nonce.try_into().map_err(|_| CryptoError::DecryptionFailed)?,
            ciphertext: ciphertext.to_vec(),
            tag: tag.try_into().map_err(|_| CryptoError::DecryptionFailed)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = SymmetricKey::generate();
        let sealed = key.seal(b"ctx", b"hello round").unwrap();
        assert_eq!(key.open(b"ctx", &sealed).unwrap(), b"hello round");
    }

    #[test]
    fn nonce_differs_per_seal() {
        let key = SymmetricKey::generate();
        let a = key.seal(b"", b"same").unwrap();
        let b = key.seal(b"", b"same").unwrap();
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn wrong_aad_fails() {
        let key = SymmetricKey::generate();
        let sealed = key.seal(b"a", b"payload").unwrap();
        assert_eq!(key.open(b"b", &sealed), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn bytes_layout_roundtrip() {
        let key = SymmetricKey::generate();
        let sealed = key.seal(b"", b"layout").unwrap();
        let bytes = sealed.to_bytes();
        assert_eq!(bytes.len(), NONCE_LEN + 6 + TAG_LEN);
        assert_eq!(Sealed::from_bytes(&bytes).unwrap(), sealed);
    }

    #[test]
    fn truncated_bytes_rejected() {
        assert_eq!(
            Sealed::from_bytes(&[0u8; 10]),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn debug_hides_key() {
        let key = SymmetricKey::from_bytes([7u8; 32]);
        assert!(!format!("{:?}", key).contains('7'));
    }
}
