use thiserror::Error;

/// Errors raised by key agreement and sealing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Public key bytes are malformed or yield a non-contributory exchange
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// Ciphertext failed authentication or is truncated
    #[error("decryption failed")]
    DecryptionFailed,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("key derivation failed")]
    KeyDerivation,
}

pub type Result<T> = std::result::Result<T, CryptoError>;
