use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use chacha20poly1305::aead::rand_core::OsRng;

use crate::aead::{KEY_LEN, SymmetricKey};
use crate::error::{CryptoError, Result};

const PAIRWISE_INFO: &[u8] = b"fedledger-pairwise-v1";
const UPDATE_INFO: &[u8] = b"fedledger-update-v1";

/// Long-lived X25519 key pair of one party (coordinator or participant).
///
/// The public half travels through the ledger as 64 hex characters.
pub struct CryptoSession {
    secret: StaticSecret,
    public: PublicKey,
}

impl CryptoSession {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.as_bytes())
    }

    /// Derives the pairwise secret shared with the holder of `counterparty_hex`.
    ///
    /// salt = H(min(pk_a, pk_b) || max(pk_a, pk_b)), so either side gets the
    /// same output.
    pub fn derive(&self, counterparty_hex: &str) -> Result<SharedSecret> {
        let counterparty = parse_public_key(counterparty_hex)?;
        let dh = self.secret.diffie_hellman(&PublicKey::from(counterparty));
        if !dh.was_contributory() {
            return Err(CryptoError::InvalidKeyMaterial(
                "non-contributory key exchange".into(),
            ));
        }

        let own = self.public.to_bytes();
        let (lo, hi) = if own <= counterparty {
            (own, counterparty)
        } else {
            (counterparty, own)
        };
        let mut hasher = Sha256::new();
        hasher.update(lo);
        hasher.update(hi);
        let salt = hasher.finalize();

        let hk = Hkdf::<Sha256>::new(Some(&salt), dh.as_bytes());
        let mut okm = [0u8; KEY_LEN];
        hk.expand(PAIRWISE_INFO, &mut okm)
            .map_err(|_| CryptoError::KeyDerivation)?;

        Ok(SharedSecret(okm))
    }
}

impl std::fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoSession")
            .field("public", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Output of [`CryptoSession::derive`].
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret([u8; KEY_LEN]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Key used to wrap round keys for this pair.
    pub fn wrap_key(&self) -> SymmetricKey {
        SymmetricKey::from_bytes(self.0)
    }

    /// Separate key for sealing participant updates, so the same key never
    /// encrypts both wrapped keys and model data.
    pub fn update_key(&self) -> Result<SymmetricKey> {
        let hk = Hkdf::<Sha256>::from_prk(&self.0).map_err(|_| CryptoError::KeyDerivation)?;
        let mut okm = [0u8; KEY_LEN];
        hk.expand(UPDATE_INFO, &mut okm)
            .map_err(|_| CryptoError::KeyDerivation)?;
        Ok(SymmetricKey::from_bytes(okm))
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecret").finish_non_exhaustive()
    }
}

/// Decodes a hex public key; anything but 32 bytes is rejected.
pub fn parse_public_key(hex_str: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_str.trim())
        .map_err(|e| CryptoError::InvalidKeyMaterial(format!("bad hex: {e}")))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        CryptoError::InvalidKeyMaterial(format!("expected 32 bytes, got {}", b.len()))
    })
}
