//! Pairwise key agreement and round-key wrapping.
//!
//! ```text
//!  coordinator                         participant
//!  ───────────                         ───────────
//!  CryptoSession (x25519)              CryptoSession (x25519)
//!        │  ◄──── participant pk (ledger) ────┤
//!        ├───── owner pk (ledger) ──────────► │
//!  derive() ─► SharedSecret            derive() ─► SharedSecret   (equal)
//!  wrap_key(round key) ── hex ──► ledger ──► unwrap_key()
//! ```

pub mod aead;
pub mod error;
pub mod session;
pub mod wrap;

pub use aead::{Sealed, SymmetricKey};
pub use error::{CryptoError, Result};
pub use session::{CryptoSession, SharedSecret, parse_public_key};
pub use wrap::{WrappedKey, unwrap_key, wrap_key};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_symmetric() {
        let a = CryptoSession::generate();
        let b = CryptoSession::generate();

        let ab = a.derive(&b.public_key_hex()).unwrap();
        let ba = b.derive(&a.public_key_hex()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn distinct_pairs_get_distinct_secrets() {
        let a = CryptoSession::generate();
        let b = CryptoSession::generate();
        let c = CryptoSession::generate();

        let ab = a.derive(&b.public_key_hex()).unwrap();
        let ac = a.derive(&c.public_key_hex()).unwrap();
        assert_ne!(ab, ac);
    }

    #[test]
    fn from_secret_is_deterministic() {
        let a = CryptoSession::from_secret([9u8; 32]);
        let b = CryptoSession::from_secret([9u8; 32]);
        assert_eq!(a.public_key_hex(), b.public_key_hex());
        assert_eq!(a.public_key_hex().len(), 64);
    }

    #[test]
    fn update_key_differs_from_wrap_key() {
        let a = CryptoSession::generate();
        let b = CryptoSession::generate();
        let s = a.derive(&b.public_key_hex()).unwrap();
        assert_ne!(s.update_key().unwrap(), s.wrap_key());
    }
}
