use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use wincode::{SchemaRead, SchemaWrite};

pub const BLOB_VERSION_V1: u8 = 1;

/// Encrypted weight collection as it sits in the object store.
#[derive(Clone, Debug, PartialEq, SchemaRead, SchemaWrite)]
pub struct SealedBlobV1 {
    pub version: u8,
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; 16],
}

/// Lowercase hex SHA-256 of the stored bytes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentAddress(String);

impl ContentAddress {
    /// Accepts 64 hex characters, normalizing to lowercase.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        (s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()))
            .then(|| Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn blob_hash(bytes: &[u8]) -> ContentAddress {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    ContentAddress(hex::encode(hasher.finalize()))
}
