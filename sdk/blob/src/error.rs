use fedledger_keys::CryptoError;
use fedledger_weights::ShapeMismatch;
use thiserror::Error;

use crate::types::ContentAddress;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BlobError {
    #[error("object store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("no object at {0}")]
    NotFound(ContentAddress),

    #[error("unsupported blob version {0}")]
    UnsupportedVersion(u8),

    #[error("blob serialization failed")]
    SerializationFailed,

    #[error("blob deserialization failed")]
    DeserializationFailed,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    ShapeMismatch(#[from] ShapeMismatch),
}

pub type Result<T> = std::result::Result<T, BlobError>;
