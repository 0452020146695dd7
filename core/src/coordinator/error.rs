use fedledger_blob::BlobError;
use fedledger_keys::CryptoError;
use fedledger_weights::{AggregationError, ShapeMismatch};
use thiserror::Error;

use crate::ledger::LedgerError;
use crate::trainer::TrainerError;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error(transparent)]
    ShapeMismatch(#[from] ShapeMismatch),

    #[error("no participant update could be aggregated")]
    EmptyAggregationSet,

    #[error("ledger call failed: {0}")]
    LedgerCallFailed(#[from] LedgerError),

    #[error("object store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("blob: {0}")]
    Blob(BlobError),

    #[error("aggregation: {0}")]
    Aggregation(AggregationError),

    #[error("crypto: {0}")]
    Crypto(CryptoError),

    #[error(transparent)]
    Trainer(#[from] TrainerError),

    #[error("event stream closed")]
    EventStreamClosed,

    #[error("task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

impl From<CryptoError> for CoordinatorError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::InvalidKeyMaterial(msg) => Self::InvalidKeyMaterial(msg),
            CryptoError::DecryptionFailed => Self::DecryptionFailed,
            other => Self::Crypto(other),
        }
    }
}

impl From<BlobError> for CoordinatorError {
    fn from(e: BlobError) -> Self {
        match e {
            BlobError::StoreUnavailable(msg) => Self::StoreUnavailable(msg),
            BlobError::Crypto(c) => c.into(),
            BlobError::ShapeMismatch(m) => Self::ShapeMismatch(m),
            other => Self::Blob(other),
        }
    }
}

impl From<AggregationError> for CoordinatorError {
    fn from(e: AggregationError) -> Self {
        match e {
            AggregationError::EmptyAggregationSet => Self::EmptyAggregationSet,
            AggregationError::ShapeMismatch(m) => Self::ShapeMismatch(m),
            other => Self::Aggregation(other),
        }
    }
}

impl From<tokio::task::JoinError> for CoordinatorError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}
