use thiserror::Error;

use crate::types::ShapeMismatch;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregationError {
    #[error("no collections to aggregate")]
    EmptyAggregationSet,

    #[error(transparent)]
    ShapeMismatch(#[from] ShapeMismatch),

    #[error("invalid scales: {0}")]
    InvalidScales(String),

    #[error("group size must be between 2 and {max}, got {0}", max = crate::shapley::MAX_GROUP_SIZE)]
    InvalidGroupSize(usize),

    /// The caller's evaluation function failed; attribution is abandoned
    #[error("evaluation failed: {0}")]
    EvaluationFailed(String),
}

pub type Result<T> = std::result::Result<T, AggregationError>;
