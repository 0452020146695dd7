//! Model weights and the two algorithms a round runs over them:
//!
//! - [`fedavg`]: scale-weighted federated averaging of participant updates
//! - [`shapley`]: grouped, recursive Shapley approximation used to split
//!   incentives between participants

pub mod error;
pub mod fedavg;
pub mod shapley;
pub mod types;

pub use error::{AggregationError, Result};
pub use fedavg::{aggregate, fedavg};
pub use shapley::{MAX_GROUP_SIZE, attribute};
pub use types::{ModelShape, ShapeMismatch, WeightCollection};
