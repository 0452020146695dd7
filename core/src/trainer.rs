//! Training collaborator.
//!
//! Every method is synchronous and may be CPU-heavy; async callers run them
//! under `tokio::task::spawn_blocking`.

use fedledger_weights::{ModelShape, WeightCollection};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("trainer: {0}")]
pub struct TrainerError(pub String);

pub trait Trainer: Send + Sync + 'static {
    fn model_shape(&self) -> ModelShape;

    /// Serialized model architecture, stored in the clear.
    fn export_architecture(&self) -> Vec<u8>;

    fn import_architecture(&self, bytes: &[u8]) -> Result<ModelShape, TrainerError>;

    /// Local training step starting from `global`.
    fn train(&self, global: &WeightCollection) -> Result<WeightCollection, TrainerError>;

    /// Score of `weights` on this party's data; higher is better.
    fn evaluate(&self, weights: &WeightCollection) -> Result<f64, TrainerError>;
}

const ARCHITECTURE_PREFIX: &str = "linear:";
const SAMPLES: usize = 32;

/// Linear regression `y = w·x + b` fitted by full-batch gradient descent.
///
/// Weights are laid out as two layers: `[w_0 .. w_{d-1}]` and `[b]`. The
/// dataset is synthetic and fully determined by `(dims, seed)`, so different
/// seeds give different local datasets drawn from the same target.
#[derive(Debug, Clone)]
pub struct LinearTrainer {
    dims: usize,
    samples: Vec<(Vec<f32>, f32)>,
    learning_rate: f32,
    epochs: usize,
}

impl LinearTrainer {
    pub fn new(dims: usize, seed: u64) -> Self {
        let samples = (0..SAMPLES)
            .map(|i| {
                let x: Vec<f32> = (0..dims)
                    .map(|j| {
                        let v = (i as u64 * 7 + j as u64 * 13 + seed * 31) % 17;
                        v as f32 / 8.0 - 1.0
                    })
                    .collect();
                let y = x
                    .iter()
                    .enumerate()
                    .map(|(j, xj)| 0.5 * (j + 1) as f32 * xj)
                    .sum::<f32>()
                    + 1.0;
                (x, y)
            })
            .collect();

        Self {
            dims,
            samples,
            learning_rate: 0.1,
            epochs: 5,
        }
    }

    fn predict(weights: &WeightCollection, x: &[f32]) -> f32 {
        let layers = weights.layers();
        let dot: f32 = layers[0].iter().zip(x).map(|(w, x)| w * x).sum();
        dot + layers[1][0]
    }

    fn mse(&self, weights: &WeightCollection) -> f64 {
        let total: f64 = self
            .samples
            .iter()
            .map(|(x, y)| {
                let err = (Self::predict(weights, x) - y) as f64;
                err * err
            })
            .sum();
        total / self.samples.len() as f64
    }

    fn check(&self, weights: &WeightCollection) -> Result<(), TrainerError> {
        self.model_shape()
            .check(weights)
            .map_err(|e| TrainerError(e.to_string()))
    }
}

impl Trainer for LinearTrainer {
    fn model_shape(&self) -> ModelShape {
        ModelShape::new([self.dims, 1])
    }

    fn export_architecture(&self) -> Vec<u8> {
        format!("{ARCHITECTURE_PREFIX}{}", self.dims).into_bytes()
    }

    fn import_architecture(&self, bytes: &[u8]) -> Result<ModelShape, TrainerError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| TrainerError("architecture is not utf-8".into()))?;
        let dims: usize = text
            .strip_prefix(ARCHITECTURE_PREFIX)
            .and_then(|d| d.parse().ok())
            .ok_or_else(|| TrainerError(format!("unrecognized architecture {text:?}")))?;
        if dims != self.dims {
            return Err(TrainerError(format!(
                "architecture has {dims} inputs, trainer has {}",
                self.dims
            )));
        }
        Ok(ModelShape::new([dims, 1]))
    }

    fn train(&self, global: &WeightCollection) -> Result<WeightCollection, TrainerError> {
        self.check(global)?;

        let mut weights = global.clone();
        let n = self.samples.len() as f32;
        for _ in 0..self.epochs {
            let mut grad_w = vec![0.0f32; self.dims];
            let mut grad_b = 0.0f32;
            for (x, y) in &self.samples {
                let err = Self::predict(&weights, x) - y;
                for (g, xj) in grad_w.iter_mut().zip(x) {
                    *g += err * xj;
                }
                grad_b += err;
            }

            let layers = weights.layers_mut();
            for (w, g) in layers[0].iter_mut().zip(&grad_w) {
                *w -= self.learning_rate * 2.0 * g / n;
            }
            layers[1][0] -= self.learning_rate * 2.0 * grad_b / n;
        }
        Ok(weights)
    }

    fn evaluate(&self, weights: &WeightCollection) -> Result<f64, TrainerError> {
        self.check(weights)?;
        Ok(1.0 / (1.0 + self.mse(weights)))
    }
}
