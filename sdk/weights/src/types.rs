use std::fmt;

use thiserror::Error;

/// Per-layer lengths fixed by the model architecture.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct ModelShape(pub Vec<usize>);

impl ModelShape {
    pub fn new(layers: impl Into<Vec<usize>>) -> Self {
        Self(layers.into())
    }

    pub fn layer_count(&self) -> usize {
        self.0.len()
    }

    pub fn param_count(&self) -> usize {
        self.0.iter().sum()
    }

    /// Fails unless `weights` has exactly this shape.
    pub fn check(&self, weights: &WeightCollection) -> Result<(), ShapeMismatch> {
        let found = weights.shape();
        if &found == self {
            Ok(())
        } else {
            Err(ShapeMismatch {
                expected: self.clone(),
                found,
            })
        }
    }
}

impl fmt::Display for ModelShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("shape mismatch: expected {expected}, found {found}")]
pub struct ShapeMismatch {
    pub expected: ModelShape,
    pub found: ModelShape,
}

/// Ordered sequence of flat f32 layers.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct WeightCollection(pub Vec<Vec<f32>>);

impl WeightCollection {
    pub fn new(layers: Vec<Vec<f32>>) -> Self {
        Self(layers)
    }

    pub fn zeros(shape: &ModelShape) -> Self {
        Self(shape.0.iter().map(|&len| vec![0.0; len]).collect())
    }

    pub fn shape(&self) -> ModelShape {
        ModelShape(self.0.iter().map(Vec::len).collect())
    }

    pub fn layers(&self) -> &[Vec<f32>] {
        &self.0
    }

    pub fn layers_mut(&mut self) -> &mut [Vec<f32>] {
        &mut self.0
    }

    /// Iterates every parameter in layer order.
    pub fn iter_params(&self) -> impl Iterator<Item = f32> + '_ {
        self.0.iter().flatten().copied()
    }
}

impl From<Vec<Vec<f32>>> for WeightCollection {
    fn from(layers: Vec<Vec<f32>>) -> Self {
        Self(layers)
    }
}
