//! Scale-weighted federated averaging.
//!
//! result[i][j] = Σ_k scales[k] · collections[k][i][j] / Σ_k scales[k]
//!
//! Sums are accumulated in f64 and cast back to f32 once per parameter.

use crate::error::{AggregationError, Result};
use crate::types::WeightCollection;

pub fn aggregate(collections: &[WeightCollection], scales: &[f64]) -> Result<WeightCollection> {
    let Some(first) = collections.first() else {
        return Err(AggregationError::EmptyAggregationSet);
    };

    if scales.len() != collections.len() {
        return Err(AggregationError::InvalidScales(format!(
            "{} scales for {} collections",
            scales.len(),
            collections.len()
        )));
    }
    if let Some(bad) = scales.iter().find(|s| !s.is_finite() || **s <= 0.0) {
        return Err(AggregationError::InvalidScales(format!(
            "scale {bad} is not a positive finite number"
        )));
    }

    let shape = first.shape();
    for c in &collections[1..] {
        shape.check(c)?;
    }

    let total: f64 = scales.iter().sum();

    let layers = shape
        .0
        .iter()
        .enumerate()
        .map(|(i, &len)| {
            let mut acc = vec![0.0f64; len];
            for (c, &scale) in collections.iter().zip(scales) {
                for (a, &w) in acc.iter_mut().zip(&c.0[i]) {
                    *a += scale * w as f64;
                }
            }
            acc.into_iter().map(|a| (a / total) as f32).collect()
        })
        .collect();

    Ok(WeightCollection(layers))
}

/// Plain FedAvg: every collection weighs the same.
pub fn fedavg(collections: &[WeightCollection]) -> Result<WeightCollection> {
    aggregate(collections, &vec![1.0; collections.len()])
}
