//! Grouped Shapley attribution.
//!
//! Exact Shapley values need 2^n evaluations. Participants are instead split
//! into contiguous groups of `group_size`; each group is collapsed into one
//! aggregate, the groups are attributed against each other, and every group
//! is then attributed internally with its group value as multiplier:
//!
//! ```text
//!            [ p0 p1 | p2 p3 | p4 pad ]        pad = baseline copy
//!                 │       │        │
//!                g0      g1       g2           group level: sv(g0,g1,g2)
//!                 │       │        │
//!          sv(p0,p1)·g0  ...  sv(p4,pad)·g2    leaf level
//!                                   │
//!                  drop pad, rescale by 1/(1 - Σ sv(pad))
//! ```
//!
//! The base case (`n <= group_size`) enumerates every subset: bit `p` of the
//! subset index selects participant `p`, subset 0 evaluates the baseline.

use std::fmt::Display;

use tracing::{debug, warn};

use crate::error::{AggregationError, Result};
use crate::fedavg::aggregate;
use crate::types::WeightCollection;

/// Below this, `1 - Σ padding` is treated as zero.
const RENORMALIZE_EPSILON: f64 = 1e-12;

/// Largest accepted group size; the base case evaluates `2^group_size`
/// subsets.
pub const MAX_GROUP_SIZE: usize = 16;

/// Scores each contribution by its approximate Shapley value under `eval`.
///
/// `scales` weigh the contributions when subsets are aggregated; every
/// returned value is multiplied by `multiplier` (1 for a plain call).
pub fn attribute<F, E>(
    mut eval: F,
    baseline: &WeightCollection,
    contributions: &[WeightCollection],
    scales: &[f64],
    group_size: usize,
    multiplier: f64,
) -> Result<Vec<f64>>
where
    F: FnMut(&WeightCollection) -> std::result::Result<f64, E>,
    E: Display,
{
    if !(2..=MAX_GROUP_SIZE).contains(&group_size) {
        return Err(AggregationError::InvalidGroupSize(group_size));
    }
    if scales.len() != contributions.len() {
        return Err(AggregationError::InvalidScales(format!(
            "{} scales for {} contributions",
            scales.len(),
            contributions.len()
        )));
    }
    if contributions.is_empty() {
        return Ok(Vec::new());
    }

    let shape = baseline.shape();
    for c in contributions {
        shape.check(c)?;
    }

    dtree(
        &mut eval,
        baseline,
        contributions.to_vec(),
        scales.to_vec(),
        group_size,
        multiplier,
    )
}

fn dtree<F, E>(
    eval: &mut F,
    baseline: &WeightCollection,
    mut models: Vec<WeightCollection>,
    mut scales: Vec<f64>,
    group_size: usize,
    multiplier: f64,
) -> Result<Vec<f64>>
where
    F: FnMut(&WeightCollection) -> std::result::Result<f64, E>,
    E: Display,
{
    let n = models.len();
    if n <= group_size {
        return exact(eval, baseline, &models, &scales, multiplier);
    }

    let padding = (group_size - n % group_size) % group_size;
    if padding > 0 {
        let last = scales[n - 1];
        models.extend(std::iter::repeat_n(baseline.clone(), padding));
        scales.extend(std::iter::repeat_n(last, padding));
    }

    let groups = models.len() / group_size;
    debug!(participants = n, groups, padding, "attributing by group");

    let mut group_models = Vec::with_capacity(groups);
    let mut group_scales: Vec<f64> = Vec::with_capacity(groups);
    for (members, member_scales) in models
        .chunks(group_size)
        .zip(scales.chunks(group_size))
    {
        group_models.push(aggregate(members, member_scales)?);
        group_scales.push(member_scales.iter().sum());
    }

    let group_values = dtree(
        eval,
        baseline,
        group_models,
        group_scales,
        group_size,
        multiplier,
    )?;

    let mut sv = Vec::with_capacity(models.len());
    for ((members, member_scales), group_value) in models
        .chunks(group_size)
        .zip(scales.chunks(group_size))
        .zip(group_values)
    {
        sv.extend(dtree(
            eval,
            baseline,
            members.to_vec(),
            member_scales.to_vec(),
            group_size,
            group_value,
        )?);
    }

    if padding > 0 {
        let added: f64 = sv[n..].iter().sum();
        let remaining = 1.0 - added;
        if remaining.abs() > RENORMALIZE_EPSILON {
            let eta = 1.0 / remaining;
            sv.iter_mut().for_each(|v| *v *= eta);
        } else {
            warn!(added, "padding absorbs all value, skipping renormalization");
        }
        sv.truncate(n);
    }

    Ok(sv)
}

fn exact<F, E>(
    eval: &mut F,
    baseline: &WeightCollection,
    models: &[WeightCollection],
    scales: &[f64],
    multiplier: f64,
) -> Result<Vec<f64>>
where
    F: FnMut(&WeightCollection) -> std::result::Result<f64, E>,
    E: Display,
{
    let n = models.len();
    let subsets = 1usize << n;

    let mut utility = vec![0.0f64; subsets];
    for (x, u) in utility.iter_mut().enumerate() {
        *u = if x == 0 {
            evaluate(eval, baseline)?
        } else {
            let (members, member_scales): (Vec<_>, Vec<_>) = (0..n)
                .filter(|p| x >> p & 1 == 1)
                .map(|p| (models[p].clone(), scales[p]))
                .unzip();
            evaluate(eval, &aggregate(&members, &member_scales)?)?
        };
    }

    let norm = (1usize << (n - 1)) as f64;
    let sv = (0..n)
        .map(|c| {
            let bit = 1usize << c;
            let gain: f64 = (0..subsets)
                .filter(|x| x & bit != 0)
                .map(|x| utility[x] - utility[x ^ bit])
                .sum();
            gain / norm * multiplier
        })
        .collect();

    Ok(sv)
}

fn evaluate<F, E>(eval: &mut F, weights: &WeightCollection) -> Result<f64>
where
    F: FnMut(&WeightCollection) -> std::result::Result<f64, E>,
    E: Display,
{
    eval(weights).map_err(|e| AggregationError::EvaluationFailed(e.to_string()))
}
