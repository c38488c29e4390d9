//! Reductions from interval logits to per-example margins.

use hullcert_core::{HullcertError, Result};
use hullcert_tensor::IntervalBoundedTensor;
use ndarray::{Array1, ArrayD, ArrayView2, Axis, Ix2};

fn as_2d<'a>(a: &'a ArrayD<f32>) -> Result<ArrayView2<'a, f32>> {
    a.view().into_dimensionality::<Ix2>().map_err(|_| {
        HullcertError::InvalidRequest(format!(
            "expected (batch, classes) logits, got shape {:?}",
            a.shape()
        ))
    })
}

fn logits_2d(output: &IntervalBoundedTensor) -> Result<(ArrayView2<'_, f32>, ArrayView2<'_, f32>)> {
    let (lower, upper) = (as_2d(&output.lower)?, as_2d(&output.upper)?);
    if lower.ncols() == 0 {
        return Err(HullcertError::InvalidRequest(
            "logits have no classes".into(),
        ));
    }
    Ok((lower, upper))
}

/// Worst-case pairwise logit spread per example: `max_i upper_i - min_j lower_j`.
///
/// With zero-width logits this is the plain `max(logits) - min(logits)`.
pub fn max_diff_norm(output: &IntervalBoundedTensor) -> Result<Array1<f32>> {
    let (lower, upper) = logits_2d(output)?;
    let hi = upper.map_axis(Axis(1), |row| {
        row.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    });
    let lo = lower.map_axis(Axis(1), |row| {
        row.iter().copied().fold(f32::INFINITY, f32::min)
    });
    Ok(hi - lo)
}

/// Certified separation of the labelled class: `lower_y - max_{j != y} upper_j`.
///
/// Positive means no point in the input region can flip the prediction.
pub fn true_class_margin(output: &IntervalBoundedTensor, labels: &Array1<usize>) -> Result<Array1<f32>> {
    let (lower, upper) = logits_2d(output)?;
    let (batch, classes) = lower.dim();
    if labels.len() != batch {
        return Err(HullcertError::shape_mismatch(&[batch], labels.shape()));
    }
    labels
        .iter()
        .enumerate()
        .map(|(i, &y)| {
            if y >= classes {
                return Err(HullcertError::InvalidRequest(format!(
                    "label {y} out of range for {classes} classes"
                )));
            }
            let competitor = upper
                .row(i)
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != y)
                .map(|(_, &u)| u)
                .fold(f32::NEG_INFINITY, f32::max);
            Ok(lower[[i, y]] - competitor)
        })
        .collect()
}
